use crate::cloud::CloudError;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RolloverError {
    #[error(transparent)]
    Cloud(#[from] CloudError),

    #[error("services are not in ACTIVE status: {}", services.join(", "))]
    ServicesNotActive { services: Vec<String> },

    #[error(
        "cannot scale down below service capacity: {remaining} instance(s) would remain but `{service}` wants {desired}"
    )]
    BelowServiceCapacity {
        service: String,
        desired: i64,
        remaining: usize,
    },

    #[error("invalid selection `{0}`")]
    InvalidSelection(String),

    #[error("timed out after {secs}s waiting for {what}")]
    Timeout { what: String, secs: u64 },

    #[error("could not ssh into {ec2_id}")]
    SshUnreachable { ec2_id: String },

    #[error("remote command failed on {ec2_id}")]
    RemoteCommandFailed { ec2_id: String },

    #[error("invalid task name pattern `{0}`")]
    InvalidPattern(String),
}

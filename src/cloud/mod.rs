pub mod aws;

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};

/// ECS batch-describe APIs accept at most this many resources per call.
pub const DESCRIBE_BATCH: usize = 10;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CloudError {
    #[error("{op} failed: {cause}")]
    Api { op: &'static str, cause: String },

    #[error("query failed for {arn}: {reason}")]
    Scheduler { arn: String, reason: String },
}

impl CloudError {
    pub fn api<E: std::fmt::Display>(op: &'static str, cause: E) -> CloudError {
        CloudError::Api {
            op,
            cause: cause.to_string(),
        }
    }
}

/// EC2 side of a container host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ec2Instance {
    pub id: String,
    pub availability_zone: String,
    pub private_ip: Option<String>,
    pub launch_time: Option<DateTime<Utc>>,
}

/// An instance attached to the auto scaling group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsgMember {
    pub instance_id: String,
    pub availability_zone: String,
    pub lifecycle_state: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScalingActivity {
    pub start_time: Option<DateTime<Utc>>,
    pub progress: i32,
}

/// Scheduler side of a container host. `registered_*`/`remaining_*` carry the
/// raw resource accounting (CPU units, memory MiB); zero means the scheduler
/// did not report the resource.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ContainerInstance {
    pub id: String,
    pub ec2_instance_id: String,
    pub status: String,
    pub registered_cpu: i64,
    pub remaining_cpu: i64,
    pub registered_memory: i64,
    pub remaining_memory: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEvent {
    pub created_at: DateTime<Utc>,
    pub message: String,
}

/// Load balancer attachment of a service: a classic ELB name, a target group
/// ARN, or (unusually) both.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ServiceLoadBalancer {
    pub load_balancer_name: Option<String>,
    pub target_group_arn: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EcsService {
    pub id: String,
    pub task_definition: String,
    pub desired_count: i64,
    pub status: String,
    pub load_balancers: Vec<ServiceLoadBalancer>,
    pub events: Vec<ServiceEvent>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EcsTask {
    pub arn: String,
    pub task_definition: String,
    pub container_instance_id: Option<String>,
}

pub trait Ec2Api {
    fn describe(&self, ids: &[String]) -> Result<BTreeMap<String, Ec2Instance>, CloudError>;
    fn stop_and_await(&self, ids: &[String]) -> Result<(), CloudError>;
    fn terminate_and_await(&self, ids: &[String]) -> Result<(), CloudError>;
}

pub trait AsgApi {
    fn members(&self) -> Result<Vec<AsgMember>, CloudError>;
    fn detach(&self, ids: &[String], decrement_desired: bool) -> Result<Vec<ScalingActivity>, CloudError>;
    fn activities(&self) -> Result<Vec<ScalingActivity>, CloudError>;
}

pub trait EcsApi {
    fn list_hosts(&self) -> Result<Vec<String>, CloudError>;
    fn describe_hosts(&self, ids: &[String]) -> Result<BTreeMap<String, ContainerInstance>, CloudError>;
    fn list_services(&self) -> Result<Vec<String>, CloudError>;
    fn describe_services(&self, ids: &[String]) -> Result<BTreeMap<String, EcsService>, CloudError>;
    fn list_tasks(&self) -> Result<Vec<String>, CloudError>;
    fn describe_tasks(&self, arns: &[String]) -> Result<BTreeMap<String, EcsTask>, CloudError>;
    /// Force-deregisters the container instance so its tasks become orphaned
    /// and get rescheduled across the cluster.
    fn deregister_host(&self, id: &str) -> Result<(), CloudError>;
    /// EC2 instance ids of container instances currently in ACTIVE status.
    fn list_active_instance_ids(&self) -> Result<Vec<String>, CloudError>;
}

pub trait ClassicLbApi {
    /// Returns the instances still attached after deregistration.
    fn deregister(&self, name: &str, ec2_ids: &[String]) -> Result<Vec<String>, CloudError>;
    fn load_balancers_containing(&self, ec2_id: &str) -> Result<Vec<String>, CloudError>;
}

pub trait TargetGroupApi {
    fn deregister_targets(&self, arn: &str, ec2_ids: &[String]) -> Result<(), CloudError>;
    fn target_groups_containing(&self, ec2_id: &str) -> Result<Vec<String>, CloudError>;
}

pub trait RemoteExec {
    /// Runs a shell command on the instance out-of-band and reports whether it
    /// exited successfully within the deadline.
    fn run(&self, ec2_id: &str, command: &str, timeout: Duration) -> Result<bool, CloudError>;
}

/// Strips an ECS container instance ARN down to its bare id. Works for both
/// the legacy (`container-instance/<id>`) and the cluster-scoped
/// (`container-instance/<cluster>/<id>`) ARN formats.
pub fn container_instance_id(arn: &str) -> &str {
    arn.rsplit('/').next().unwrap_or(arn)
}

/// Strips an ECS service ARN down to the service name.
pub fn service_id(arn: &str) -> &str {
    arn.rsplit('/').next().unwrap_or(arn)
}

/// Family name of a task definition ARN, without the revision suffix.
pub fn task_definition_family(arn: &str) -> &str {
    let name = arn.rsplit_once("task-definition/").map_or(arn, |(_, id)| id);
    name.split_once(':').map_or(name, |(family, _)| family)
}

#[cfg(test)]
mod tests {
    use super::{container_instance_id, service_id, task_definition_family};

    #[test]
    fn test_arn_shortening() {
        assert_eq!(
            container_instance_id("arn:aws:ecs:us-west-1:123:container-instance/prod/deadbeef"),
            "deadbeef"
        );
        assert_eq!(container_instance_id("arn:aws:ecs:us-west-1:123:container-instance/deadbeef"), "deadbeef");
        assert_eq!(service_id("arn:aws:ecs:us-west-1:123:service/prod/web"), "web");
        assert_eq!(container_instance_id("already-short"), "already-short");
    }

    #[test]
    fn test_task_definition_family() {
        assert_eq!(task_definition_family("arn:aws:ecs:us-west-1:123:task-definition/web:42"), "web");
        assert_eq!(task_definition_family("web:42"), "web");
        assert_eq!(task_definition_family("web"), "web");
    }
}

pub mod alb;
pub mod asg;
pub mod ec2;
pub mod ecs;
pub mod elb;
pub mod exec;

use aws_config::BehaviorVersion;
use aws_types::SdkConfig;
use chrono::{DateTime, Utc};

use crate::runtime::block_on;

/// Resolves credentials and region through the standard environment and
/// credential chain. Nothing is read from tool-specific files.
pub fn sdk_config() -> SdkConfig {
    block_on(aws_config::defaults(BehaviorVersion::latest()).load())
}

pub(crate) fn to_utc(dt: &aws_smithy_types::DateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(dt.secs(), dt.subsec_nanos())
}

use std::fmt::{Display, Formatter};

use chrono::{DateTime, Utc};

use crate::cloud::{CloudError, Ec2Api, EcsApi};

/// Percentage reported when the scheduler did not register the resource.
pub const UTILIZATION_UNKNOWN: i32 = -1;

/// A container host as the operator sees it: the scheduler-side identity
/// joined with the EC2-side placement and utilization derived from the
/// scheduler's resource accounting. Snapshots are point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Host {
    pub ecs_id: String,
    pub ec2_id: String,
    pub availability_zone: String,
    pub private_ip: Option<String>,
    pub launch_time: Option<DateTime<Utc>>,
    pub cpu_used_pct: i32,
    pub mem_used_pct: i32,
}

impl Display for Host {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({} - {})", self.ecs_id, self.ec2_id, self.availability_zone)
    }
}

/// Share of a registered resource currently in use, rounded up.
fn utilization(registered: i64, remaining: i64) -> i32 {
    if registered <= 0 {
        return UTILIZATION_UNKNOWN;
    }
    (100.0 * (1.0 - remaining as f64 / registered as f64)).ceil() as i32
}

/// Joins the scheduler view of the cluster with the EC2 view. Both sides must
/// agree on the instance mapping; hosts whose EC2 instance cannot be
/// described are reported as an API error rather than silently dropped.
pub fn snapshot(ecs: &dyn EcsApi, ec2: &dyn Ec2Api) -> Result<Vec<Host>, CloudError> {
    let ecs_ids = ecs.list_hosts()?;
    let container_instances = ecs.describe_hosts(&ecs_ids)?;

    let ec2_ids: Vec<String> = container_instances.values().map(|c| c.ec2_instance_id.clone()).collect();
    let ec2_instances = ec2.describe(&ec2_ids)?;

    let mut hosts = Vec::with_capacity(ecs_ids.len());
    for ecs_id in &ecs_ids {
        let Some(container) = container_instances.get(ecs_id) else {
            continue;
        };
        let instance = ec2_instances.get(&container.ec2_instance_id).ok_or_else(|| {
            CloudError::api(
                "join cluster inventory",
                format!("EC2 instance {} of {} not found", container.ec2_instance_id, ecs_id),
            )
        })?;

        hosts.push(Host {
            ecs_id: container.id.clone(),
            ec2_id: container.ec2_instance_id.clone(),
            availability_zone: instance.availability_zone.clone(),
            private_ip: instance.private_ip.clone(),
            launch_time: instance.launch_time,
            cpu_used_pct: utilization(container.registered_cpu, container.remaining_cpu),
            mem_used_pct: utilization(container.registered_memory, container.remaining_memory),
        });
    }

    Ok(hosts)
}

#[cfg(test)]
mod tests {
    use super::{UTILIZATION_UNKNOWN, utilization};

    #[test]
    fn test_utilization_rounds_up() {
        assert_eq!(utilization(1024, 1024), 0);
        assert_eq!(utilization(1024, 0), 100);
        // 1/3 used rounds up to 34%
        assert_eq!(utilization(3072, 2048), 34);
    }

    #[test]
    fn test_utilization_unknown_when_unregistered() {
        assert_eq!(utilization(0, 512), UTILIZATION_UNKNOWN);
        assert_eq!(utilization(-5, 512), UTILIZATION_UNKNOWN);
    }
}

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use retry::OperationResult;
use retry::delay::Fixed;

use crate::cloud::{CloudError, EcsApi, EcsService, EcsTask, ServiceEvent};

pub const POLL_INTERVAL: Duration = Duration::from_secs(10);
/// The scheduler emits this into a service's event stream once running state
/// matches desired state and nothing is pending.
pub const STEADY_STATE_MESSAGE: &str = "has reached a steady state";

/// 600s deadline at the 10s poll interval.
pub const STEADY_STATE_ATTEMPTS: usize = 60;

/// A point-in-time view of every service and task in the cluster: which
/// services run on which host, and a per-service event cursor marking the
/// newest event already seen.
pub struct ServiceSnapshot {
    services: BTreeMap<String, EcsService>,
    cursors: BTreeMap<String, Option<ServiceEvent>>,
    host_services: BTreeMap<String, Vec<String>>,
}

impl ServiceSnapshot {
    /// Queries services and tasks back to back. Callers deregistering a host
    /// right after must do so immediately, so a deployment landing between
    /// the snapshot and the deregistration has the smallest possible window
    /// to go untracked.
    pub fn take(ecs: &dyn EcsApi) -> Result<ServiceSnapshot, CloudError> {
        let service_ids = ecs.list_services()?;
        let services = ecs.describe_services(&service_ids)?;
        let task_arns = ecs.list_tasks()?;
        let tasks = ecs.describe_tasks(&task_arns)?;

        let cursors = services
            .iter()
            .map(|(id, service)| (id.clone(), latest_event(&service.events)))
            .collect();

        Ok(ServiceSnapshot {
            host_services: map_host_services(&services, &tasks),
            services,
            cursors,
        })
    }

    pub fn service(&self, id: &str) -> Option<&EcsService> {
        self.services.get(id)
    }

    /// Service ids with at least one service-owned task on the host.
    pub fn services_on(&self, ecs_id: &str) -> &[String] {
        self.host_services.get(ecs_id).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn cursor(&self, service_id: &str) -> Option<&ServiceEvent> {
        self.cursors.get(service_id).and_then(Option::as_ref)
    }

    /// Moves the service's cursor forward. Events at or before the current
    /// cursor are ignored, so a steady-state event consumed for one host can
    /// never be attributed to a later one.
    pub fn advance_cursor(&mut self, service_id: &str, event: ServiceEvent) {
        let cursor = self.cursors.entry(service_id.to_string()).or_default();
        match cursor {
            Some(current) if event.created_at <= current.created_at => {}
            _ => *cursor = Some(event),
        }
    }
}

/// Maps each host to the services owning at least one task on it. Tasks whose
/// task definition matches no service are startup or ad-hoc tasks and are
/// ignored.
pub fn map_host_services(
    services: &BTreeMap<String, EcsService>,
    tasks: &BTreeMap<String, EcsTask>,
) -> BTreeMap<String, Vec<String>> {
    let def_to_service: BTreeMap<&str, &str> = services
        .iter()
        .map(|(id, service)| (service.task_definition.as_str(), id.as_str()))
        .collect();

    let mut host_services: BTreeMap<String, BTreeSet<&str>> = BTreeMap::new();
    for task in tasks.values() {
        let (Some(service_id), Some(host)) =
            (def_to_service.get(task.task_definition.as_str()), task.container_instance_id.as_ref())
        else {
            continue;
        };
        host_services.entry(host.clone()).or_default().insert(service_id);
    }

    host_services
        .into_iter()
        .map(|(host, ids)| (host, ids.into_iter().map(str::to_string).collect()))
        .collect()
}

pub fn latest_event(events: &[ServiceEvent]) -> Option<ServiceEvent> {
    events.iter().max_by_key(|e| e.created_at).cloned()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SteadyState {
    Reached(ServiceEvent),
    /// Deadline hit; carries the newest event observed so the caller can
    /// still advance its cursor.
    TimedOut(Option<ServiceEvent>),
}

enum PollError {
    NotYet(Option<ServiceEvent>),
    Cloud(CloudError),
}

/// Polls the service's event stream until an event newer than the cursor
/// declares a steady state. Events at or before the cursor belong to earlier
/// drains and are filtered out. `poll_interval` is 10s in production and only
/// shrinks under test.
pub fn await_steady_state(
    ecs: &dyn EcsApi,
    service_id: &str,
    cursor: Option<&ServiceEvent>,
    poll_interval: Duration,
) -> Result<SteadyState, CloudError> {
    let result = retry::retry(Fixed::from_millis(poll_interval.as_millis() as u64).take(STEADY_STATE_ATTEMPTS), || {
        let services = match ecs.describe_services(&[service_id.to_string()]) {
            Ok(services) => services,
            Err(e) => return OperationResult::Err(PollError::Cloud(e)),
        };

        let mut events: Vec<ServiceEvent> = services
            .get(service_id)
            .map(|s| s.events.clone())
            .unwrap_or_default();
        events.sort_by_key(|e| e.created_at);

        let steady = events.iter().find(|event| {
            let is_new = cursor.is_none_or(|c| event.created_at > c.created_at);
            is_new && event.message.contains(STEADY_STATE_MESSAGE)
        });

        match steady {
            Some(event) => OperationResult::Ok(event.clone()),
            None => OperationResult::Retry(PollError::NotYet(events.last().cloned())),
        }
    });

    match result {
        Ok(event) => Ok(SteadyState::Reached(event)),
        Err(retry::Error {
            error: PollError::NotYet(last_seen),
            ..
        }) => Ok(SteadyState::TimedOut(last_seen)),
        Err(retry::Error {
            error: PollError::Cloud(e),
            ..
        }) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn event(secs: i64, message: &str) -> ServiceEvent {
        ServiceEvent {
            created_at: Utc.timestamp_opt(secs, 0).unwrap(),
            message: message.to_string(),
        }
    }

    fn service(id: &str, task_definition: &str) -> EcsService {
        EcsService {
            id: id.to_string(),
            task_definition: task_definition.to_string(),
            status: "ACTIVE".to_string(),
            ..Default::default()
        }
    }

    fn task(arn: &str, task_definition: &str, host: Option<&str>) -> EcsTask {
        EcsTask {
            arn: arn.to_string(),
            task_definition: task_definition.to_string(),
            container_instance_id: host.map(str::to_string),
        }
    }

    fn snapshot_maps(
        services: Vec<EcsService>,
        tasks: Vec<EcsTask>,
    ) -> (BTreeMap<String, EcsService>, BTreeMap<String, EcsTask>) {
        (
            services.into_iter().map(|s| (s.id.clone(), s)).collect(),
            tasks.into_iter().map(|t| (t.arn.clone(), t)).collect(),
        )
    }

    #[test]
    fn test_map_host_services_ignores_ad_hoc_tasks() {
        let (services, tasks) = snapshot_maps(
            vec![service("web", "def/web:1"), service("worker", "def/worker:3")],
            vec![
                task("t1", "def/web:1", Some("c1")),
                task("t2", "def/worker:3", Some("c1")),
                task("t3", "def/startup:9", Some("c1")),
                task("t4", "def/web:1", Some("c2")),
            ],
        );

        let mapping = map_host_services(&services, &tasks);
        assert_eq!(mapping["c1"], vec!["web".to_string(), "worker".to_string()]);
        assert_eq!(mapping["c2"], vec!["web".to_string()]);
    }

    #[test]
    fn test_map_host_services_deduplicates() {
        // two replicas of the same service on one host count once, and a
        // second run over the same snapshot yields the same mapping
        let (services, tasks) = snapshot_maps(
            vec![service("web", "def/web:1")],
            vec![task("t1", "def/web:1", Some("c1")), task("t2", "def/web:1", Some("c1"))],
        );

        let first = map_host_services(&services, &tasks);
        assert_eq!(first["c1"], vec!["web".to_string()]);
        assert_eq!(map_host_services(&services, &tasks), first);
    }

    #[test]
    fn test_cursor_only_moves_forward() {
        let mut snapshot = ServiceSnapshot {
            services: BTreeMap::new(),
            cursors: BTreeMap::new(),
            host_services: BTreeMap::new(),
        };

        snapshot.advance_cursor("web", event(100, "steady"));
        assert_eq!(snapshot.cursor("web"), Some(&event(100, "steady")));

        // older or equal events never rewind the cursor
        snapshot.advance_cursor("web", event(50, "old"));
        snapshot.advance_cursor("web", event(100, "same"));
        assert_eq!(snapshot.cursor("web"), Some(&event(100, "steady")));

        snapshot.advance_cursor("web", event(101, "newer"));
        assert_eq!(snapshot.cursor("web"), Some(&event(101, "newer")));
    }

    #[test]
    fn test_latest_event() {
        assert_eq!(latest_event(&[]), None);
        let events = vec![event(3, "c"), event(1, "a"), event(2, "b")];
        assert_eq!(latest_event(&events), Some(event(3, "c")));
    }
}

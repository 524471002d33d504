use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::cloud::{AsgMember, EcsService};
use crate::errors::RolloverError;
use crate::inventory::Host;

/// Operator interaction seam. The CLI answers from stdin; tests script the
/// answers.
pub trait Prompt {
    fn input(&mut self, message: &str) -> String;
    fn confirm(&mut self, message: &str) -> bool;
}

/// Display order of the host list the operator picks from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "snake_case")]
pub enum SortKey {
    LaunchTime,
    Utilization,
}

pub fn sort_hosts(hosts: &mut [Host], key: SortKey) {
    match key {
        // oldest instances first, unknown launch times at the top
        SortKey::LaunchTime => hosts.sort_by_key(|h| h.launch_time),
        // busiest instances first
        SortKey::Utilization => hosts.sort_by_key(|h| Reverse(h.cpu_used_pct + h.mem_used_pct)),
    }
}

/// Parses the operator's selection: comma-separated indices and inclusive
/// `a-b` ranges into the displayed list. Duplicates are collapsed, order of
/// first mention is kept.
pub fn parse_selection(input: &str, len: usize) -> Result<Vec<usize>, RolloverError> {
    let invalid = || RolloverError::InvalidSelection(input.trim().to_string());

    let mut indices = Vec::new();
    for part in input.split(',') {
        let part = part.trim();
        match part.split_once('-') {
            Some((start, end)) => {
                let start: usize = start.trim().parse().map_err(|_| invalid())?;
                let end: usize = end.trim().parse().map_err(|_| invalid())?;
                if start > end {
                    return Err(invalid());
                }
                indices.extend(start..=end);
            }
            None => indices.push(part.parse().map_err(|_| invalid())?),
        }
    }

    if indices.iter().any(|&i| i >= len) {
        return Err(invalid());
    }

    let mut seen = BTreeSet::new();
    indices.retain(|i| seen.insert(*i));
    Ok(indices)
}

/// The ordered list of hosts to remove, plus everything the operator must be
/// warned about before confirming it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovalPlan {
    pub hosts: Vec<Host>,
    /// Selected hosts that are not attached to the ASG; they are removed but
    /// never replaced.
    pub not_in_asg: Vec<String>,
    /// Maximum pairwise difference of per-AZ instance counts across the
    /// post-removal ASG.
    pub max_diff: usize,
    /// AZs that still hold at least one instance after removal.
    pub populated_zones: usize,
}

impl RemovalPlan {
    /// Removing these hosts would leave the ASG unbalanced enough to trigger
    /// its own (destructive) AZ rebalancing.
    pub fn needs_balance_warning(&self) -> bool {
        self.max_diff > 1 || self.populated_zones == 1
    }
}

/// Orders the selected hosts so that each removal is taken from the currently
/// most populated AZ: bucket the selection by AZ, sort AZs by their remaining
/// (non-selected) ASG population descending, then round-robin over that AZ
/// order popping one host per visit. Keeps the post-removal distribution as
/// flat as the selection allows.
pub fn removal_order(selected: Vec<Host>, members: &[AsgMember]) -> RemovalPlan {
    let selected_ids: BTreeSet<&str> = selected.iter().map(|h| h.ec2_id.as_str()).collect();
    let member_ids: BTreeSet<&str> = members.iter().map(|m| m.instance_id.as_str()).collect();

    let not_in_asg = selected
        .iter()
        .filter(|h| !member_ids.contains(h.ec2_id.as_str()))
        .map(|h| h.ec2_id.clone())
        .collect();

    // remaining population per AZ; every AZ of the ASG is present, possibly
    // at zero
    let mut remaining: BTreeMap<String, usize> = BTreeMap::new();
    for member in members {
        let count = remaining.entry(member.availability_zone.clone()).or_insert(0);
        if !selected_ids.contains(member.instance_id.as_str()) {
            *count += 1;
        }
    }

    let mut to_remove: BTreeMap<String, VecDeque<Host>> = BTreeMap::new();
    for host in selected {
        to_remove.entry(host.availability_zone.clone()).or_default().push_back(host);
    }

    // visit order: most populated AZ first, alphabetical on ties
    let mut zones: Vec<String> = to_remove
        .keys()
        .chain(remaining.keys())
        .cloned()
        .collect::<BTreeSet<String>>()
        .into_iter()
        .collect();
    zones.sort_by_key(|az| Reverse(remaining.get(az).copied().unwrap_or(0)));

    let total: usize = to_remove.values().map(|q| q.len()).sum();
    let mut hosts = Vec::with_capacity(total);
    while hosts.len() < total {
        for az in &zones {
            if let Some(host) = to_remove.get_mut(az).and_then(|q| q.pop_front()) {
                hosts.push(host);
            }
        }
    }

    let max_diff = match (remaining.values().max(), remaining.values().min()) {
        (Some(max), Some(min)) if remaining.len() > 1 => max - min,
        _ => 0,
    };
    let populated_zones = remaining.values().filter(|&&count| count > 0).count();

    RemovalPlan {
        hosts,
        not_in_asg,
        max_diff,
        populated_zones,
    }
}

/// Every service must be ACTIVE before touching the fleet.
pub fn check_services_active(services: &BTreeMap<String, EcsService>) -> Result<(), RolloverError> {
    let inactive: Vec<String> = services
        .values()
        .filter(|s| s.status != "ACTIVE")
        .map(|s| s.id.clone())
        .collect();

    if inactive.is_empty() {
        Ok(())
    } else {
        Err(RolloverError::ServicesNotActive { services: inactive })
    }
}

/// A scale down must leave enough instances to place every replica of the
/// most demanding service.
pub fn check_scale_down_capacity(
    services: &BTreeMap<String, EcsService>,
    remaining_hosts: usize,
) -> Result<(), RolloverError> {
    let most_demanding = services.values().max_by_key(|s| s.desired_count);
    match most_demanding {
        Some(service) if (remaining_hosts as i64) < service.desired_count => {
            Err(RolloverError::BelowServiceCapacity {
                service: service.id.clone(),
                desired: service.desired_count,
                remaining: remaining_hosts,
            })
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::RolloverError;

    fn host(ecs_id: &str, ec2_id: &str, az: &str) -> Host {
        Host {
            ecs_id: ecs_id.to_string(),
            ec2_id: ec2_id.to_string(),
            availability_zone: az.to_string(),
            private_ip: Some("10.0.0.1".to_string()),
            launch_time: None,
            cpu_used_pct: 0,
            mem_used_pct: 0,
        }
    }

    fn member(ec2_id: &str, az: &str) -> AsgMember {
        AsgMember {
            instance_id: ec2_id.to_string(),
            availability_zone: az.to_string(),
            lifecycle_state: "InService".to_string(),
        }
    }

    #[test]
    fn test_parse_selection() {
        assert_eq!(parse_selection("1,2,4", 6).unwrap(), vec![1, 2, 4]);
        assert_eq!(parse_selection("1-3", 6).unwrap(), vec![1, 2, 3]);
        assert_eq!(parse_selection("0, 2-4, 2", 6).unwrap(), vec![0, 2, 3, 4]);
    }

    #[test]
    fn test_parse_selection_rejects_garbage() {
        assert!(matches!(parse_selection("a", 6), Err(RolloverError::InvalidSelection(_))));
        assert!(matches!(parse_selection("3-1", 6), Err(RolloverError::InvalidSelection(_))));
        assert!(matches!(parse_selection("7", 6), Err(RolloverError::InvalidSelection(_))));
        assert!(matches!(parse_selection("", 6), Err(RolloverError::InvalidSelection(_))));
    }

    #[test]
    fn test_removal_order_round_robins_over_zones() {
        // two hosts selected in each of three AZs, ASG fully selected
        let selected = vec![
            host("c1", "i-1", "us-west-1a"),
            host("c2", "i-2", "us-west-1a"),
            host("c3", "i-3", "us-west-1b"),
            host("c4", "i-4", "us-west-1b"),
            host("c5", "i-5", "us-west-1c"),
            host("c6", "i-6", "us-west-1c"),
        ];
        let members: Vec<AsgMember> = selected
            .iter()
            .map(|h| member(&h.ec2_id, &h.availability_zone))
            .collect();

        let plan = removal_order(selected, &members);
        let order: Vec<&str> = plan.hosts.iter().map(|h| h.ecs_id.as_str()).collect();
        assert_eq!(order, vec!["c1", "c3", "c5", "c2", "c4", "c6"]);
        assert!(plan.not_in_asg.is_empty());
    }

    #[test]
    fn test_removal_order_drains_largest_zone_first() {
        // b keeps 2 instances, a keeps 1: removals must start in b
        let selected = vec![host("c1", "i-1", "us-west-1a"), host("c2", "i-2", "us-west-1b")];
        let members = vec![
            member("i-1", "us-west-1a"),
            member("i-2", "us-west-1b"),
            member("i-3", "us-west-1a"),
            member("i-4", "us-west-1b"),
            member("i-5", "us-west-1b"),
        ];

        let plan = removal_order(selected, &members);
        let order: Vec<&str> = plan.hosts.iter().map(|h| h.ecs_id.as_str()).collect();
        assert_eq!(order, vec!["c2", "c1"]);
        assert_eq!(plan.max_diff, 1);
        assert!(!plan.needs_balance_warning());
    }

    #[test]
    fn test_removal_plan_flags_imbalance() {
        let selected = vec![host("c1", "i-1", "us-west-1a"), host("c2", "i-2", "us-west-1a")];
        let members = vec![
            member("i-1", "us-west-1a"),
            member("i-2", "us-west-1a"),
            member("i-3", "us-west-1a"),
            member("i-4", "us-west-1b"),
            member("i-5", "us-west-1b"),
            member("i-6", "us-west-1b"),
        ];

        // a drops to 1 while b stays at 3
        let plan = removal_order(selected, &members);
        assert_eq!(plan.max_diff, 2);
        assert!(plan.needs_balance_warning());
    }

    #[test]
    fn test_removal_plan_flags_single_zone() {
        let selected = vec![host("c1", "i-1", "us-west-1a")];
        let members = vec![member("i-1", "us-west-1a"), member("i-2", "us-west-1a")];

        let plan = removal_order(selected, &members);
        assert_eq!(plan.max_diff, 0);
        assert!(plan.needs_balance_warning());
    }

    #[test]
    fn test_removal_plan_reports_hosts_outside_asg() {
        let selected = vec![host("c1", "i-1", "us-west-1a"), host("c2", "i-99", "us-west-1b")];
        let members = vec![member("i-1", "us-west-1a"), member("i-2", "us-west-1a")];

        let plan = removal_order(selected, &members);
        assert_eq!(plan.not_in_asg, vec!["i-99".to_string()]);
        // the stray host is still part of the removal order
        assert_eq!(plan.hosts.len(), 2);
    }

    #[test]
    fn test_removal_order_never_degrades_balance_by_more_than_one() {
        // P3: walking any prefix of the plan, the spread across AZs never
        // exceeds the initial spread by more than 1
        let selected = vec![
            host("c1", "i-1", "us-west-1a"),
            host("c2", "i-2", "us-west-1b"),
            host("c3", "i-3", "us-west-1b"),
            host("c4", "i-4", "us-west-1c"),
        ];
        let members = vec![
            member("i-1", "us-west-1a"),
            member("i-2", "us-west-1b"),
            member("i-3", "us-west-1b"),
            member("i-4", "us-west-1c"),
            member("i-5", "us-west-1a"),
            member("i-6", "us-west-1b"),
            member("i-7", "us-west-1c"),
        ];

        let mut counts: BTreeMap<&str, i64> = BTreeMap::new();
        for m in &members {
            *counts.entry(m.availability_zone.as_str()).or_insert(0) += 1;
        }
        let spread = |counts: &BTreeMap<&str, i64>| {
            counts.values().max().unwrap_or(&0) - counts.values().min().unwrap_or(&0)
        };
        let initial = spread(&counts);

        let plan = removal_order(selected.clone(), &members);
        for h in &plan.hosts {
            *counts.get_mut(h.availability_zone.as_str()).unwrap() -= 1;
            assert!(spread(&counts) <= initial + 1, "prefix unbalanced: {counts:?}");
        }
    }

    #[test]
    fn test_check_services_active() {
        let mut services = BTreeMap::new();
        services.insert("web".to_string(), EcsService {
            id: "web".to_string(),
            status: "ACTIVE".to_string(),
            ..Default::default()
        });
        assert!(check_services_active(&services).is_ok());

        services.insert("worker".to_string(), EcsService {
            id: "worker".to_string(),
            status: "DRAINING".to_string(),
            ..Default::default()
        });
        assert_eq!(
            check_services_active(&services),
            Err(RolloverError::ServicesNotActive {
                services: vec!["worker".to_string()]
            })
        );
    }

    #[test]
    fn test_check_scale_down_capacity() {
        let mut services = BTreeMap::new();
        services.insert("web".to_string(), EcsService {
            id: "web".to_string(),
            desired_count: 2,
            status: "ACTIVE".to_string(),
            ..Default::default()
        });

        assert!(check_scale_down_capacity(&services, 2).is_ok());
        assert_eq!(
            check_scale_down_capacity(&services, 1),
            Err(RolloverError::BelowServiceCapacity {
                service: "web".to_string(),
                desired: 2,
                remaining: 1,
            })
        );
    }
}

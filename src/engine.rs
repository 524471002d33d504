use std::io::Write as _;
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::cloud::{AsgApi, AsgMember, ClassicLbApi, Ec2Api, EcsApi, RemoteExec, ScalingActivity, TargetGroupApi};
use crate::errors::RolloverError;
use crate::inventory::{self, Host};
use crate::selection::{self, Prompt, SortKey};
use crate::tracker::{self, POLL_INTERVAL, ServiceSnapshot, SteadyState};

/// 300s deadline at the 10s poll interval.
pub const REPLACEMENT_ATTEMPTS: usize = 30;

const SSH_PROBE_TIMEOUT: Duration = Duration::from_secs(30);
const DOCKER_PREFLIGHT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Rollover,
    ScaleDown,
}

/// The cloud capabilities the engine drives. Everything is behind a trait so
/// runs can be replayed against fakes.
pub struct CloudApis<'a> {
    pub ecs: &'a dyn EcsApi,
    pub ec2: &'a dyn Ec2Api,
    pub asg: &'a dyn AsgApi,
    pub classic_lb: &'a dyn ClassicLbApi,
    pub target_groups: &'a dyn TargetGroupApi,
    pub exec: &'a dyn RemoteExec,
}

pub struct RolloverOptions {
    pub mode: Mode,
    pub dry_run: bool,
    /// `docker stop` timeout, seconds.
    pub stop_timeout: u32,
    pub sort: SortKey,
    /// 10s in production; tests shrink it so deadline paths stay fast.
    pub poll_interval: Duration,
}

impl RolloverOptions {
    pub fn new(mode: Mode) -> Self {
        RolloverOptions {
            mode,
            dry_run: false,
            stop_timeout: 30,
            sort: SortKey::LaunchTime,
            poll_interval: POLL_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RolloverSummary {
    /// Hosts fully drained and terminated, in removal order.
    pub removed: Vec<String>,
    /// Hosts whose container shutdown could not be attempted; their instances
    /// are deliberately left running.
    pub skipped_shutdown: Vec<String>,
    pub warnings: usize,
    /// The operator backed out at a confirmation prompt.
    pub aborted: bool,
}

enum HostOutcome {
    Removed,
    SkippedShutdown,
}

pub struct RolloverEngine<'a> {
    apis: CloudApis<'a>,
    opts: RolloverOptions,
}

fn progress(message: &str) {
    print!("{message}...");
    let _ = std::io::stdout().flush();
}

fn done() {
    println!("done");
}

impl<'a> RolloverEngine<'a> {
    pub fn new(apis: CloudApis<'a>, opts: RolloverOptions) -> Self {
        RolloverEngine { apis, opts }
    }

    pub fn run(&self, prompt: &mut dyn Prompt) -> Result<RolloverSummary, RolloverError> {
        let mut summary = RolloverSummary::default();

        if self.opts.dry_run {
            println!("############## DRY RUN MODE ##############");
            println!();
        }

        let mut hosts = inventory::snapshot(self.apis.ecs, self.apis.ec2)?;
        if hosts.is_empty() {
            println!("The cluster has no container instances.");
            return Ok(summary);
        }
        debug!("{} container instances, displaying by {}", hosts.len(), self.opts.sort);
        selection::sort_hosts(&mut hosts, self.opts.sort);

        match self.opts.mode {
            Mode::Rollover => println!("Which instances do you want to rollover?"),
            Mode::ScaleDown => println!("Which instances do you want to remove?"),
        }
        for (index, host) in hosts.iter().enumerate() {
            println!("{index}\t - {host}");
        }

        let line = prompt.input("Specify the indices - comma-separated (ex. \"1,2,4\") or inclusive range (ex. \"7-11\"): ");
        let indices = selection::parse_selection(&line, hosts.len())?;
        let selected: Vec<Host> = indices.into_iter().map(|i| hosts[i].clone()).collect();

        let mut members = self.apis.asg.members()?;
        let plan = selection::removal_order(selected, &members);
        for ec2_id in &plan.not_in_asg {
            println!("WARNING: {ec2_id} is not in the AutoScalingGroup. It will not be replaced");
        }

        // preconditions, before any mutation
        let service_ids = self.apis.ecs.list_services()?;
        let services = self.apis.ecs.describe_services(&service_ids)?;
        selection::check_services_active(&services)?;
        if self.opts.mode == Mode::ScaleDown {
            let remaining = hosts.len().saturating_sub(plan.hosts.len());
            selection::check_scale_down_capacity(&services, remaining)?;
        }

        println!("About to remove the following instances:");
        for host in &plan.hosts {
            println!("{host}");
        }
        if plan.needs_balance_warning() {
            println!(
                "WARNING: The instances you selected will cause the auto scaling \
                 group to rebalance instances across availability zones. This \
                 will result in a destructive operation."
            );
        }

        if !prompt.confirm("Do you want to continue [y/N]? ") {
            summary.aborted = true;
            return Ok(summary);
        }

        // make sure non-interactive ssh works before mutating anything
        if let Some(first) = plan.hosts.first() {
            progress("Testing ssh ");
            let reachable = self
                .apis
                .exec
                .run(&first.ec2_id, r#"echo "test""#, SSH_PROBE_TIMEOUT)
                .unwrap_or(false);
            if !reachable {
                println!("FAILED");
                println!(
                    "You may need to configure your network and/or ssh settings to \
                     allow for non-interactive access to your EC2 machines."
                );
                return Err(RolloverError::SshUnreachable {
                    ec2_id: first.ec2_id.clone(),
                });
            }
            done();
        }

        for host in &plan.hosts {
            println!("Preparing to remove {host}");
            match self.remove_host(host, &mut members, &mut summary)? {
                HostOutcome::Removed => summary.removed.push(host.ecs_id.clone()),
                HostOutcome::SkippedShutdown => summary.skipped_shutdown.push(host.ecs_id.clone()),
            }
            println!();
        }

        if !summary.skipped_shutdown.is_empty() {
            println!("Container shutdown was skipped on the following instances, they were NOT terminated:");
            for ecs_id in &summary.skipped_shutdown {
                println!("{ecs_id}");
            }
        }
        match self.opts.mode {
            Mode::Rollover => println!("Rollover complete!"),
            Mode::ScaleDown => println!("Scale down complete!"),
        }
        if summary.warnings > 0 {
            println!("NOTE: Some errors were encountered.");
        }

        Ok(summary)
    }

    /// Drives one host through the removal pipeline: detach, await
    /// replacement, snapshot, deregister, await steady state, drain load
    /// balancers, stop containers, terminate.
    fn remove_host(
        &self,
        host: &Host,
        members: &mut Vec<AsgMember>,
        summary: &mut RolloverSummary,
    ) -> Result<HostOutcome, RolloverError> {
        let in_asg = members.iter().any(|m| m.instance_id == host.ec2_id);

        // detach from the scaling group; a scale down gives up the capacity,
        // a rollover keeps desired capacity so a replacement gets launched
        let mut detach_activities = Vec::new();
        if in_asg {
            progress("Removing EC2 instance from scaling group");
            if !self.opts.dry_run {
                detach_activities = self
                    .apis
                    .asg
                    .detach(&[host.ec2_id.clone()], self.opts.mode == Mode::ScaleDown)?;
            }
            done();
        }

        if in_asg && self.opts.mode == Mode::Rollover {
            progress("Waiting for replacement instance to join the cluster");
            if !self.opts.dry_run {
                let replacement = self.await_replacement(members, &detach_activities)?;
                println!("done ({replacement})");
            } else {
                done();
            }
        }

        // Query services and tasks just before deregistering. A deployment
        // scheduled onto this instance between the snapshot and the
        // deregistration would not be tracked, so nothing may run in between.
        let mut snapshot = ServiceSnapshot::take(self.apis.ecs)?;

        progress("De-registering instance from the cluster");
        if !self.opts.dry_run {
            self.apis.ecs.deregister_host(&host.ecs_id)?;
        }
        done();

        let services_on_host = snapshot.services_on(&host.ecs_id).to_vec();
        if !services_on_host.is_empty() {
            progress("Rolling over services");
            if !self.opts.dry_run {
                for service_id in &services_on_host {
                    let cursor = snapshot.cursor(service_id).cloned();
                    let outcome =
                        tracker::await_steady_state(self.apis.ecs, service_id, cursor.as_ref(), self.opts.poll_interval)?;
                    match outcome {
                        SteadyState::Reached(event) => snapshot.advance_cursor(service_id, event),
                        SteadyState::TimedOut(last_seen) => {
                            println!("TIMEOUT");
                            println!("Timeout hit while waiting for {service_id} to reach steady state");
                            if let Some(event) = last_seen {
                                snapshot.advance_cursor(service_id, event);
                            }
                            return Err(RolloverError::Timeout {
                                what: format!("service {service_id} to reach a steady state"),
                                secs: (tracker::STEADY_STATE_ATTEMPTS as u64) * self.opts.poll_interval.as_secs(),
                            });
                        }
                    }
                }
            }
            done();

            progress("Removing instance from any service load balancers");
            let mut drain_warnings = Vec::new();
            if !self.opts.dry_run {
                for service_id in &services_on_host {
                    let Some(service) = snapshot.service(service_id) else { continue };
                    for lb in &service.load_balancers {
                        if let Some(name) = &lb.load_balancer_name {
                            if let Err(e) = self.apis.classic_lb.deregister(name, &[host.ec2_id.clone()]) {
                                drain_warnings.push(format!("could not deregister {} from {name}: {e}", host.ec2_id));
                            }
                        }
                        if let Some(arn) = &lb.target_group_arn {
                            if let Err(e) = self.apis.target_groups.deregister_targets(arn, &[host.ec2_id.clone()]) {
                                drain_warnings.push(format!("could not deregister {} from {arn}: {e}", host.ec2_id));
                            }
                        }
                    }
                }
            }
            done();
            for warning in drain_warnings {
                warn!("{warning}");
                println!("WARNING: {warning}");
                summary.warnings += 1;
            }
        }

        progress(&format!("Stopping containers on {}", host.ec2_id));
        if !self.opts.dry_run {
            // if docker does not answer a trivial query there is no point
            // trying to stop anything, and terminating the instance could
            // leave resources behind; leave this one running
            let preflight = self
                .apis
                .exec
                .run(&host.ec2_id, "docker ps -a -q", DOCKER_PREFLIGHT_TIMEOUT)
                .unwrap_or(false);
            if !preflight {
                println!("FAILED");
                println!("WARNING: cannot run docker on {}, skipping container stop and termination", host.ec2_id);
                summary.warnings += 1;
                return Ok(HostOutcome::SkippedShutdown);
            }

            let timeout = self.opts.stop_timeout;
            let stopped = self
                .apis
                .exec
                .run(
                    &host.ec2_id,
                    &format!("docker stop -t {timeout} $(docker ps -a -q)"),
                    Duration::from_secs(u64::from(timeout)),
                )
                .unwrap_or(false);
            if !stopped {
                println!("FAILED");
                println!("WARNING: Failed to stop all containers");
                summary.warnings += 1;
            } else {
                done();
            }
        } else {
            done();
        }

        progress(&format!("Stopping and terminating {}", host.ec2_id));
        if !self.opts.dry_run {
            self.apis.ec2.stop_and_await(&[host.ec2_id.clone()])?;
            self.apis.ec2.terminate_and_await(&[host.ec2_id.clone()])?;
        }
        done();

        Ok(HostOutcome::Removed)
    }

    /// Discovers the instance the ASG launched to replace a detached one and
    /// waits until the scheduler reports it ACTIVE. The detach activities
    /// seed a start-time cursor so only scaling activity caused by this
    /// detach counts; the member set difference names the replacement.
    fn await_replacement(
        &self,
        members: &mut Vec<AsgMember>,
        detach_activities: &[ScalingActivity],
    ) -> Result<String, RolloverError> {
        let activity_cursor: Option<DateTime<Utc>> = detach_activities.iter().filter_map(|a| a.start_time).max();
        let mut launch_seen = activity_cursor.is_none();

        for _ in 0..REPLACEMENT_ATTEMPTS {
            if !launch_seen {
                let activities = self.apis.asg.activities()?;
                launch_seen = activities
                    .iter()
                    .any(|a| a.progress >= 100 && a.start_time > activity_cursor);
            }

            if launch_seen {
                let current = self.apis.asg.members()?;
                let added: Vec<String> = current
                    .iter()
                    .map(|m| m.instance_id.clone())
                    .filter(|id| !members.iter().any(|m| &m.instance_id == id))
                    .collect();

                if !added.is_empty() {
                    let active = self.apis.ecs.list_active_instance_ids()?;
                    if let Some(replacement) = added.iter().find(|id| active.contains(id)) {
                        let replacement = replacement.clone();
                        *members = current;
                        return Ok(replacement);
                    }
                }
            }

            thread::sleep(self.opts.poll_interval);
        }

        Err(RolloverError::Timeout {
            what: "replacement instance to join the cluster".to_string(),
            secs: (REPLACEMENT_ATTEMPTS as u64) * self.opts.poll_interval.as_secs(),
        })
    }
}

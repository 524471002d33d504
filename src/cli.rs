use std::collections::{BTreeMap, BTreeSet};
use std::io::Write as _;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::cloud::aws::alb::TargetGroups;
use crate::cloud::aws::asg::AutoScalingGroup;
use crate::cloud::aws::ec2::Ec2Client;
use crate::cloud::aws::ecs::EcsCluster;
use crate::cloud::aws::elb::ClassicElb;
use crate::cloud::aws::exec::SshExec;
use crate::cloud::aws::sdk_config;
use crate::cloud::{ClassicLbApi, Ec2Api, EcsApi, RemoteExec, TargetGroupApi, task_definition_family};
use crate::engine::{CloudApis, Mode, RolloverEngine, RolloverOptions};
use crate::errors::RolloverError;
use crate::selection::{Prompt, SortKey};

#[derive(Parser)]
#[command(name = "ecs-rollover", version, about = "Graceful rollover and scale down of ECS container instances")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "snake_case")]
pub enum SortArg {
    LaunchTime,
    Utilization,
}

impl From<SortArg> for SortKey {
    fn from(arg: SortArg) -> SortKey {
        match arg {
            SortArg::LaunchTime => SortKey::LaunchTime,
            SortArg::Utilization => SortKey::Utilization,
        }
    }
}

#[derive(Args)]
pub struct FleetArgs {
    /// Fully qualified name of the cluster
    pub cluster: String,
    /// Auto scaling group for the cluster
    pub asg: String,
    /// `docker stop` timeout, in seconds
    #[arg(short = 't', long, default_value_t = 30)]
    pub timeout: u32,
    /// Display order of the instance list
    #[arg(short = 's', long, value_enum, default_value_t = SortArg::LaunchTime)]
    pub sort: SortArg,
    /// Don't actually make changes
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Subcommand)]
pub enum Command {
    /// Rollover ECS container instances
    Rollover(FleetArgs),
    /// Remove ECS container instances
    Scaledown(FleetArgs),
    /// Remove an EC2 instance from classic load balancers
    ElbDetach {
        ec2_id: String,
        /// Load balancers to detach from; all of them are queried when omitted
        load_balancer_name: Vec<String>,
    },
    /// Remove an EC2 instance from target groups
    AlbDetach {
        ec2_id: String,
        /// Target groups to detach from; all of them are queried when omitted
        target_group_arn: Vec<String>,
    },
    /// Stop docker containers on an EC2 instance
    DockerStop {
        ec2_id: String,
        /// `docker stop` timeout, in seconds
        #[arg(short = 't', long, default_value_t = 30)]
        timeout: u32,
    },
    /// Stop EC2 instances
    Ec2Stop {
        #[arg(required = true)]
        ec2_id: Vec<String>,
    },
    /// Terminate EC2 instances
    Ec2Terminate {
        #[arg(required = true)]
        ec2_id: Vec<String>,
    },
    /// List container instances by the name of the tasks they run
    CheckTask {
        cluster: String,
        /// Shell-style glob matched against task definition family names
        task_name_expr: String,
        /// List instances running tasks that do NOT match
        #[arg(short = 'v', long)]
        invert_match: bool,
    },
    /// Test non-interactive ssh access to an EC2 instance
    SshTest { ec2_id: String },
}

/// Answers prompts from stdin. EOF reads as an empty answer, which aborts.
pub struct ConsolePrompt;

impl Prompt for ConsolePrompt {
    fn input(&mut self, message: &str) -> String {
        print!("{message}");
        let _ = std::io::stdout().flush();

        let mut line = String::new();
        if std::io::stdin().read_line(&mut line).is_err() {
            return String::new();
        }
        line.trim().to_string()
    }

    fn confirm(&mut self, message: &str) -> bool {
        self.input(message).eq_ignore_ascii_case("y")
    }
}

pub fn run(cli: Cli) -> Result<(), RolloverError> {
    match cli.command {
        Command::Rollover(args) => fleet(args, Mode::Rollover),
        Command::Scaledown(args) => fleet(args, Mode::ScaleDown),
        Command::ElbDetach {
            ec2_id,
            load_balancer_name,
        } => elb_detach(&ec2_id, load_balancer_name),
        Command::AlbDetach {
            ec2_id,
            target_group_arn,
        } => alb_detach(&ec2_id, target_group_arn),
        Command::DockerStop { ec2_id, timeout } => docker_stop(&ec2_id, timeout),
        Command::Ec2Stop { ec2_id } => ec2_stop(&ec2_id),
        Command::Ec2Terminate { ec2_id } => ec2_terminate(&ec2_id),
        Command::CheckTask {
            cluster,
            task_name_expr,
            invert_match,
        } => check_task(&cluster, &task_name_expr, invert_match),
        Command::SshTest { ec2_id } => ssh_test(&ec2_id),
    }
}

fn fleet(args: FleetArgs, mode: Mode) -> Result<(), RolloverError> {
    let config = sdk_config();
    let ecs = EcsCluster::new(&config, &args.cluster);
    let ec2 = Ec2Client::new(&config);
    let asg = AutoScalingGroup::new(&config, &args.asg);
    let classic_lb = ClassicElb::new(&config);
    let target_groups = TargetGroups::new(&config);
    let exec = SshExec::new(&ec2);

    let mut opts = RolloverOptions::new(mode);
    opts.dry_run = args.dry_run;
    opts.stop_timeout = args.timeout;
    opts.sort = args.sort.into();

    let engine = RolloverEngine::new(
        CloudApis {
            ecs: &ecs,
            ec2: &ec2,
            asg: &asg,
            classic_lb: &classic_lb,
            target_groups: &target_groups,
            exec: &exec,
        },
        opts,
    );
    engine.run(&mut ConsolePrompt)?;
    Ok(())
}

fn elb_detach(ec2_id: &str, names: Vec<String>) -> Result<(), RolloverError> {
    let config = sdk_config();
    let classic_lb = ClassicElb::new(&config);

    let names = if names.is_empty() {
        classic_lb.load_balancers_containing(ec2_id)?
    } else {
        names
    };

    for name in names {
        print!("Detaching from {name} ...");
        let _ = std::io::stdout().flush();
        classic_lb.deregister(&name, &[ec2_id.to_string()])?;
        println!("done");
    }
    Ok(())
}

fn alb_detach(ec2_id: &str, arns: Vec<String>) -> Result<(), RolloverError> {
    let config = sdk_config();
    let target_groups = TargetGroups::new(&config);

    let arns = if arns.is_empty() {
        target_groups.target_groups_containing(ec2_id)?
    } else {
        arns
    };

    for arn in arns {
        print!("Detaching from target group {arn} ...");
        let _ = std::io::stdout().flush();
        target_groups.deregister_targets(&arn, &[ec2_id.to_string()])?;
        println!("done");
    }
    Ok(())
}

fn docker_stop(ec2_id: &str, timeout: u32) -> Result<(), RolloverError> {
    let config = sdk_config();
    let ec2 = Ec2Client::new(&config);
    let exec = SshExec::new(&ec2);

    let command = format!("docker stop -t {timeout} $(docker ps -a -q)");
    let stopped = exec.run(ec2_id, &command, Duration::from_secs(u64::from(timeout)))?;
    if stopped {
        Ok(())
    } else {
        Err(RolloverError::RemoteCommandFailed {
            ec2_id: ec2_id.to_string(),
        })
    }
}

fn ec2_stop(ec2_ids: &[String]) -> Result<(), RolloverError> {
    let config = sdk_config();
    let ec2 = Ec2Client::new(&config);

    print!("Stopping {} ...", ec2_ids.join(", "));
    let _ = std::io::stdout().flush();
    ec2.stop_and_await(ec2_ids)?;
    println!("done");
    Ok(())
}

fn ec2_terminate(ec2_ids: &[String]) -> Result<(), RolloverError> {
    let config = sdk_config();
    let ec2 = Ec2Client::new(&config);

    print!("Terminating {} ...", ec2_ids.join(", "));
    let _ = std::io::stdout().flush();
    ec2.terminate_and_await(ec2_ids)?;
    println!("done");
    Ok(())
}

fn check_task(cluster: &str, task_name_expr: &str, invert_match: bool) -> Result<(), RolloverError> {
    let pattern = glob::Pattern::new(task_name_expr)
        .map_err(|_| RolloverError::InvalidPattern(task_name_expr.to_string()))?;

    let config = sdk_config();
    let ecs = EcsCluster::new(&config, cluster);

    let task_arns = ecs.list_tasks()?;
    let tasks = ecs.describe_tasks(&task_arns)?;

    let mut families_by_host: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for task in tasks.values() {
        let Some(host) = &task.container_instance_id else { continue };
        families_by_host
            .entry(host.clone())
            .or_default()
            .insert(task_definition_family(&task.task_definition).to_string());
    }

    for (host, families) in families_by_host {
        let hits: Vec<String> = families
            .into_iter()
            .filter(|family| pattern.matches(family) != invert_match)
            .collect();
        if !hits.is_empty() {
            println!("{host}: {}", hits.join(", "));
        }
    }
    Ok(())
}

fn ssh_test(ec2_id: &str) -> Result<(), RolloverError> {
    let config = sdk_config();
    let ec2 = Ec2Client::new(&config);
    let exec = SshExec::new(&ec2);

    if exec.run(ec2_id, r#"echo "test""#, Duration::from_secs(30))? {
        println!("ok");
        Ok(())
    } else {
        Err(RolloverError::SshUnreachable {
            ec2_id: ec2_id.to_string(),
        })
    }
}

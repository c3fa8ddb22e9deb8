//! Availability zone partition CLI.

use anyhow::{Context, Result};
use az_partition::provider::memory::InMemoryControlPlane;
use az_partition::{Config, ControlPlane, Orchestrator, PartitionError, RunOutcome};
use clap::Parser;
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Environment may still be partitioned.
const EXIT_PARTIAL_FAILURE: u8 = 2;

#[derive(Parser, Debug)]
#[command(name = "az-partition")]
#[command(
    about = "Chaos Engineering tool - simulate an availability zone network partition with a deny-all network ACL"
)]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// VPC id, required unless set in the configuration file
    #[arg(long = "vpc", value_name = "VPC_ID")]
    vpc_id: Option<String>,

    /// Availability zone name, required unless set in the configuration file
    #[arg(long = "az", value_name = "AZ")]
    availability_zone: Option<String>,

    /// AWS region; unset falls back to the configuration file, then AWS_REGION
    #[arg(long)]
    region: Option<String>,

    /// Partition duration (e.g. "60s", "5m") [default: 60s]
    #[arg(long, value_parser = humantime::parse_duration)]
    duration: Option<Duration>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'L', long, default_value = "info")]
    log_level: String,

    /// Print example configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,

    /// Discover and print the plan without changing any ACL
    #[arg(long)]
    dry_run: bool,

    /// Put back completed rebinds if installation fails part way
    #[arg(long)]
    rollback_on_failure: bool,

    /// Rehearse against an in-memory control plane with this many subnets
    #[arg(long, value_name = "SUBNETS", num_args = 0..=1, default_missing_value = "3")]
    simulate: Option<usize>,
}

fn print_example_config() {
    let example = r#"# Availability Zone Partition Configuration

target:
  vpc_id: "vpc-0123456789abcdef0"  # Required
  availability_zone: "us-east-1a"  # Required
  # region: "us-east-1"            # Defaults to AWS_REGION / AWS profile

partition:
  duration: 60s                    # How long the zone stays cut off
  egress_rule_number: 100          # Deny rule numbers, must differ and be
  ingress_rule_number: 101         # below the default rule (32767)
  cidr_block: "0.0.0.0/0"          # Traffic denied in both directions

settings:
  dry_run: false                   # Discover only, print the plan
  rollback_on_failure: false       # Undo completed rebinds when installation fails
"#;
    println!("{}", example);
}

impl Args {
    /// Apply command line overrides on top of `config`.
    fn merge_into(&self, config: &mut Config) {
        if let Some(vpc_id) = &self.vpc_id {
            config.target.vpc_id = vpc_id.clone();
        }
        if let Some(availability_zone) = &self.availability_zone {
            config.target.availability_zone = availability_zone.clone();
        }
        if let Some(region) = &self.region {
            config.target.region = Some(region.clone());
        }
        if let Some(duration) = self.duration {
            config.partition.duration = duration;
        }
        if self.dry_run {
            config.settings.dry_run = true;
            info!("Dry-run mode enabled via command line");
        }
        if self.rollback_on_failure {
            config.settings.rollback_on_failure = true;
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    // Handle --print-config
    if args.print_config {
        print_example_config();
        return Ok(ExitCode::SUCCESS);
    }

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    // Load configuration
    let mut config = match &args.config {
        Some(path) => {
            info!(config = %path.display(), "Loading configuration");
            Config::from_file(path)?
        }
        None => Config::default(),
    };
    args.merge_into(&mut config);
    config.validate().context("invalid configuration")?;

    // Handle --validate
    if args.validate {
        info!("Configuration is valid");
        return Ok(ExitCode::SUCCESS);
    }

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, restoring the availability zone");
            interrupt.cancel();
        }
    });

    info!(
        vpc = %config.target.vpc_id,
        availability_zone = %config.target.availability_zone,
        duration = %humantime::format_duration(config.partition.duration),
        dry_run = config.settings.dry_run,
        "Starting availability zone partition"
    );

    if let Some(subnets) = args.simulate {
        let plane = InMemoryControlPlane::with_zone(
            &config.target.vpc_id,
            &config.target.availability_zone,
            subnets,
        );
        info!(subnets, "Using in-memory control plane");
        return Ok(execute(plane, config, cancel).await);
    }

    execute_on_aws(config, cancel).await
}

#[cfg(feature = "aws")]
async fn execute_on_aws(config: Config, cancel: CancellationToken) -> Result<ExitCode> {
    let plane =
        az_partition::provider::aws::Ec2ControlPlane::from_env(config.target.region.clone()).await;
    Ok(execute(plane, config, cancel).await)
}

#[cfg(not(feature = "aws"))]
async fn execute_on_aws(_config: Config, _cancel: CancellationToken) -> Result<ExitCode> {
    anyhow::bail!("built without the `aws` feature; use --simulate to rehearse")
}

async fn execute<P: ControlPlane>(
    plane: P,
    config: Config,
    cancel: CancellationToken,
) -> ExitCode {
    let mut orchestrator = Orchestrator::new(plane, config).with_cancellation(cancel);

    let result = orchestrator.run().await;
    match result {
        Ok(RunOutcome::NothingToPartition) => ExitCode::SUCCESS,
        Ok(RunOutcome::DryRun { plan }) => {
            print_json(&plan);
            ExitCode::SUCCESS
        }
        Ok(RunOutcome::Completed(report)) => {
            if !report.cleanup.is_deleted() {
                warn!(acl = %report.injected_acl, "Partition ACL was not deleted");
            }
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(state = %orchestrator.state(), error = %err, "Partition run failed");
            match &err {
                PartitionError::Input(_) | PartitionError::Discovery { .. } => ExitCode::FAILURE,
                PartitionError::Installation { failure, recovery } => {
                    print_json(&serde_json::json!({
                        "installation": failure,
                        "recovery": recovery,
                    }));
                    partial_failure_code(&err)
                }
                PartitionError::Restoration(report) => {
                    print_json(report);
                    partial_failure_code(&err)
                }
            }
        }
    }
}

fn partial_failure_code(err: &PartitionError) -> ExitCode {
    if err.is_partial_failure() {
        ExitCode::from(EXIT_PARTIAL_FAILURE)
    } else {
        ExitCode::FAILURE
    }
}

/// Write a report to stdout for operators and scripts.
fn print_json<T: Serialize + ?Sized>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(err) => error!(error = %err, "Failed to serialize report"),
    }
}

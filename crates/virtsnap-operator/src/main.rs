//! VM snapshot operator entry point

use std::time::Duration;

use clap::Parser;
use kube::{Client, CustomResourceExt};

use virtsnap_common::crd::{
    VirtualMachineClone, VirtualMachineRestore, VirtualMachineSnapshot,
    VirtualMachineSnapshotContent,
};
use virtsnap_common::kube_utils::parse_duration;
use virtsnap_common::telemetry::{init_tracing, LogFormat};
use virtsnap_common::ControllerSettings;
use virtsnap_operator::controller_runner;

/// virtsnap - snapshot, restore and clone controllers for KubeVirt virtual machines
#[derive(Parser, Debug)]
#[command(name = "virtsnap", version, about, long_about = None)]
struct Cli {
    /// Print the CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// Log output format (text or json)
    #[arg(long, env = "VIRTSNAP_LOG_FORMAT", default_value = "text")]
    log_format: LogFormat,

    /// Parallel reconciles per controller (0 means unbounded)
    #[arg(long, env = "VIRTSNAP_CONCURRENCY", default_value_t = 3)]
    concurrency: u16,

    /// Revisit interval while waiting for the source lock
    #[arg(
        long,
        env = "VIRTSNAP_SNAPSHOT_RETRY_INTERVAL",
        default_value = "5s",
        value_parser = duration,
    )]
    snapshot_retry_interval: Duration,

    /// Revisit interval while waiting for content deletion
    #[arg(
        long,
        env = "VIRTSNAP_CONTENT_DELETION_INTERVAL",
        default_value = "5s",
        value_parser = duration,
    )]
    content_deletion_interval: Duration,

    /// How long a guest may stay frozen
    #[arg(
        long,
        env = "VIRTSNAP_FREEZE_TIMEOUT",
        default_value = "5m",
        value_parser = duration,
    )]
    freeze_timeout: Duration,

    /// Failure deadline for snapshots that leave it unset
    #[arg(
        long,
        env = "VIRTSNAP_FAILURE_DEADLINE",
        default_value = "5m",
        value_parser = duration,
    )]
    failure_deadline: Duration,

    /// Grace period before a restore onto a running VM fails
    #[arg(
        long,
        env = "VIRTSNAP_GRACE_PERIOD",
        default_value = "5m",
        value_parser = duration,
    )]
    grace_period: Duration,

    /// Revisit interval while a restore or clone waits on dependents
    #[arg(
        long,
        env = "VIRTSNAP_REQUEUE_IN_PROGRESS",
        default_value = "15s",
        value_parser = duration,
    )]
    requeue_in_progress: Duration,

    /// Requeue interval after a retryable error
    #[arg(
        long,
        env = "VIRTSNAP_ERROR_REQUEUE",
        default_value = "30s",
        value_parser = duration,
    )]
    error_requeue: Duration,
}

impl Cli {
    fn settings(&self) -> ControllerSettings {
        ControllerSettings {
            snapshot_retry_interval: self.snapshot_retry_interval,
            content_deletion_interval: self.content_deletion_interval,
            freeze_timeout: self.freeze_timeout,
            default_failure_deadline: self.failure_deadline,
            default_grace_period: self.grace_period,
            requeue_in_progress: self.requeue_in_progress,
            error_requeue: self.error_requeue,
        }
    }
}

fn duration(raw: &str) -> Result<Duration, String> {
    parse_duration(raw)
        .ok_or_else(|| format!("invalid duration '{raw}', expected e.g. 30s or 1h5m"))
}

fn print_crds() -> anyhow::Result<()> {
    let crds = [
        VirtualMachineSnapshot::crd(),
        VirtualMachineSnapshotContent::crd(),
        VirtualMachineRestore::crd(),
        VirtualMachineClone::crd(),
    ];
    let docs = crds
        .iter()
        .map(serde_yaml::to_string)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
    println!("{}", docs.join("---\n"));
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        return print_crds();
    }

    init_tracing(cli.log_format)?;
    run_controllers(&cli).await
}

async fn run_controllers(cli: &Cli) -> anyhow::Result<()> {
    tracing::info!("virtsnap controller starting...");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;
    let settings = cli.settings();
    tracing::debug!(?settings, concurrency = cli.concurrency, "controller settings");

    tracing::info!("Starting controllers:");
    let mut controllers = Vec::new();
    controllers.extend(controller_runner::build_snapshot_controllers(
        client.clone(),
        settings.clone(),
        cli.concurrency,
    ));
    controllers.extend(controller_runner::build_restore_controllers(
        client.clone(),
        settings.clone(),
        cli.concurrency,
    ));
    controllers.extend(controller_runner::build_clone_controllers(
        client,
        settings,
        cli.concurrency,
    ));

    futures::future::join_all(controllers).await;
    tracing::info!("virtsnap controller shutting down");
    Ok(())
}

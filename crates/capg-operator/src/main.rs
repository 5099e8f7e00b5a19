//! capg-operator - GKE infrastructure provider for Cluster API

use std::time::Duration;

use clap::{Parser, ValueEnum};
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::info;

use capg_common::crd::owned_crds;
use capg_common::leader_election::LeaseTiming;
use capg_common::telemetry::{init_telemetry, LogFormat, TelemetryConfig};
use capg_common::{DEFAULT_LEADER_ELECTION_ID, DEFAULT_LEADER_ELECTION_NAMESPACE};
use capg_operator::config::{parse_duration, LeaderElectionConfig, OperatorConfig};
use capg_operator::manager::Manager;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormatArg {
    Json,
    Text,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Json => LogFormat::Json,
            LogFormatArg::Text => LogFormat::Text,
        }
    }
}

/// GKE cluster-api provider controller manager
#[derive(Parser, Debug)]
#[command(name = "capg-operator", version, about, long_about = None)]
struct Cli {
    /// Print the CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// Compete for a Lease so only one replica reconciles at a time
    #[arg(long, env = "ENABLE_LEADER_ELECTION")]
    enable_leader_election: bool,

    /// Namespace of the leader election Lease
    #[arg(long, env = "LEADER_ELECTION_NAMESPACE", default_value = DEFAULT_LEADER_ELECTION_NAMESPACE)]
    leader_election_namespace: String,

    /// Name of the leader election Lease
    #[arg(long, default_value = DEFAULT_LEADER_ELECTION_ID)]
    leader_election_id: String,

    /// How long a Lease claim stays valid
    #[arg(long, default_value = "15s", value_parser = parse_duration)]
    lease_duration: Duration,

    /// How long the leader retries renewal before stepping down
    #[arg(long, default_value = "10s", value_parser = parse_duration)]
    renew_deadline: Duration,

    /// Interval between Lease acquire/renew attempts
    #[arg(long, default_value = "2s", value_parser = parse_duration)]
    retry_period: Duration,

    /// Only watch this namespace; all namespaces if empty
    #[arg(long, env = "WATCH_NAMESPACE", default_value = "")]
    namespace: String,

    /// Concurrent GKECluster reconciles
    #[arg(long, default_value_t = 10)]
    gkecluster_concurrency: usize,

    /// Concurrent GKEMachinePool reconciles
    #[arg(long, default_value_t = 10)]
    gkemachinepool_concurrency: usize,

    /// Interval between full resyncs of every object
    #[arg(long, default_value = "10m", value_parser = parse_duration)]
    sync_period: Duration,

    /// Deadline of a single reconcile
    #[arg(long, default_value = "90m", value_parser = parse_duration)]
    reconcile_timeout: Duration,

    /// Events an object may emit back to back before rate limiting
    #[arg(long, default_value_t = 100)]
    event_burst_size: u32,

    /// Base URL of the GKE container API
    #[arg(long, env = "GKE_API_URL", default_value = capg_common::gcp::CONTAINER_API)]
    gke_api_url: String,

    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value = "json")]
    log_format: LogFormatArg,
}

impl Cli {
    fn operator_config(&self) -> OperatorConfig {
        let leader_election = self.enable_leader_election.then(|| LeaderElectionConfig {
            namespace: self.leader_election_namespace.clone(),
            id: self.leader_election_id.clone(),
            timing: LeaseTiming {
                lease_duration: self.lease_duration,
                renew_deadline: self.renew_deadline,
                retry_period: self.retry_period,
            },
        });
        OperatorConfig {
            leader_election,
            watch_namespace: (!self.namespace.is_empty()).then(|| self.namespace.clone()),
            gke_cluster_concurrency: self.gkecluster_concurrency,
            gke_machine_pool_concurrency: self.gkemachinepool_concurrency,
            sync_period: self.sync_period,
            reconcile_timeout: self.reconcile_timeout,
            event_burst: self.event_burst_size,
            gke_api_url: self.gke_api_url.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        for crd in owned_crds() {
            let yaml = serde_yaml::to_string(&crd)
                .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
            println!("---\n{yaml}");
        }
        return Ok(());
    }

    init_telemetry(TelemetryConfig {
        format: cli.log_format.into(),
        ..Default::default()
    })?;

    let config = cli.operator_config();
    config.validate()?;

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(shutdown.clone()));

    Manager::new(client, config).run(shutdown).await
}

/// Cancel `shutdown` on SIGINT or SIGTERM
async fn cancel_on_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "cannot listen for SIGTERM, only SIGINT stops the manager");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    info!("shutdown signal received");
    shutdown.cancel();
}

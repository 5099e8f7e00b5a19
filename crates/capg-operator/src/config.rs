//! Controller manager configuration

use std::time::Duration;

use capg_common::gcp::CONTAINER_API;
use capg_common::leader_election::LeaseTiming;
use capg_common::{Error, Result, DEFAULT_LEADER_ELECTION_ID, DEFAULT_LEADER_ELECTION_NAMESPACE};
use capg_controller::ControllerConfig;

/// Where and how to compete for leadership
#[derive(Clone, Debug, PartialEq)]
pub struct LeaderElectionConfig {
    /// Namespace of the Lease
    pub namespace: String,
    /// Name of the Lease
    pub id: String,
    /// Lease timing
    pub timing: LeaseTiming,
}

impl Default for LeaderElectionConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_LEADER_ELECTION_NAMESPACE.to_string(),
            id: DEFAULT_LEADER_ELECTION_ID.to_string(),
            timing: LeaseTiming::default(),
        }
    }
}

/// Everything the manager needs, resolved from flags and environment
#[derive(Clone, Debug, PartialEq)]
pub struct OperatorConfig {
    /// Leader election; `None` runs as the only replica
    pub leader_election: Option<LeaderElectionConfig>,
    /// Restrict watches to one namespace; `None` watches all
    pub watch_namespace: Option<String>,
    /// Concurrent GKECluster reconciles
    pub gke_cluster_concurrency: usize,
    /// Concurrent GKEMachinePool reconciles
    pub gke_machine_pool_concurrency: usize,
    /// Interval of the full resync
    pub sync_period: Duration,
    /// Deadline of one reconcile
    pub reconcile_timeout: Duration,
    /// Events an object may emit back to back
    pub event_burst: u32,
    /// Base URL of the GKE container API
    pub gke_api_url: String,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            leader_election: None,
            watch_namespace: None,
            gke_cluster_concurrency: 10,
            gke_machine_pool_concurrency: 10,
            sync_period: Duration::from_secs(10 * 60),
            reconcile_timeout: Duration::from_secs(90 * 60),
            event_burst: 100,
            gke_api_url: CONTAINER_API.to_string(),
        }
    }
}

impl OperatorConfig {
    /// Reject values that would stall or endanger the manager
    pub fn validate(&self) -> Result<()> {
        if self.gke_cluster_concurrency == 0 || self.gke_machine_pool_concurrency == 0 {
            return Err(Error::validation("concurrency must be at least 1"));
        }
        if self.sync_period.is_zero() {
            return Err(Error::validation("sync period must be positive"));
        }
        if self.reconcile_timeout.is_zero() {
            return Err(Error::validation("reconcile timeout must be positive"));
        }
        if self.event_burst == 0 {
            return Err(Error::validation("event burst size must be at least 1"));
        }
        if let Some(le) = &self.leader_election {
            if le.id.is_empty() || le.namespace.is_empty() {
                return Err(Error::validation(
                    "leader election id and namespace must not be empty",
                ));
            }
            le.timing.validate()?;
        }
        Ok(())
    }

    /// Controller settings for a kind running `concurrency` workers
    pub fn controller_config(&self, concurrency: usize) -> ControllerConfig {
        ControllerConfig {
            concurrency,
            reconcile_timeout: self.reconcile_timeout,
            resync_period: self.sync_period,
            ..Default::default()
        }
    }
}

/// Parse `90m`, `1h`, `15s` or plain seconds
pub fn parse_duration(input: &str) -> std::result::Result<Duration, String> {
    let input = input.trim();
    let (digits, unit) = match input.char_indices().find(|(_, c)| !c.is_ascii_digit()) {
        Some((idx, _)) => input.split_at(idx),
        None => (input, "s"),
    };
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid duration {input:?}"))?;
    let secs = match unit {
        "s" => value,
        "m" => value * 60,
        "h" => value * 60 * 60,
        other => return Err(format!("unknown duration unit {other:?} in {input:?}")),
    };
    Ok(Duration::from_secs(secs))
}

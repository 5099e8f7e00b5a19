//! Leader election over a Lease record
//!
//! At most one process in a replica set runs the scheduler. Each process
//! runs a [`LeaderElector`], which competes for a Lease and publishes its
//! [`Leadership`] on a watch channel the scheduler follows.
//!
//! # Atomicity
//!
//! Every write to the Lease is a compare-and-swap on its resourceVersion.
//! If the Lease changed between read and write the write is rejected and
//! the elector re-reads, so two processes can never both believe they
//! acquired the same term.
//!
//! # Timing
//!
//! The leader renews every retry period. If no renewal succeeds within the
//! renew deadline it steps down; the deadline is shorter than the lease
//! duration, so the old leader is already in standby when a contender may
//! take the Lease over.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, PostParams};
use kube::Client;
#[cfg(test)]
use mockall::automock;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::{Error, Result, FIELD_MANAGER};

/// Contents of the Lease that matter for election
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LeaseRecord {
    /// Current holder; `None` when released
    pub holder_identity: Option<String>,
    /// How long the holder's claim is valid after each renewal
    pub lease_duration_seconds: i32,
    /// When the current holder acquired the Lease
    pub acquire_time: Option<DateTime<Utc>>,
    /// When the holder last renewed
    pub renew_time: Option<DateTime<Utc>>,
    /// Number of holder changes
    pub lease_transitions: i32,
    /// Version read from the store
    pub resource_version: Option<String>,
}

impl LeaseRecord {
    /// Whether the holder's claim has lapsed at `now`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        if self.holder_identity.is_none() {
            return true;
        }
        match self.renew_time {
            Some(rt) => now > rt + chrono::Duration::seconds(self.lease_duration_seconds as i64),
            None => true,
        }
    }
}

/// Durable Lease storage with compare-and-swap writes
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Read the Lease; `Ok(None)` if it does not exist
    async fn get(&self) -> Result<Option<LeaseRecord>>;

    /// Create the Lease; `Ok(false)` if someone created it first
    async fn create(&self, record: &LeaseRecord) -> Result<bool>;

    /// Overwrite the Lease if its version is still `expected_version`; `Ok(false)` otherwise
    async fn replace(&self, record: &LeaseRecord, expected_version: &str) -> Result<bool>;
}

/// [`LeaseStore`] backed by a coordination.k8s.io/v1 Lease
pub struct KubeLeaseStore {
    api: Api<Lease>,
    name: String,
    namespace: String,
}

impl KubeLeaseStore {
    /// Store for Lease `name` in `namespace`
    pub fn new(client: Client, namespace: &str, name: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            name: name.to_string(),
            namespace: namespace.to_string(),
        }
    }

    fn to_lease(&self, record: &LeaseRecord, resource_version: Option<String>) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some(self.name.clone()),
                namespace: Some(self.namespace.clone()),
                resource_version,
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: record.holder_identity.clone(),
                lease_duration_seconds: Some(record.lease_duration_seconds),
                acquire_time: record.acquire_time.map(MicroTime),
                renew_time: record.renew_time.map(MicroTime),
                lease_transitions: Some(record.lease_transitions),
                ..Default::default()
            }),
        }
    }

    fn post_params() -> PostParams {
        PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        }
    }
}

fn from_lease(lease: Lease) -> LeaseRecord {
    let spec = lease.spec.unwrap_or_default();
    LeaseRecord {
        holder_identity: spec.holder_identity,
        lease_duration_seconds: spec.lease_duration_seconds.unwrap_or(0),
        acquire_time: spec.acquire_time.map(|t| t.0),
        renew_time: spec.renew_time.map(|t| t.0),
        lease_transitions: spec.lease_transitions.unwrap_or(0),
        resource_version: lease.metadata.resource_version,
    }
}

#[async_trait]
impl LeaseStore for KubeLeaseStore {
    async fn get(&self) -> Result<Option<LeaseRecord>> {
        Ok(self.api.get_opt(&self.name).await?.map(from_lease))
    }

    async fn create(&self, record: &LeaseRecord) -> Result<bool> {
        match self
            .api
            .create(&Self::post_params(), &self.to_lease(record, None))
            .await
        {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn replace(&self, record: &LeaseRecord, expected_version: &str) -> Result<bool> {
        let lease = self.to_lease(record, Some(expected_version.to_string()));
        match self
            .api
            .replace(&self.name, &Self::post_params(), &lease)
            .await
        {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(Debug, Default)]
struct SharedLease {
    record: Option<LeaseRecord>,
    version: u64,
}

/// In-process [`LeaseStore`]
///
/// Handles made with [`MemoryLeaseStore::connect`] share one Lease but can
/// be cut off from it individually.
#[derive(Clone, Debug)]
pub struct MemoryLeaseStore {
    shared: Arc<Mutex<SharedLease>>,
    reachable: Arc<AtomicBool>,
}

impl Default for MemoryLeaseStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLeaseStore {
    /// Fresh store with no Lease
    pub fn new() -> Self {
        Self {
            shared: Arc::default(),
            reachable: Arc::new(AtomicBool::new(true)),
        }
    }

    /// New handle on the same Lease with its own reachability
    pub fn connect(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            reachable: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Make every call through this handle fail (or succeed again)
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Current Lease contents
    pub fn snapshot(&self) -> Option<LeaseRecord> {
        self.lock().record.clone()
    }

    /// Hand the Lease to `identity` regardless of its current holder
    pub fn force_holder(&self, identity: &str, now: DateTime<Utc>) {
        let mut shared = self.lock();
        shared.version += 1;
        let version = shared.version.to_string();
        let mut record = shared.record.clone().unwrap_or_default();
        record.holder_identity = Some(identity.to_string());
        record.renew_time = Some(now);
        record.acquire_time = Some(now);
        record.lease_transitions += 1;
        record.resource_version = Some(version);
        shared.record = Some(record);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SharedLease> {
        self.shared.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn check_reachable(&self) -> Result<()> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::transport_with_context("lease", "lease store unreachable"))
        }
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn get(&self) -> Result<Option<LeaseRecord>> {
        self.check_reachable()?;
        Ok(self.lock().record.clone())
    }

    async fn create(&self, record: &LeaseRecord) -> Result<bool> {
        self.check_reachable()?;
        let mut shared = self.lock();
        if shared.record.is_some() {
            return Ok(false);
        }
        shared.version += 1;
        let mut stored = record.clone();
        stored.resource_version = Some(shared.version.to_string());
        shared.record = Some(stored);
        Ok(true)
    }

    async fn replace(&self, record: &LeaseRecord, expected_version: &str) -> Result<bool> {
        self.check_reachable()?;
        let mut shared = self.lock();
        let current = shared
            .record
            .as_ref()
            .and_then(|r| r.resource_version.clone());
        if current.as_deref() != Some(expected_version) {
            return Ok(false);
        }
        shared.version += 1;
        let mut stored = record.clone();
        stored.resource_version = Some(shared.version.to_string());
        shared.record = Some(stored);
        Ok(true)
    }
}

/// Lease timing parameters
#[derive(Clone, Debug, PartialEq)]
pub struct LeaseTiming {
    /// How long a claim is valid after each renewal
    pub lease_duration: Duration,
    /// How long the leader keeps trying to renew before stepping down
    pub renew_deadline: Duration,
    /// Interval between acquire and renew attempts
    pub retry_period: Duration,
}

impl Default for LeaseTiming {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(15),
            renew_deadline: Duration::from_secs(10),
            retry_period: Duration::from_secs(2),
        }
    }
}

impl LeaseTiming {
    /// Reject orderings under which two leaders could overlap
    pub fn validate(&self) -> Result<()> {
        if self.retry_period.is_zero() {
            return Err(Error::validation("retry period must be positive"));
        }
        if self.lease_duration.as_secs() == 0 {
            return Err(Error::validation("lease duration must be at least one second"));
        }
        if self.renew_deadline >= self.lease_duration {
            return Err(Error::validation(format!(
                "renew deadline {:?} must be shorter than lease duration {:?}",
                self.renew_deadline, self.lease_duration
            )));
        }
        if self.retry_period >= self.renew_deadline {
            return Err(Error::validation(format!(
                "retry period {:?} must be shorter than renew deadline {:?}",
                self.retry_period, self.renew_deadline
            )));
        }
        Ok(())
    }
}

/// Whether this process may run reconciles
///
/// `Leading` carries the token of the current term; it is cancelled the
/// moment the term ends, and every invocation started in that term holds
/// a child of it.
#[derive(Clone, Debug)]
pub enum Leadership {
    /// Observe only
    Standby,
    /// Run reconciles until the token is cancelled
    Leading(CancellationToken),
}

impl Leadership {
    /// Whether this is a live `Leading` term
    pub fn is_leading(&self) -> bool {
        matches!(self, Leadership::Leading(token) if !token.is_cancelled())
    }

    /// Permanent leadership for single-replica deployments, ended by `shutdown`
    pub fn always(shutdown: &CancellationToken) -> watch::Receiver<Leadership> {
        let (_tx, rx) = watch::channel(Leadership::Leading(shutdown.child_token()));
        rx
    }
}

/// Competes for the Lease and publishes the outcome
pub struct LeaderElector {
    store: Arc<dyn LeaseStore>,
    identity: String,
    timing: LeaseTiming,
    clock: Arc<dyn Clock>,
    state: watch::Sender<Leadership>,
}

impl LeaderElector {
    /// Elector for `identity` with the system clock
    pub fn new(store: Arc<dyn LeaseStore>, identity: &str, timing: LeaseTiming) -> Self {
        Self::with_clock(store, identity, timing, Arc::new(SystemClock))
    }

    /// Elector reading wall time from `clock`
    pub fn with_clock(
        store: Arc<dyn LeaseStore>,
        identity: &str,
        timing: LeaseTiming,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (state, _) = watch::channel(Leadership::Standby);
        Self {
            store,
            identity: identity.to_string(),
            timing,
            clock,
            state,
        }
    }

    /// This elector's identity
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Follow leadership changes
    pub fn subscribe(&self) -> watch::Receiver<Leadership> {
        self.state.subscribe()
    }

    /// Whether this process currently leads
    pub fn is_leader(&self) -> bool {
        self.state.borrow().is_leading()
    }

    fn lease_seconds(&self) -> i32 {
        self.timing.lease_duration.as_secs() as i32
    }

    /// One compare-and-swap round: create, renew or take over the Lease
    ///
    /// `Ok(true)` if we hold the Lease afterwards.
    pub async fn try_acquire_or_renew(&self) -> Result<bool> {
        let now = self.clock.now();

        let Some(existing) = self.store.get().await? else {
            let record = LeaseRecord {
                holder_identity: Some(self.identity.clone()),
                lease_duration_seconds: self.lease_seconds(),
                acquire_time: Some(now),
                renew_time: Some(now),
                lease_transitions: 0,
                resource_version: None,
            };
            let created = self.store.create(&record).await?;
            if created {
                info!(identity = %self.identity, "Created new lease");
            }
            return Ok(created);
        };

        let Some(version) = existing.resource_version.clone() else {
            return Err(Error::transport_with_context(
                "lease",
                "lease missing resourceVersion",
            ));
        };

        if existing.holder_identity.as_deref() == Some(self.identity.as_str()) {
            let mut renewed = existing;
            renewed.renew_time = Some(now);
            renewed.lease_duration_seconds = self.lease_seconds();
            let ok = self.store.replace(&renewed, &version).await?;
            if ok {
                debug!(identity = %self.identity, "Lease renewed");
            }
            return Ok(ok);
        }

        if !existing.is_expired(now) {
            return Ok(false);
        }

        let transitions = existing.lease_transitions + 1;
        let taken = LeaseRecord {
            holder_identity: Some(self.identity.clone()),
            lease_duration_seconds: self.lease_seconds(),
            acquire_time: Some(now),
            renew_time: Some(now),
            lease_transitions: transitions,
            resource_version: None,
        };
        let ok = self.store.replace(&taken, &version).await?;
        if ok {
            info!(
                identity = %self.identity,
                previous = existing.holder_identity.as_deref().unwrap_or(""),
                transitions,
                "Took over expired lease"
            );
        }
        Ok(ok)
    }

    fn promote(&self) -> CancellationToken {
        let term = CancellationToken::new();
        self.state.send_replace(Leadership::Leading(term.clone()));
        info!(identity = %self.identity, "Leadership acquired");
        term
    }

    fn demote(&self, term: &CancellationToken) {
        term.cancel();
        self.state.send_replace(Leadership::Standby);
    }

    /// Block until the Lease is ours or `shutdown` fires
    async fn acquire(&self, shutdown: &CancellationToken) -> Option<CancellationToken> {
        info!(identity = %self.identity, "Waiting for leadership...");
        loop {
            let attempt = tokio::select! {
                _ = shutdown.cancelled() => return None,
                attempt = self.try_acquire_or_renew() => attempt,
            };
            match attempt {
                Ok(true) => return Some(self.promote()),
                Ok(false) => {
                    debug!(identity = %self.identity, "Lease held by another, waiting...");
                }
                Err(e) => {
                    warn!(identity = %self.identity, error = %e, "Failed to acquire lease, retrying...");
                }
            }
            tokio::select! {
                _ = shutdown.cancelled() => return None,
                _ = tokio::time::sleep(self.timing.retry_period) => {}
            }
        }
    }

    /// Renew until the term is lost; `true` if ended by `shutdown`
    ///
    /// Each renewal races the renew deadline, so a store call that never
    /// returns still ends the term before the Lease can expire.
    async fn hold(&self, shutdown: &CancellationToken) -> bool {
        let mut last_renewal = Instant::now();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return true,
                _ = tokio::time::sleep(self.timing.retry_period) => {}
            }
            let deadline = last_renewal + self.timing.renew_deadline;
            let renewal = tokio::select! {
                _ = shutdown.cancelled() => return true,
                renewal = tokio::time::timeout_at(deadline, self.try_acquire_or_renew()) => renewal,
            };
            match renewal {
                Ok(Ok(true)) => last_renewal = Instant::now(),
                Ok(Ok(false)) => {
                    warn!(identity = %self.identity, "Lease taken by another holder, lost leadership");
                    return false;
                }
                Ok(Err(e)) if Instant::now() >= deadline => {
                    warn!(identity = %self.identity, error = %e, "Renew deadline exceeded, lost leadership");
                    return false;
                }
                Ok(Err(e)) => {
                    debug!(identity = %self.identity, error = %e, "Lease renewal failed, retrying");
                }
                Err(_) => {
                    warn!(identity = %self.identity, "Lease renewal stalled past the renew deadline, lost leadership");
                    return false;
                }
            }
        }
    }

    /// Compete for leadership until `shutdown`, then release the Lease if held
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        loop {
            let Some(term) = self.acquire(&shutdown).await else {
                return;
            };
            let stopping = self.hold(&shutdown).await;
            self.demote(&term);
            if stopping {
                match tokio::time::timeout(self.timing.renew_deadline, self.release_lease()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        warn!(identity = %self.identity, error = %e, "Failed to release lease");
                    }
                    Err(_) => {
                        warn!(identity = %self.identity, "Lease release timed out");
                    }
                }
                return;
            }
        }
    }

    /// Clear the holder so a standby can take over without waiting for expiry
    pub async fn release_lease(&self) -> Result<()> {
        let Some(existing) = self.store.get().await? else {
            debug!(identity = %self.identity, "Lease not found, nothing to release");
            return Ok(());
        };
        if existing.holder_identity.as_deref() != Some(self.identity.as_str()) {
            debug!(identity = %self.identity, "Not the lease holder, nothing to release");
            return Ok(());
        }
        let Some(version) = existing.resource_version.clone() else {
            return Ok(());
        };
        let mut released = existing;
        released.holder_identity = None;
        released.renew_time = Some(self.clock.now() - chrono::Duration::seconds(60));
        if self.store.replace(&released, &version).await? {
            info!(identity = %self.identity, "Lease released for fast failover");
        }
        Ok(())
    }
}

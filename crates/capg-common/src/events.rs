//! Kubernetes Event recording
//!
//! Reconcilers and the scheduler call [`Recorder::record`], which never
//! blocks and never fails. A background task runs every record through a
//! [`Correlator`] (per-object rate limit plus duplicate suppression) and
//! hands what survives to an [`EventPublisher`].
//!
//! Events are fire-and-forget: a failed or dropped event must never break
//! reconciliation.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use governor::middleware::NoOpMiddleware;
use governor::nanos::Nanos;
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder as KubeRecorder, Reporter};
use kube::Client;
#[cfg(test)]
use mockall::automock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Event severity
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Severity {
    /// Expected transition
    Normal,
    /// Something needs attention
    Warning,
}

impl From<Severity> for EventType {
    fn from(s: Severity) -> Self {
        match s {
            Severity::Normal => EventType::Normal,
            Severity::Warning => EventType::Warning,
        }
    }
}

/// One event about one object
#[derive(Clone, Debug, PartialEq)]
pub struct EventRecord {
    /// Object the event is about
    pub object: ObjectReference,
    /// Machine-readable reason (see [`reasons`])
    pub reason: String,
    /// Human-readable message
    pub message: String,
    /// Normal or Warning
    pub severity: Severity,
}

/// Sink for events that passed correlation
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish one event; failures are logged, never returned
    async fn publish(&self, record: &EventRecord);
}

/// Production implementation wrapping `kube::runtime::events::Recorder`
pub struct KubeEventPublisher {
    recorder: KubeRecorder,
}

impl KubeEventPublisher {
    /// Publisher reporting as `controller_name` from `instance`
    pub fn new(client: Client, controller_name: &str, instance: Option<String>) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance,
        };
        Self {
            recorder: KubeRecorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(&self, record: &EventRecord) {
        let event = Event {
            type_: record.severity.into(),
            reason: record.reason.clone(),
            note: Some(record.message.clone()),
            action: actions::RECONCILE.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, &record.object).await {
            warn!(
                reason = %record.reason,
                error = %e,
                "Failed to publish Kubernetes event"
            );
        }
    }
}

/// Discards everything
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(&self, _record: &EventRecord) {}
}

/// Rate limit and duplicate window of the [`Correlator`]
#[derive(Clone, Debug, PartialEq)]
pub struct CorrelatorConfig {
    /// Events an object may emit back to back
    pub burst: u32,
    /// One token returns to an object's bucket per interval
    pub refill_interval: Duration,
    /// Identical events inside this window are folded into a count
    pub window: Duration,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            burst: 100,
            refill_interval: Duration::from_secs(300),
            window: Duration::from_secs(600),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct ObjectId {
    kind: Option<String>,
    namespace: Option<String>,
    name: Option<String>,
    uid: Option<String>,
}

impl From<&ObjectReference> for ObjectId {
    fn from(r: &ObjectReference) -> Self {
        Self {
            kind: r.kind.clone(),
            namespace: r.namespace.clone(),
            name: r.name.clone(),
            uid: r.uid.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct DedupKey {
    object: ObjectId,
    reason: String,
    message: String,
    severity: Severity,
}

struct Seen {
    record: EventRecord,
    last_emitted: Instant,
    suppressed: u32,
}

/// Rate limiter clock following tokio time, so paused-time tests drive it
#[derive(Clone, Debug)]
struct TokioTicks {
    origin: Instant,
}

impl governor::clock::Clock for TokioTicks {
    type Instant = Nanos;

    fn now(&self) -> Nanos {
        Nanos::from(Instant::now().saturating_duration_since(self.origin))
    }
}

impl governor::clock::ReasonablyRealtime for TokioTicks {}

type ObjectLimiter =
    RateLimiter<ObjectId, DefaultKeyedStateStore<ObjectId>, TokioTicks, NoOpMiddleware<Nanos>>;

/// Folds repeated events and rate-limits each object
pub struct Correlator {
    window: Duration,
    limiter: ObjectLimiter,
    seen: HashMap<DedupKey, Seen>,
    dropped: u64,
}

impl Correlator {
    /// Correlator with the given limits
    ///
    /// A zero burst or refill interval is raised to the smallest valid value.
    pub fn new(config: CorrelatorConfig) -> Self {
        let burst = NonZeroU32::new(config.burst).unwrap_or(NonZeroU32::MIN);
        let period = config.refill_interval.max(Duration::from_nanos(1));
        let quota = Quota::with_period(period)
            .unwrap_or_else(|| Quota::per_second(NonZeroU32::MIN))
            .allow_burst(burst);
        let clock = TokioTicks {
            origin: Instant::now(),
        };
        Self {
            window: config.window,
            limiter: RateLimiter::dashmap_with_clock(quota, &clock),
            seen: HashMap::new(),
            dropped: 0,
        }
    }

    /// Events refused because an object's bucket was empty
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Objects the rate limiter is currently tracking
    pub fn tracked_objects(&self) -> usize {
        self.limiter.len()
    }

    fn take_token(&mut self, object: &ObjectId) -> bool {
        if self.limiter.check_key(object).is_ok() {
            return true;
        }
        self.dropped += 1;
        false
    }

    fn with_count(record: &EventRecord, suppressed: u32) -> EventRecord {
        let mut out = record.clone();
        if suppressed > 0 {
            out.message = format!("{} (x{} suppressed)", record.message, suppressed);
        }
        out
    }

    /// Decide whether `record` is emitted now
    ///
    /// A repeat inside the window is counted instead; the count rides on
    /// the next emission of the same event.
    pub fn observe(&mut self, record: EventRecord) -> Option<EventRecord> {
        let now = Instant::now();
        let key = DedupKey {
            object: ObjectId::from(&record.object),
            reason: record.reason.clone(),
            message: record.message.clone(),
            severity: record.severity,
        };

        let pending = match self.seen.get_mut(&key) {
            Some(seen) if now.saturating_duration_since(seen.last_emitted) < self.window => {
                seen.suppressed += 1;
                return None;
            }
            Some(seen) => seen.suppressed,
            None => 0,
        };

        if !self.take_token(&key.object) {
            debug!(reason = %record.reason, "event rate limit reached, dropping");
            return None;
        }

        let out = Self::with_count(&record, pending);
        self.seen.insert(
            key,
            Seen {
                record,
                last_emitted: now,
                suppressed: 0,
            },
        );
        Some(out)
    }

    /// Emit counts for suppressed events whose window closed, and forget stale state
    ///
    /// Rate limit buckets that have fully refilled are evicted, so deleted
    /// objects do not accumulate.
    pub fn flush(&mut self) -> Vec<EventRecord> {
        let now = Instant::now();
        let window = self.window;
        let due: Vec<DedupKey> = self
            .seen
            .iter()
            .filter(|(_, s)| now.saturating_duration_since(s.last_emitted) >= window)
            .map(|(k, _)| k.clone())
            .collect();

        let mut out = Vec::new();
        for key in due {
            let Some(seen) = self.seen.remove(&key) else {
                continue;
            };
            if seen.suppressed == 0 {
                continue;
            }
            if !self.take_token(&key.object) {
                continue;
            }
            out.push(Self::with_count(&seen.record, seen.suppressed));
            self.seen.insert(
                key,
                Seen {
                    record: seen.record,
                    last_emitted: now,
                    suppressed: 0,
                },
            );
        }
        self.limiter.retain_recent();
        out
    }
}

const RECORDER_BUFFER: usize = 1024;
const FLUSH_INTERVAL: Duration = Duration::from_secs(60);

/// Non-blocking handle for emitting events
#[derive(Clone)]
pub struct Recorder {
    tx: Option<mpsc::Sender<EventRecord>>,
}

impl Recorder {
    /// Start the correlation task; it exits on `shutdown` or when every handle is dropped
    pub fn spawn(
        publisher: Arc<dyn EventPublisher>,
        config: CorrelatorConfig,
        shutdown: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(RECORDER_BUFFER);
        let task = tokio::spawn(run_recorder(rx, publisher, Correlator::new(config), shutdown));
        (Self { tx: Some(tx) }, task)
    }

    /// Recorder that drops every event
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Recorder whose raw records land on the returned receiver, uncorrelated
    pub fn for_testing() -> (Self, mpsc::Receiver<EventRecord>) {
        let (tx, rx) = mpsc::channel(RECORDER_BUFFER);
        (Self { tx: Some(tx) }, rx)
    }

    /// Queue an event; drops it with a warning when the buffer is full
    pub fn record(
        &self,
        object: ObjectReference,
        reason: &str,
        message: impl Into<String>,
        severity: Severity,
    ) {
        let Some(tx) = &self.tx else {
            return;
        };
        let record = EventRecord {
            object,
            reason: reason.to_string(),
            message: message.into(),
            severity,
        };
        if let Err(e) = tx.try_send(record) {
            match e {
                mpsc::error::TrySendError::Full(r) => {
                    warn!(reason = %r.reason, "event buffer full, dropping event")
                }
                mpsc::error::TrySendError::Closed(_) => {}
            }
        }
    }
}

async fn run_recorder(
    mut rx: mpsc::Receiver<EventRecord>,
    publisher: Arc<dyn EventPublisher>,
    mut correlator: Correlator,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            received = rx.recv() => {
                let Some(record) = received else { break };
                if let Some(out) = correlator.observe(record) {
                    publisher.publish(&out).await;
                }
            }
            _ = ticker.tick() => {
                for out in correlator.flush() {
                    publisher.publish(&out).await;
                }
            }
        }
    }
    debug!(dropped = correlator.dropped(), "event recorder stopped");
}

/// Well-known event reason strings
///
/// These appear in `kubectl get events` under the REASON column.
pub mod reasons {
    /// Reconcile returned an error
    pub const RECONCILE_ERROR: &str = "ReconcileError";
    /// Status commit lost an optimistic concurrency race
    pub const COMMIT_CONFLICT: &str = "CommitConflict";
    /// Reconcile exceeded its deadline
    pub const RECONCILE_TIMEOUT: &str = "ReconcileTimeout";
    /// GKE control plane is running
    pub const CLUSTER_READY: &str = "ClusterReady";
    /// GKE control plane entered an error state
    pub const CLUSTER_FAILED: &str = "ClusterFailed";
    /// GKE node pool is running
    pub const NODE_POOL_READY: &str = "NodePoolReady";
    /// GKE node pool entered an error state
    pub const NODE_POOL_FAILED: &str = "NodePoolFailed";
}

/// Well-known event action strings
pub mod actions {
    /// Standard reconciliation loop
    pub const RECONCILE: &str = "Reconcile";
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_ref(name: &str) -> ObjectReference {
        ObjectReference {
            kind: Some("GKEMachinePool".to_string()),
            namespace: Some("default".to_string()),
            name: Some(name.to_string()),
            ..Default::default()
        }
    }

    fn record(name: &str, message: &str) -> EventRecord {
        EventRecord {
            object: pool_ref(name),
            reason: reasons::NODE_POOL_FAILED.to_string(),
            message: message.to_string(),
            severity: Severity::Warning,
        }
    }

    /// Story: a failing node pool reports the same error every reconcile
    ///
    /// The first event goes out, repeats inside the window are counted, and
    /// the next emission after the window carries the count.
    #[tokio::test(start_paused = true)]
    async fn story_repeated_errors_collapse_into_a_count() {
        let mut c = Correlator::new(CorrelatorConfig::default());

        assert!(c.observe(record("pool-a", "quota")).is_some());
        for _ in 1..=4 {
            tokio::time::advance(Duration::from_secs(1)).await;
            assert!(c.observe(record("pool-a", "quota")).is_none());
        }

        tokio::time::advance(Duration::from_secs(600)).await;
        let out = c.observe(record("pool-a", "quota")).unwrap();
        assert_eq!(out.message, "quota (x4 suppressed)");
    }

    #[tokio::test(start_paused = true)]
    async fn different_messages_are_not_folded() {
        let mut c = Correlator::new(CorrelatorConfig::default());
        assert!(c.observe(record("pool-a", "quota")).is_some());
        assert!(c.observe(record("pool-a", "timeout")).is_some());
        assert!(c.observe(record("pool-b", "quota")).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn burst_limits_each_object_and_refills() {
        let mut c = Correlator::new(CorrelatorConfig {
            burst: 2,
            refill_interval: Duration::from_secs(300),
            window: Duration::from_secs(600),
        });
        assert!(c.observe(record("pool-a", "one")).is_some());
        assert!(c.observe(record("pool-a", "two")).is_some());
        assert!(c.observe(record("pool-a", "three")).is_none());
        assert_eq!(c.dropped(), 1);

        // Other objects have their own bucket
        assert!(c.observe(record("pool-b", "one")).is_some());

        tokio::time::advance(Duration::from_secs(300)).await;
        assert!(c.observe(record("pool-a", "three")).is_some());
        assert!(c.observe(record("pool-a", "four")).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn flush_emits_pending_counts_once() {
        let mut c = Correlator::new(CorrelatorConfig::default());
        c.observe(record("pool-a", "quota"));
        tokio::time::advance(Duration::from_secs(10)).await;
        c.observe(record("pool-a", "quota"));

        tokio::time::advance(Duration::from_secs(50)).await;
        assert!(c.flush().is_empty());

        tokio::time::advance(Duration::from_secs(540)).await;
        let flushed = c.flush();
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].message, "quota (x1 suppressed)");

        tokio::time::advance(Duration::from_secs(700)).await;
        assert!(c.flush().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn flush_forgets_objects_whose_bucket_refilled() {
        let mut c = Correlator::new(CorrelatorConfig {
            burst: 2,
            refill_interval: Duration::from_secs(60),
            window: Duration::from_secs(600),
        });
        for i in 0..50 {
            c.observe(record(&format!("pool-{i}"), "gone"));
        }
        assert_eq!(c.tracked_objects(), 50);

        c.flush();
        assert_eq!(c.tracked_objects(), 50, "drained buckets are kept");

        tokio::time::advance(Duration::from_secs(2 * 60)).await;
        c.flush();
        assert_eq!(c.tracked_objects(), 0);
    }

    #[tokio::test]
    async fn recorder_publishes_through_correlator() {
        let mut publisher = MockEventPublisher::new();
        publisher
            .expect_publish()
            .withf(|r| r.reason == reasons::NODE_POOL_READY)
            .times(1)
            .returning(|_| ());

        let shutdown = CancellationToken::new();
        let (recorder, task) = Recorder::spawn(
            Arc::new(publisher),
            CorrelatorConfig::default(),
            shutdown.clone(),
        );
        recorder.record(pool_ref("pool-a"), reasons::NODE_POOL_READY, "running", Severity::Normal);
        recorder.record(pool_ref("pool-a"), reasons::NODE_POOL_READY, "running", Severity::Normal);
        drop(recorder);

        // Channel closes once the last handle is gone
        task.await.unwrap();
    }

    #[tokio::test]
    async fn testing_recorder_captures_raw_records() {
        let (recorder, mut rx) = Recorder::for_testing();
        recorder.record(pool_ref("pool-a"), reasons::RECONCILE_ERROR, "boom", Severity::Warning);
        let got = rx.recv().await.unwrap();
        assert_eq!(got.reason, "ReconcileError");
        assert_eq!(got.severity, Severity::Warning);
    }

    #[test]
    fn disabled_recorder_is_silent() {
        Recorder::disabled().record(pool_ref("x"), reasons::CLUSTER_READY, "ok", Severity::Normal);
    }
}

//! Per-kind controller: notification ingest, resync and a bounded worker pool

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use capg_common::events::{reasons, Recorder, Severity};
use capg_common::leader_election::Leadership;
use capg_common::retry::RetryConfig;
use capg_common::{Error, Invocation, ObjectKey, ResourceStore, Result, StoreObject, WatchEvent};
use dashmap::DashSet;
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use k8s_openapi::api::core::v1::ObjectReference;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

#[cfg(test)]
use mockall::automock;

use crate::policy::{self, FailureUpdate};
use crate::{Action, WorkQueue};

/// Delay before re-opening a watch stream that ended or failed
const WATCH_RESTART_DELAY: Duration = Duration::from_secs(1);

/// Reconcile logic for one kind
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Reconcile: Send + Sync {
    /// Bring the object at `key` closer to its desired state
    ///
    /// Must stop promptly once `invocation` is cancelled or expired.
    async fn reconcile(&self, key: &ObjectKey, invocation: &Invocation) -> Result<Action>;
}

/// Tuning of one kind's controller
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Number of workers, and so the bound on concurrent reconciles
    pub concurrency: usize,
    /// Deadline of a single reconcile
    pub reconcile_timeout: Duration,
    /// Interval between full re-enqueues of every known object
    pub resync_period: Duration,
    /// Per-key backoff after transient failures
    pub backoff: RetryConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            reconcile_timeout: Duration::from_secs(90 * 60),
            resync_period: Duration::from_secs(10 * 60),
            backoff: RetryConfig::requeue(),
        }
    }
}

impl ControllerConfig {
    /// Config with `concurrency` workers and defaults otherwise
    pub fn with_concurrency(concurrency: usize) -> Self {
        Self {
            concurrency,
            ..Default::default()
        }
    }

    /// Reject settings that would stall the controller
    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(Error::validation("concurrency must be at least 1"));
        }
        if self.reconcile_timeout.is_zero() {
            return Err(Error::validation("reconcile timeout must be positive"));
        }
        if self.resync_period.is_zero() {
            return Err(Error::validation("resync period must be positive"));
        }
        Ok(())
    }
}

/// Drives reconciles of kind `K`
pub struct Controller<K: StoreObject> {
    kind: String,
    store: Arc<dyn ResourceStore<K>>,
    reconciler: Arc<dyn Reconcile>,
    queue: Arc<WorkQueue>,
    known: DashSet<ObjectKey>,
    config: ControllerConfig,
    recorder: Recorder,
    _kind: PhantomData<fn() -> K>,
}

impl<K: StoreObject> Controller<K> {
    /// Controller reading `store` and calling `reconciler`
    pub fn new(
        store: Arc<dyn ResourceStore<K>>,
        reconciler: Arc<dyn Reconcile>,
        config: ControllerConfig,
        recorder: Recorder,
    ) -> Self {
        let kind = K::kind(&()).to_string();
        Self {
            queue: Arc::new(WorkQueue::new(kind.clone())),
            kind,
            store,
            reconciler,
            known: DashSet::new(),
            config,
            recorder,
            _kind: PhantomData,
        }
    }

    /// Kind reconciled by this controller
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Queue feeding the workers
    pub fn queue(&self) -> Arc<WorkQueue> {
        self.queue.clone()
    }

    /// Run until `shutdown`
    ///
    /// Ingest and resync run regardless of leadership; workers only pick
    /// up keys while `leadership` is `Leading`.
    pub async fn run(
        self: Arc<Self>,
        leadership: watch::Receiver<Leadership>,
        shutdown: CancellationToken,
    ) {
        info!(kind = %self.kind, workers = self.config.concurrency, "starting controller");

        let mut tasks = JoinSet::new();
        tasks.spawn(self.clone().ingest(shutdown.clone()));
        tasks.spawn(self.clone().resync(shutdown.clone()));
        for worker in 0..self.config.concurrency {
            tasks.spawn(
                self.clone()
                    .worker(worker, leadership.clone(), shutdown.clone()),
            );
        }

        shutdown.cancelled().await;
        self.queue.shutdown();
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(kind = %self.kind, error = %e, "controller task panicked");
            }
        }
        info!(kind = %self.kind, "controller stopped");
    }

    async fn ingest(self: Arc<Self>, shutdown: CancellationToken) {
        loop {
            let mut events = self.store.watch();
            loop {
                let next = tokio::select! {
                    _ = shutdown.cancelled() => return,
                    next = events.next() => next,
                };
                match next {
                    Some(Ok(WatchEvent::Applied(key))) => {
                        self.known.insert(key.clone());
                        self.queue.enqueue(key);
                    }
                    Some(Ok(WatchEvent::Deleted(key))) => {
                        self.known.remove(&key);
                        self.queue.enqueue(key);
                    }
                    Some(Err(e)) => {
                        warn!(kind = %self.kind, error = %e, "watch failed, restarting");
                        break;
                    }
                    None => {
                        debug!(kind = %self.kind, "watch ended, restarting");
                        break;
                    }
                }
            }
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(WATCH_RESTART_DELAY) => {}
            }
        }
    }

    async fn resync(self: Arc<Self>, shutdown: CancellationToken) {
        let period = self.config.resync_period;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = ticker.tick() => {}
            }
            match self.store.list().await {
                Ok(objects) => {
                    self.known.clear();
                    for obj in &objects {
                        self.known.insert(ObjectKey::from_resource(obj));
                    }
                }
                Err(e) => {
                    warn!(kind = %self.kind, error = %e, "resync list failed, using known keys");
                }
            }
            let keys: Vec<ObjectKey> = self.known.iter().map(|k| k.clone()).collect();
            debug!(kind = %self.kind, count = keys.len(), "resync");
            for key in keys {
                self.queue.enqueue(key);
            }
        }
    }

    async fn worker(
        self: Arc<Self>,
        id: usize,
        mut leadership: watch::Receiver<Leadership>,
        shutdown: CancellationToken,
    ) {
        loop {
            let Some(term) = wait_for_term(&mut leadership, &shutdown).await else {
                return;
            };
            debug!(kind = %self.kind, worker = id, "worker active");
            loop {
                let key = tokio::select! {
                    _ = term.cancelled() => break,
                    key = self.queue.next() => match key {
                        Some(key) => key,
                        None => return,
                    },
                };
                self.process(key, &term).await;
            }
            debug!(kind = %self.kind, worker = id, "leadership term ended, worker idle");
        }
    }

    async fn process(&self, key: ObjectKey, term: &CancellationToken) {
        let resource = key.to_string();
        let invocation = Invocation::new(self.config.reconcile_timeout, term.child_token());
        let span = info_span!("reconcile", kind = %self.kind, key = %key);

        let outcome = invocation
            .run(&resource, self.reconciler.reconcile(&key, &invocation))
            .instrument(span.clone())
            .await;

        let failures = self.queue.failures(&key);
        let decision = policy::decide(&outcome, failures, &self.config.backoff);
        span.in_scope(|| self.report(&key, &outcome, decision.requeue));

        match decision.failures {
            FailureUpdate::Keep => {}
            FailureUpdate::Reset => self.queue.forget(&key),
            FailureUpdate::Increment => {
                self.queue.record_failure(&key);
            }
        }
        self.queue
            .done(&key, decision.requeue.map(|delay| Instant::now() + delay));
    }

    fn report(&self, key: &ObjectKey, outcome: &Result<Action>, requeue: Option<Duration>) {
        let error = match outcome {
            Ok(action) => {
                debug!(?action, "reconcile finished");
                return;
            }
            Err(error) => error,
        };

        let reason = match error {
            Error::Cancelled { .. } => {
                debug!("reconcile cancelled");
                return;
            }
            Error::NotFound { .. } => {
                debug!("object gone, dropping");
                return;
            }
            Error::Conflict { .. } => {
                info!(error = %error, "commit conflict, retrying");
                reasons::COMMIT_CONFLICT
            }
            Error::Timeout { .. } => {
                warn!(error = %error, ?requeue, "reconcile timed out");
                reasons::RECONCILE_TIMEOUT
            }
            _ => {
                error!(?error, ?requeue, "reconcile failed");
                reasons::RECONCILE_ERROR
            }
        };
        self.recorder
            .record(self.object_ref(key), reason, error.to_string(), Severity::Warning);
    }

    fn object_ref(&self, key: &ObjectKey) -> ObjectReference {
        ObjectReference {
            api_version: Some(K::api_version(&()).to_string()),
            kind: Some(self.kind.clone()),
            namespace: key.namespace.clone(),
            name: Some(key.name.clone()),
            ..Default::default()
        }
    }
}

/// Wait until leadership holds a live term; `None` on shutdown
async fn wait_for_term(
    leadership: &mut watch::Receiver<Leadership>,
    shutdown: &CancellationToken,
) -> Option<CancellationToken> {
    loop {
        if shutdown.is_cancelled() {
            return None;
        }
        if let Leadership::Leading(term) = &*leadership.borrow_and_update() {
            if !term.is_cancelled() {
                return Some(term.clone());
            }
        }
        tokio::select! {
            _ = shutdown.cancelled() => return None,
            changed = leadership.changed() => {
                if changed.is_err() {
                    // Sender gone: leadership can never change again.
                    shutdown.cancelled().await;
                    return None;
                }
            }
        }
    }
}

/// Type-erased controller as held by the scheduler
pub(crate) trait KindController: Send + Sync {
    fn kind(&self) -> &str;
    fn queue(&self) -> Arc<WorkQueue>;
    fn start(
        self: Arc<Self>,
        leadership: watch::Receiver<Leadership>,
        shutdown: CancellationToken,
    ) -> BoxFuture<'static, ()>;
}

impl<K: StoreObject> KindController for Controller<K> {
    fn kind(&self) -> &str {
        Controller::kind(self)
    }

    fn queue(&self) -> Arc<WorkQueue> {
        Controller::queue(self)
    }

    fn start(
        self: Arc<Self>,
        leadership: watch::Receiver<Leadership>,
        shutdown: CancellationToken,
    ) -> BoxFuture<'static, ()> {
        self.run(leadership, shutdown).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capg_common::crd::{GkeCluster, GkeClusterSpec};
    use capg_common::events::EventRecord;
    use capg_common::store::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    fn demo(name: &str) -> GkeCluster {
        let mut c = GkeCluster::new(
            name,
            GkeClusterSpec {
                project: "proj".to_string(),
                region: "europe-west1".to_string(),
            },
        );
        c.metadata.namespace = Some("default".to_string());
        c
    }

    fn fast_config(concurrency: usize) -> ControllerConfig {
        ControllerConfig {
            concurrency,
            reconcile_timeout: Duration::from_secs(5),
            resync_period: Duration::from_secs(600),
            backoff: RetryConfig::requeue(),
        }
    }

    fn controller(
        store: &MemoryStore<GkeCluster>,
        reconciler: MockReconcile,
        concurrency: usize,
    ) -> (Arc<Controller<GkeCluster>>, mpsc::Receiver<EventRecord>) {
        let (recorder, events) = Recorder::for_testing();
        let controller = Controller::new(
            Arc::new(store.clone()),
            Arc::new(reconciler),
            fast_config(concurrency),
            recorder,
        );
        (Arc::new(controller), events)
    }

    #[test]
    fn config_validation() {
        assert!(ControllerConfig::default().validate().is_ok());
        assert!(ControllerConfig::with_concurrency(0).validate().is_err());
        let cfg = ControllerConfig {
            reconcile_timeout: Duration::ZERO,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn standby_runs_nothing() {
        let store = MemoryStore::new();
        store.insert(demo("demo"));

        let mut reconciler = MockReconcile::new();
        reconciler.expect_reconcile().never();
        let (controller, _events) = controller(&store, reconciler, 2);

        let (_tx, rx) = watch::channel(Leadership::Standby);
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(controller.clone().run(rx, shutdown.clone()));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(controller.queue().len(), 1, "key observed but not processed");

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn conflict_is_recorded_and_retried_immediately() {
        let store = MemoryStore::new();
        store.insert(demo("demo"));

        let calls = Arc::new(AtomicUsize::new(0));
        let mut reconciler = MockReconcile::new();
        {
            let calls = calls.clone();
            reconciler.expect_reconcile().returning(move |key, _| {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(Error::conflict(key.to_string(), "1"))
                } else {
                    Ok(Action::Done)
                }
            });
        }
        let (controller, mut events) = controller(&store, reconciler, 1);

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(
            controller
                .clone()
                .run(Leadership::always(&shutdown), shutdown.clone()),
        );

        let event = events.recv().await.unwrap();
        assert_eq!(event.reason, reasons::COMMIT_CONFLICT);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(controller.queue().failures(&ObjectKey::new("default", "demo")), 0);

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn resync_re_enqueues_settled_keys() {
        let store = MemoryStore::new();
        store.insert(demo("demo"));

        let calls = Arc::new(AtomicUsize::new(0));
        let mut reconciler = MockReconcile::new();
        {
            let calls = calls.clone();
            reconciler.expect_reconcile().returning(move |_, _| {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(Action::Done)
            });
        }
        let (controller, _events) = controller(&store, reconciler, 1);

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(
            controller
                .clone()
                .run(Leadership::always(&shutdown), shutdown.clone()),
        );

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2, "one extra pass per resync period");

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failure_backs_off() {
        let store = MemoryStore::new();
        store.insert(demo("demo"));

        let mut reconciler = MockReconcile::new();
        reconciler
            .expect_reconcile()
            .returning(|_, _| Err(Error::transport_with_context("gke", "503")));
        let (controller, mut events) = controller(&store, reconciler, 1);

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(
            controller
                .clone()
                .run(Leadership::always(&shutdown), shutdown.clone()),
        );

        let event = events.recv().await.unwrap();
        assert_eq!(event.reason, reasons::RECONCILE_ERROR);
        tokio::task::yield_now().await;

        let key = ObjectKey::new("default", "demo");
        assert_eq!(controller.queue().failures(&key), 1);
        let pending = controller.queue().pending(&key).unwrap();
        assert!(pending.not_before > Instant::now());

        shutdown.cancel();
        handle.await.unwrap();
    }
}

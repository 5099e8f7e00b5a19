//! Scheduler behaviour against the in-memory store
//!
//! Every test runs on paused tokio time, so delays and deadlines are exact
//! and nothing actually sleeps.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use capg_common::crd::{Cluster, ClusterSpec, GkeCluster, GkeClusterSpec};
use capg_common::events::Recorder;
use capg_common::leader_election::Leadership;
use capg_common::scheme::Scheme;
use capg_common::store::MemoryStore;
use capg_common::{Invocation, ObjectKey, ResourceStore, Result};
use capg_controller::{Action, ControllerConfig, KeyStatus, Reconcile, Scheduler, WorkQueue};
use capg_scope::{with_scope, GkeClusterScope, GkeClusterScopeParams};
use futures::FutureExt;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const KIND: &str = "GKECluster";

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

fn key(name: &str) -> ObjectKey {
    ObjectKey::new("default", name)
}

/// What a scripted reconcile does to the scope on a given invocation
#[derive(Clone, Copy)]
enum Step {
    Wait(Duration),
    SetReady,
    Annotate,
}

/// Opens a real scope, applies a step, and closes the scope
struct ScriptedReconciler {
    store: MemoryStore<GkeCluster>,
    script: Box<dyn Fn(usize) -> Step + Send + Sync>,
    calls: AtomicUsize,
    gate: Option<Arc<Notify>>,
    before_commit: Option<Box<dyn Fn(usize, &MemoryStore<GkeCluster>) + Send + Sync>>,
}

impl ScriptedReconciler {
    fn new(store: &MemoryStore<GkeCluster>, script: impl Fn(usize) -> Step + Send + Sync + 'static) -> Self {
        Self {
            store: store.clone(),
            script: Box::new(script),
            calls: AtomicUsize::new(0),
            gate: None,
            before_commit: None,
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Reconcile for ScriptedReconciler {
    async fn reconcile(&self, key: &ObjectKey, invocation: &Invocation) -> Result<Action> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call == 0 {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
        }

        let Some(gke_cluster) = self.store.get(key).await? else {
            return Ok(Action::Done);
        };
        if let Some(hook) = &self.before_commit {
            hook(call, &self.store);
        }
        let scope = GkeClusterScope::new(GkeClusterScopeParams {
            store: Some(Arc::new(self.store.clone())),
            cluster: Some(Cluster::new("demo", ClusterSpec::default())),
            gke_cluster: Some(gke_cluster),
            invocation: Some(invocation.clone()),
            ..Default::default()
        })?;

        let step = (self.script)(call);
        with_scope(scope, move |scope| {
            async move {
                match step {
                    Step::Wait(d) => Ok(Action::requeue(d)),
                    Step::SetReady => {
                        scope.set_ready();
                        Ok(Action::Done)
                    }
                    Step::Annotate => {
                        scope.set_annotation("capg.test/reconciled", "true");
                        Ok(Action::Done)
                    }
                }
            }
            .boxed()
        })
        .await
    }
}

struct Running {
    queue: Arc<WorkQueue>,
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

impl Running {
    async fn stop(self) {
        self.shutdown.cancel();
        self.handle.await.unwrap();
    }
}

fn start(
    store: &MemoryStore<GkeCluster>,
    reconciler: Arc<dyn Reconcile>,
    config: ControllerConfig,
    leadership: Option<watch::Receiver<Leadership>>,
) -> Running {
    let shutdown = CancellationToken::new();
    let mut scheduler = Scheduler::new(Arc::new(Scheme::with_defaults()));
    let queue = scheduler
        .register::<GkeCluster>(Arc::new(store.clone()), reconciler, config, Recorder::disabled())
        .unwrap();
    let leadership = leadership.unwrap_or_else(|| Leadership::always(&shutdown));
    let handle = tokio::spawn(scheduler.run(leadership, shutdown.clone()));
    Running {
        queue,
        shutdown,
        handle,
    }
}

fn config(concurrency: usize) -> ControllerConfig {
    ControllerConfig {
        concurrency,
        reconcile_timeout: Duration::from_secs(60),
        ..Default::default()
    }
}

/// Story: a new GKECluster waits once, then becomes ready
///
/// The first pass only asks to come back in 30s, so nothing is written and
/// the key sits in the queue with that delay. The second pass marks it
/// ready, which is committed exactly once against the version it read.
#[tokio::test(start_paused = true)]
async fn story_requeue_after_then_single_commit() {
    let store = MemoryStore::new();
    assert_eq!(store.insert(demo("demo")), "1");

    let reconciler = Arc::new(ScriptedReconciler::new(&store, |call| match call {
        0 => Step::Wait(Duration::from_secs(30)),
        _ => Step::SetReady,
    }));
    let running = start(&store, reconciler.clone(), config(2), None);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(reconciler.calls(), 1);
    assert!(store.update_calls().is_empty());
    let pending = running.queue.pending(&key("demo")).unwrap();
    assert_eq!(pending.kind, KIND);
    let expected = Instant::now() + Duration::from_secs(30) - Duration::from_millis(100);
    assert!(pending.not_before >= expected - Duration::from_millis(10));
    assert!(pending.not_before <= expected + Duration::from_millis(10));

    tokio::time::sleep(Duration::from_secs(31)).await;
    let calls = store.update_calls();
    assert_eq!(calls.len(), 1, "one write for one change");
    assert_eq!(calls[0].expected_version, "1");
    assert!(store.object(&key("demo")).unwrap().status.unwrap().ready);

    running.stop().await;
}

/// Story: another writer updates the object between our read and our commit
///
/// The stale commit is rejected, the key is retried at once, and the retry
/// reads the new version before committing.
#[tokio::test(start_paused = true)]
async fn story_conflict_retries_immediately_with_fresh_read() {
    let store = MemoryStore::new();
    store.insert(demo("demo"));

    let mut reconciler = ScriptedReconciler::new(&store, |_| Step::Annotate);
    reconciler.before_commit = Some(Box::new(|call, store: &MemoryStore<GkeCluster>| {
        if call == 0 {
            store.modify(&key("demo"), |c| c.spec.project = "moved".to_string());
        }
    }));
    let reconciler = Arc::new(reconciler);
    let running = start(&store, reconciler.clone(), config(1), None);

    tokio::time::sleep(Duration::from_millis(10)).await;

    let calls = store.update_calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].expected_version, "1");
    assert_eq!(calls[1].expected_version, "2");
    let writes = store.committed_writes();
    assert_eq!(writes.len(), 1);

    let stored = store.object(&key("demo")).unwrap();
    assert_eq!(stored.spec.project, "moved", "external change survives");
    assert_eq!(running.queue.failures(&key("demo")), 0);

    running.stop().await;
}

#[tokio::test(start_paused = true)]
async fn notifications_while_running_cause_exactly_one_rerun() {
    let store = MemoryStore::new();
    store.insert(demo("demo"));

    let gate = Arc::new(Notify::new());
    let mut reconciler = ScriptedReconciler::new(&store, |_| Step::Wait(Duration::from_secs(3600)));
    reconciler.gate = Some(gate.clone());
    let reconciler = Arc::new(reconciler);
    let running = start(&store, reconciler.clone(), config(4), None);

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(reconciler.calls(), 1);

    for i in 0..5 {
        store.modify(&key("demo"), |c| c.spec.region = format!("region-{i}"));
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(
        running.queue.status(&key("demo")),
        KeyStatus::Running { rerun: true }
    );
    assert_eq!(reconciler.calls(), 1, "no second worker took the key");

    gate.notify_one();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(reconciler.calls(), 2);

    running.stop().await;
}

#[tokio::test(start_paused = true)]
async fn a_key_is_never_committed_concurrently() {
    let store = MemoryStore::new();
    for name in ["a", "b", "c"] {
        store.insert(demo(name));
    }
    store.set_write_latency(Duration::from_millis(200));

    let reconciler = Arc::new(ScriptedReconciler::new(&store, |call| {
        if call % 2 == 0 {
            Step::Annotate
        } else {
            Step::SetReady
        }
    }));
    let running = start(&store, reconciler.clone(), config(8), None);

    for round in 0..10 {
        for name in ["a", "b", "c"] {
            store.modify(&key(name), |c| c.spec.region = format!("r{round}"));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert!(!store.committed_writes().is_empty());
    assert_eq!(store.max_concurrent_writes_per_key(), 1);
    assert!(store.max_concurrent_writes() > 1, "keys are processed in parallel");

    running.stop().await;
}

/// Story: the store hangs while the reconcile deadline passes
///
/// The commit is abandoned at the deadline and nothing lands afterwards.
#[tokio::test(start_paused = true)]
async fn story_timeout_aborts_commit() {
    let store = MemoryStore::new();
    store.insert(demo("demo"));
    store.set_write_latency(Duration::from_secs(10));

    let reconciler = Arc::new(ScriptedReconciler::new(&store, |_| Step::SetReady));
    let config = ControllerConfig {
        concurrency: 1,
        reconcile_timeout: Duration::from_secs(1),
        ..Default::default()
    };
    let running = start(&store, reconciler.clone(), config, None);

    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert_eq!(store.update_calls().len(), 1);
    assert_eq!(running.queue.failures(&key("demo")), 1);
    assert!(matches!(
        running.queue.status(&key("demo")),
        KeyStatus::Queued { not_before } if not_before > Instant::now()
    ));

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(store.committed_writes().is_empty());

    running.stop().await;
}

#[tokio::test(start_paused = true)]
async fn standby_waits_until_promoted() {
    let store = MemoryStore::new();
    store.insert(demo("demo"));

    let reconciler = Arc::new(ScriptedReconciler::new(&store, |_| Step::SetReady));
    let (tx, rx) = watch::channel(Leadership::Standby);
    let running = start(&store, reconciler.clone(), config(2), Some(rx));

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(reconciler.calls(), 0);
    assert!(store.update_calls().is_empty());
    assert!(running.queue.pending(&key("demo")).is_some());

    tx.send(Leadership::Leading(CancellationToken::new())).unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(reconciler.calls() >= 1);
    assert_eq!(store.committed_writes().len(), 1);

    running.stop().await;
}

/// Story: leadership is lost while a commit is in flight
///
/// The write is abandoned, no further work starts, and the key stays queued
/// for whoever leads next.
#[tokio::test(start_paused = true)]
async fn story_leadership_loss_cancels_in_flight_work() {
    let store = MemoryStore::new();
    store.insert(demo("demo"));
    store.set_write_latency(Duration::from_secs(10));

    let reconciler = Arc::new(ScriptedReconciler::new(&store, |_| Step::SetReady));
    let term = CancellationToken::new();
    let (tx, rx) = watch::channel(Leadership::Leading(term.clone()));
    let running = start(&store, reconciler.clone(), config(2), Some(rx));

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(store.update_calls().len(), 1, "commit in flight");

    term.cancel();
    tx.send(Leadership::Standby).unwrap();
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert!(store.committed_writes().is_empty());
    assert_eq!(reconciler.calls(), 1);
    assert!(matches!(
        running.queue.status(&key("demo")),
        KeyStatus::Queued { .. }
    ));

    running.stop().await;
}

#[tokio::test(start_paused = true)]
async fn deleted_objects_are_dropped_quietly() {
    let store = MemoryStore::new();
    store.insert(demo("demo"));

    let reconciler = Arc::new(ScriptedReconciler::new(&store, |_| Step::Wait(Duration::from_secs(3600))));
    let running = start(&store, reconciler.clone(), config(1), None);

    tokio::time::sleep(Duration::from_millis(10)).await;
    store.delete(&key("demo"));
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(reconciler.calls(), 2);
    assert_eq!(running.queue.status(&key("demo")), KeyStatus::Idle);

    running.stop().await;
}

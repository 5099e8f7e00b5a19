//! One controller per registered kind, run together under shared leadership

use std::collections::HashMap;
use std::sync::Arc;

use capg_common::events::Recorder;
use capg_common::leader_election::Leadership;
use capg_common::scheme::Scheme;
use capg_common::{Error, ObjectKey, ResourceStore, Result, StoreObject};
use futures::future::join_all;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::controller::{Controller, ControllerConfig, KindController, Reconcile};
use crate::WorkQueue;

/// Dispatches reconciles for every registered kind
pub struct Scheduler {
    scheme: Arc<Scheme>,
    controllers: Vec<Arc<dyn KindController>>,
    queues: HashMap<String, Arc<WorkQueue>>,
}

impl Scheduler {
    /// Scheduler accepting the kinds known to `scheme`
    pub fn new(scheme: Arc<Scheme>) -> Self {
        Self {
            scheme,
            controllers: Vec::new(),
            queues: HashMap::new(),
        }
    }

    /// Add a controller for kind `K`
    ///
    /// Fails if `K` is not in the scheme, is already registered, or `config`
    /// is invalid.
    pub fn register<K: StoreObject>(
        &mut self,
        store: Arc<dyn ResourceStore<K>>,
        reconciler: Arc<dyn Reconcile>,
        config: ControllerConfig,
        recorder: Recorder,
    ) -> Result<Arc<WorkQueue>> {
        let kind = K::kind(&()).to_string();
        if !self.scheme.is_registered::<K>() {
            return Err(Error::validation(format!(
                "kind {kind} is not registered in the scheme"
            )));
        }
        if self.queues.contains_key(&kind) {
            return Err(Error::validation(format!(
                "a controller for {kind} is already registered"
            )));
        }
        config.validate()?;

        let controller = Arc::new(Controller::<K>::new(store, reconciler, config, recorder));
        let queue = controller.queue();
        self.queues.insert(kind, queue.clone());
        self.controllers.push(controller);
        Ok(queue)
    }

    /// Schedule `key` of `kind` for an immediate run
    pub fn enqueue(&self, kind: &str, key: ObjectKey) -> Result<()> {
        let queue = self
            .queue(kind)
            .ok_or_else(|| Error::validation(format!("no controller for kind {kind}")))?;
        queue.enqueue(key);
        Ok(())
    }

    /// Queue of `kind`, if registered
    pub fn queue(&self, kind: &str) -> Option<Arc<WorkQueue>> {
        self.queues.get(kind).cloned()
    }

    /// Registered kinds, in registration order
    pub fn kinds(&self) -> Vec<String> {
        self.controllers.iter().map(|c| c.kind().to_string()).collect()
    }

    /// Run every controller until `shutdown`
    pub async fn run(self, leadership: watch::Receiver<Leadership>, shutdown: CancellationToken) {
        info!(kinds = ?self.kinds(), "starting scheduler");
        let runs = self
            .controllers
            .into_iter()
            .map(|controller| controller.start(leadership.clone(), shutdown.clone()));
        join_all(runs).await;
        info!("scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::MockReconcile;
    use capg_common::crd::{GkeCluster, GkeMachinePool};
    use capg_common::store::MemoryStore;

    fn store<K: StoreObject>() -> Arc<dyn ResourceStore<K>> {
        Arc::new(MemoryStore::<K>::new())
    }

    #[test]
    fn rejects_kinds_missing_from_scheme() {
        let mut scheduler = Scheduler::new(Arc::new(Scheme::new()));
        let err = scheduler
            .register::<GkeCluster>(
                store(),
                Arc::new(MockReconcile::new()),
                ControllerConfig::default(),
                Recorder::disabled(),
            )
            .unwrap_err();
        assert!(err.to_string().contains("GKECluster"));
    }

    #[test]
    fn rejects_duplicate_registration() {
        let mut scheduler = Scheduler::new(Arc::new(Scheme::with_defaults()));
        scheduler
            .register::<GkeCluster>(
                store(),
                Arc::new(MockReconcile::new()),
                ControllerConfig::default(),
                Recorder::disabled(),
            )
            .unwrap();
        assert!(scheduler
            .register::<GkeCluster>(
                store(),
                Arc::new(MockReconcile::new()),
                ControllerConfig::default(),
                Recorder::disabled(),
            )
            .is_err());
    }

    #[tokio::test]
    async fn enqueue_routes_by_kind() {
        let mut scheduler = Scheduler::new(Arc::new(Scheme::with_defaults()));
        scheduler
            .register::<GkeCluster>(
                store(),
                Arc::new(MockReconcile::new()),
                ControllerConfig::default(),
                Recorder::disabled(),
            )
            .unwrap();
        scheduler
            .register::<GkeMachinePool>(
                store(),
                Arc::new(MockReconcile::new()),
                ControllerConfig::with_concurrency(3),
                Recorder::disabled(),
            )
            .unwrap();

        scheduler
            .enqueue("GKEMachinePool", ObjectKey::new("default", "pool"))
            .unwrap();
        assert_eq!(scheduler.queue("GKEMachinePool").unwrap().len(), 1);
        assert!(scheduler.queue("GKECluster").unwrap().is_empty());
        assert!(scheduler
            .enqueue("Machine", ObjectKey::new("default", "m"))
            .is_err());
        assert_eq!(scheduler.kinds(), vec!["GKECluster", "GKEMachinePool"]);
    }

    #[test]
    fn rejects_zero_workers() {
        let mut scheduler = Scheduler::new(Arc::new(Scheme::with_defaults()));
        let res = scheduler.register::<GkeCluster>(
            store(),
            Arc::new(MockReconcile::new()),
            ControllerConfig::with_concurrency(0),
            Recorder::disabled(),
        );
        assert!(matches!(res, Err(Error::Validation { .. })));
    }
}

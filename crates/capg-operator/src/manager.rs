//! Controller manager: wires stores, reconcilers, events and leadership

use std::sync::Arc;

use capg_common::crd::{GkeCluster, GkeMachinePool};
use capg_common::events::{CorrelatorConfig, KubeEventPublisher, Recorder};
use capg_common::gcp::{ContainerService, GkeRestClient};
use capg_common::leader_election::{KubeLeaseStore, LeaderElector, Leadership};
use capg_common::scheme::Scheme;
use capg_common::FIELD_MANAGER;
use capg_controller::reconcilers::{Context, GkeClusterReconciler, GkeMachinePoolReconciler};
use capg_controller::Scheduler;
use kube::Client;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::OperatorConfig;
use crate::startup;

/// Register one controller per owned kind
pub fn build_scheduler(
    scheme: Arc<Scheme>,
    ctx: Arc<Context>,
    config: &OperatorConfig,
) -> capg_common::Result<Scheduler> {
    let mut scheduler = Scheduler::new(scheme);
    scheduler.register::<GkeCluster>(
        ctx.gke_clusters.clone(),
        Arc::new(GkeClusterReconciler::new(ctx.clone())),
        config.controller_config(config.gke_cluster_concurrency),
        ctx.recorder.clone(),
    )?;
    scheduler.register::<GkeMachinePool>(
        ctx.gke_machine_pools.clone(),
        Arc::new(GkeMachinePoolReconciler::new(ctx.clone())),
        config.controller_config(config.gke_machine_pool_concurrency),
        ctx.recorder.clone(),
    )?;
    Ok(scheduler)
}

/// Runs the scheduler for the lifetime of the process
pub struct Manager {
    client: Client,
    config: OperatorConfig,
    identity: String,
}

impl Manager {
    /// Manager talking to the cluster through `client`
    pub fn new(client: Client, config: OperatorConfig) -> Self {
        Self {
            client,
            config,
            identity: startup::pod_identity(),
        }
    }

    /// Identity used for the Lease and events
    pub fn identity(&self) -> &str {
        &self.identity
    }

    fn leadership(
        &self,
        shutdown: &CancellationToken,
    ) -> (watch::Receiver<Leadership>, Option<JoinHandle<()>>) {
        let Some(le) = &self.config.leader_election else {
            info!("leader election disabled, running as the only replica");
            return (Leadership::always(shutdown), None);
        };
        info!(
            identity = %self.identity,
            namespace = %le.namespace,
            lease = %le.id,
            "competing for leadership"
        );
        let store = Arc::new(KubeLeaseStore::new(self.client.clone(), &le.namespace, &le.id));
        let elector = Arc::new(LeaderElector::new(store, &self.identity, le.timing.clone()));
        let leadership = elector.subscribe();
        let task = tokio::spawn(elector.run(shutdown.clone()));
        (leadership, Some(task))
    }

    /// Run until `shutdown`, then stop dispatch and release the Lease
    pub async fn run(self, shutdown: CancellationToken) -> anyhow::Result<()> {
        self.config.validate()?;

        let scheme = Arc::new(Scheme::with_defaults());
        startup::ensure_crds_present(&self.client, &scheme).await?;

        let publisher = Arc::new(KubeEventPublisher::new(
            self.client.clone(),
            FIELD_MANAGER,
            Some(self.identity.clone()),
        ));
        let (recorder, recorder_task) = Recorder::spawn(
            publisher,
            CorrelatorConfig {
                burst: self.config.event_burst,
                ..Default::default()
            },
            shutdown.clone(),
        );

        let container: Arc<dyn ContainerService> =
            Arc::new(GkeRestClient::new(&self.config.gke_api_url));
        let ctx = Arc::new(
            Context::builder()
                .client(self.client.clone(), self.config.watch_namespace.clone())
                .container(container)
                .recorder(recorder)
                .build()?,
        );
        let scheduler = build_scheduler(scheme, ctx, &self.config)?;

        let (leadership, elector_task) = self.leadership(&shutdown);
        info!(
            namespace = self.config.watch_namespace.as_deref().unwrap_or("<all>"),
            "controller manager started"
        );
        scheduler.run(leadership, shutdown.clone()).await;

        if let Some(task) = elector_task {
            if let Err(e) = task.await {
                error!(error = %e, "leader elector task failed");
            }
        }
        if let Err(e) = recorder_task.await {
            error!(error = %e, "event recorder task failed");
        }
        info!("controller manager stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capg_common::store::MemoryStore;

    fn memory_context() -> Arc<Context> {
        Arc::new(
            Context::builder()
                .gke_clusters(Arc::new(MemoryStore::new()))
                .gke_machine_pools(Arc::new(MemoryStore::new()))
                .clusters(Arc::new(MemoryStore::new()))
                .machine_pools(Arc::new(MemoryStore::new()))
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn scheduler_has_a_controller_per_owned_kind() {
        let config = OperatorConfig {
            gke_machine_pool_concurrency: 4,
            ..Default::default()
        };
        let scheduler =
            build_scheduler(Arc::new(Scheme::with_defaults()), memory_context(), &config).unwrap();
        assert_eq!(scheduler.kinds(), vec!["GKECluster", "GKEMachinePool"]);
    }

    #[test]
    fn scheduler_refuses_invalid_concurrency() {
        let config = OperatorConfig {
            gke_cluster_concurrency: 0,
            ..Default::default()
        };
        assert!(build_scheduler(Arc::new(Scheme::with_defaults()), memory_context(), &config).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn scheduler_stops_on_shutdown() {
        let scheduler = build_scheduler(
            Arc::new(Scheme::with_defaults()),
            memory_context(),
            &OperatorConfig::default(),
        )
        .unwrap();
        let shutdown = CancellationToken::new();
        let run = tokio::spawn(scheduler.run(Leadership::always(&shutdown), shutdown.clone()));
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        shutdown.cancel();
        run.await.unwrap();
    }
}

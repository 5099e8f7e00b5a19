//! GKEMachinePool reconciler

use std::sync::Arc;

use async_trait::async_trait;
use capg_common::crd::{Cluster, GkeCluster, GkeMachinePool, MachinePool, MachinePoolStatusError};
use capg_common::events::{reasons, Severity};
use capg_common::gcp::NodePoolState;
use capg_common::{Error, Invocation, ObjectKey, Result, CLUSTER_NAME_LABEL};
use capg_scope::{with_scope, GkeMachinePoolScope, GkeMachinePoolScopeParams};
use futures::FutureExt;
use kube::Resource;
use tracing::{debug, info, warn, Span};

use super::{is_paused, owner_key, Context, PROVISIONING_POLL_INTERVAL};
use crate::{Action, Reconcile};

/// Mirrors GKE node pool state into GKEMachinePool status
pub struct GkeMachinePoolReconciler {
    ctx: Arc<Context>,
}

/// Objects a GKEMachinePool needs before a scope can be opened
struct Parents {
    machine_pool: MachinePool,
    cluster: Cluster,
    gke_cluster: GkeCluster,
}

impl GkeMachinePoolReconciler {
    /// Reconciler over `ctx`
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    /// Walk GKEMachinePool → MachinePool → Cluster → GKECluster
    ///
    /// `Ok(None)` when a link is missing; the object that completes the
    /// chain triggers another run once it appears.
    async fn parents(&self, pool: &GkeMachinePool) -> Result<Option<Parents>> {
        let Some(mp_key) = owner_key(pool, &MachinePool::group(&()), &MachinePool::kind(&()))
        else {
            info!("waiting for MachinePool controller to set OwnerRef on GKEMachinePool");
            return Ok(None);
        };
        let Some(machine_pool) = self.ctx.machine_pools.get(&mp_key).await? else {
            info!(machine_pool = %mp_key, "MachinePool not found");
            return Ok(None);
        };

        let Some(cluster_name) = cluster_name(&machine_pool) else {
            info!(machine_pool = %mp_key, "MachinePool is missing cluster name");
            return Ok(None);
        };
        let cluster_key = ObjectKey {
            namespace: machine_pool.meta().namespace.clone(),
            name: cluster_name,
        };
        let Some(cluster) = self.ctx.clusters.get(&cluster_key).await? else {
            info!(cluster = %cluster_key, "Cluster not found");
            return Ok(None);
        };

        let Some(gke_key) = infrastructure_key(&cluster) else {
            info!(cluster = %cluster_key, "Cluster has no GKECluster infrastructure reference");
            return Ok(None);
        };
        let Some(gke_cluster) = self.ctx.gke_clusters.get(&gke_key).await? else {
            info!(gke_cluster = %gke_key, "GKECluster not found");
            return Ok(None);
        };

        Ok(Some(Parents {
            machine_pool,
            cluster,
            gke_cluster,
        }))
    }
}

fn cluster_name(machine_pool: &MachinePool) -> Option<String> {
    if !machine_pool.spec.cluster_name.is_empty() {
        return Some(machine_pool.spec.cluster_name.clone());
    }
    machine_pool
        .meta()
        .labels
        .as_ref()
        .and_then(|labels| labels.get(CLUSTER_NAME_LABEL))
        .cloned()
}

fn infrastructure_key(cluster: &Cluster) -> Option<ObjectKey> {
    let reference = cluster.spec.infrastructure_ref.as_ref()?;
    if reference.kind.as_deref() != Some(GkeCluster::kind(&()).as_ref()) {
        return None;
    }
    Some(ObjectKey {
        namespace: reference
            .namespace
            .clone()
            .or_else(|| cluster.meta().namespace.clone()),
        name: reference.name.clone()?,
    })
}

#[async_trait]
impl Reconcile for GkeMachinePoolReconciler {
    async fn reconcile(&self, key: &ObjectKey, invocation: &Invocation) -> Result<Action> {
        let Some(gke_machine_pool) = self.ctx.gke_machine_pools.get(key).await? else {
            debug!("GKEMachinePool no longer exists");
            return Ok(Action::Done);
        };

        let Some(parents) = self.parents(&gke_machine_pool).await? else {
            return Ok(Action::await_change());
        };

        if is_paused(&parents.cluster, &gke_machine_pool) {
            info!("GKEMachinePool or linked Cluster is paused");
            return Ok(Action::Done);
        }

        let scope = GkeMachinePoolScope::new(GkeMachinePoolScopeParams {
            store: Some(self.ctx.gke_machine_pools.clone()),
            cluster: Some(parents.cluster),
            machine_pool: Some(parents.machine_pool),
            gke_cluster: Some(parents.gke_cluster),
            gke_machine_pool: Some(gke_machine_pool),
            clients: self.ctx.clients.clone(),
            invocation: Some(invocation.clone()),
            span: Some(Span::current()),
        })?;

        let ctx = self.ctx.clone();
        with_scope(scope, move |scope| reconcile_normal(ctx, scope).boxed()).await
    }
}

async fn reconcile_normal(ctx: Arc<Context>, scope: &mut GkeMachinePoolScope) -> Result<Action> {
    let Some(container) = scope.clients().container.clone() else {
        debug!("no GKE client configured, nothing to observe");
        return Ok(Action::Done);
    };

    let observed = container
        .get_node_pool(
            scope.project(),
            scope.region(),
            scope.gke_cluster_name(),
            scope.node_pool_name(),
        )
        .await?;
    let Some(info) = observed else {
        info!(node_pool = %scope.node_pool_name(), "GKE node pool not found yet");
        return Ok(Action::requeue(PROVISIONING_POLL_INTERVAL));
    };

    match info.status {
        NodePoolState::Running => {
            if !scope.is_ready() {
                scope.set_ready();
                ctx.recorder.record(
                    scope.gke_machine_pool().object_ref(&()),
                    reasons::NODE_POOL_READY,
                    format!("GKE node pool {} is running", scope.node_pool_name()),
                    Severity::Normal,
                );
                info!("GKE node pool is running");
            }
            Ok(Action::Done)
        }
        NodePoolState::RunningWithError => {
            let message = info
                .status_message
                .unwrap_or_else(|| "node pool running with errors".to_string());
            warn!(%message, "GKE node pool degraded");
            scope.set_ready();
            ctx.recorder.record(
                scope.gke_machine_pool().object_ref(&()),
                reasons::NODE_POOL_FAILED,
                message,
                Severity::Warning,
            );
            Ok(Action::requeue(PROVISIONING_POLL_INTERVAL))
        }
        NodePoolState::Error => {
            let reason = if scope.is_ready() {
                MachinePoolStatusError::UpdateError
            } else {
                MachinePoolStatusError::CreateError
            };
            let message = format!(
                "GKE node pool {} is in ERROR state: {}",
                scope.node_pool_name(),
                info.status_message.as_deref().unwrap_or("no details")
            );
            warn!(%reason, %message, "GKE node pool failed");
            scope.set_failure_reason(reason);
            scope.set_failure_message(&message);
            ctx.recorder.record(
                scope.gke_machine_pool().object_ref(&()),
                reasons::NODE_POOL_FAILED,
                message.clone(),
                Severity::Warning,
            );
            Err(Error::domain_permanent(
                scope.key().to_string(),
                reason,
                message,
            ))
        }
        state => {
            debug!(?state, "GKE node pool still changing");
            Ok(Action::requeue(PROVISIONING_POLL_INTERVAL))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcilers::test_fixtures::*;
    use capg_common::events::Recorder;
    use capg_common::gcp::NodePoolInfo;

    fn key() -> ObjectKey {
        ObjectKey::new(NAMESPACE, "pool-a")
    }

    fn seeded() -> Stores {
        let stores = Stores::default();
        stores.clusters.insert(cluster("demo"));
        stores.gke_clusters.insert(gke_cluster("demo"));
        stores.machine_pools.insert(machine_pool("pool-a", "demo"));
        stores.gke_machine_pools.insert(gke_machine_pool("pool-a"));
        stores
    }

    fn node_pool(status: NodePoolState, message: Option<&str>) -> NodePoolInfo {
        NodePoolInfo {
            status,
            status_message: message.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn running_node_pool_sets_ready() {
        let stores = seeded();
        let mut container = MockContainer::new();
        container
            .expect_get_node_pool()
            .withf(|project, location, cluster, pool| {
                project == "proj" && location == "europe-west1" && cluster == "demo" && pool == "pool-a"
            })
            .returning(|_, _, _, _| Ok(Some(node_pool(NodePoolState::Running, None))));
        let (recorder, mut events) = Recorder::for_testing();
        let reconciler =
            GkeMachinePoolReconciler::new(Arc::new(stores.context(Some(container), recorder)));

        let action = reconciler.reconcile(&key(), &Invocation::unbounded()).await.unwrap();
        assert_eq!(action, Action::Done);
        let status = stores.gke_machine_pools.object(&key()).unwrap().status.unwrap();
        assert!(status.ready);
        assert_eq!(status.failure_reason, None);
        assert_eq!(events.try_recv().unwrap().reason, reasons::NODE_POOL_READY);
    }

    /// Story: GKE gives up on creating the node pool
    ///
    /// The failure lands in status as a CreateError with the GKE message,
    /// and the error tells the scheduler not to retry.
    #[tokio::test]
    async fn story_failed_creation_is_recorded_and_terminal() {
        let stores = seeded();
        let mut container = MockContainer::new();
        container.expect_get_node_pool().returning(|_, _, _, _| {
            Ok(Some(node_pool(NodePoolState::Error, Some("quota exceeded"))))
        });
        let (recorder, mut events) = Recorder::for_testing();
        let reconciler =
            GkeMachinePoolReconciler::new(Arc::new(stores.context(Some(container), recorder)));

        let err = reconciler
            .reconcile(&key(), &Invocation::unbounded())
            .await
            .unwrap_err();
        assert!(!err.is_retryable());

        let status = stores.gke_machine_pools.object(&key()).unwrap().status.unwrap();
        assert!(!status.ready);
        assert_eq!(status.failure_reason, Some(MachinePoolStatusError::CreateError));
        assert!(status.failure_message.unwrap().contains("quota exceeded"));
        assert_eq!(events.try_recv().unwrap().reason, reasons::NODE_POOL_FAILED);
    }

    #[tokio::test]
    async fn failure_after_ready_is_an_update_error() {
        let stores = seeded();
        stores.gke_machine_pools.modify(&key(), |pool| {
            pool.status = Some(capg_common::crd::GkeMachinePoolStatus {
                ready: true,
                ..Default::default()
            });
        });
        let mut container = MockContainer::new();
        container
            .expect_get_node_pool()
            .returning(|_, _, _, _| Ok(Some(node_pool(NodePoolState::Error, None))));
        let reconciler = GkeMachinePoolReconciler::new(Arc::new(
            stores.context(Some(container), Recorder::disabled()),
        ));

        reconciler
            .reconcile(&key(), &Invocation::unbounded())
            .await
            .unwrap_err();
        let status = stores.gke_machine_pools.object(&key()).unwrap().status.unwrap();
        assert!(status.ready, "ready is never cleared");
        assert_eq!(status.failure_reason, Some(MachinePoolStatusError::UpdateError));
    }

    #[tokio::test]
    async fn cluster_name_falls_back_to_label() {
        let stores = seeded();
        stores.machine_pools.modify(&key(), |mp| {
            mp.spec.cluster_name.clear();
            mp.metadata.labels =
                Some([(CLUSTER_NAME_LABEL.to_string(), "demo".to_string())].into());
        });
        let mut container = MockContainer::new();
        container
            .expect_get_node_pool()
            .times(1)
            .returning(|_, _, _, _| Ok(Some(node_pool(NodePoolState::Provisioning, None))));
        let reconciler = GkeMachinePoolReconciler::new(Arc::new(
            stores.context(Some(container), Recorder::disabled()),
        ));

        let action = reconciler.reconcile(&key(), &Invocation::unbounded()).await.unwrap();
        assert_eq!(action, Action::RequeueAfter(PROVISIONING_POLL_INTERVAL));
        assert!(stores.gke_machine_pools.update_calls().is_empty());
    }

    #[tokio::test]
    async fn missing_gke_cluster_waits() {
        let stores = seeded();
        stores.gke_clusters.delete(&ObjectKey::new(NAMESPACE, "demo"));
        let mut container = MockContainer::new();
        container.expect_get_node_pool().never();
        let reconciler = GkeMachinePoolReconciler::new(Arc::new(
            stores.context(Some(container), Recorder::disabled()),
        ));

        let action = reconciler.reconcile(&key(), &Invocation::unbounded()).await.unwrap();
        assert_eq!(action, Action::Done);
    }

    #[test]
    fn infrastructure_ref_must_point_at_gke_cluster() {
        let mut c = cluster("demo");
        assert_eq!(
            infrastructure_key(&c),
            Some(ObjectKey::new(NAMESPACE, "demo"))
        );
        if let Some(r) = c.spec.infrastructure_ref.as_mut() {
            r.kind = Some("AWSCluster".to_string());
        }
        assert_eq!(infrastructure_key(&c), None);
    }
}

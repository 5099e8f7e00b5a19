//! GKECluster reconciler

use std::sync::Arc;

use async_trait::async_trait;
use capg_common::crd::{Cluster, GkeCluster};
use capg_common::events::{reasons, Severity};
use capg_common::gcp::ClusterState;
use capg_common::{Error, Invocation, ObjectKey, Result};
use capg_scope::{with_scope, GkeClusterScope, GkeClusterScopeParams};
use futures::FutureExt;
use kube::Resource;
use tracing::{debug, info, warn, Span};

use super::{is_paused, owner_key, Context, PROVISIONING_POLL_INTERVAL};
use crate::{Action, Reconcile};

/// Mirrors the GKE control plane state into GKECluster status
pub struct GkeClusterReconciler {
    ctx: Arc<Context>,
}

impl GkeClusterReconciler {
    /// Reconciler over `ctx`
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    async fn owner(&self, gke: &GkeCluster) -> Result<Option<Cluster>> {
        let Some(key) = owner_key(gke, &Cluster::group(&()), &Cluster::kind(&())) else {
            return Ok(None);
        };
        self.ctx.clusters.get(&key).await
    }
}

#[async_trait]
impl Reconcile for GkeClusterReconciler {
    async fn reconcile(&self, key: &ObjectKey, invocation: &Invocation) -> Result<Action> {
        let Some(gke_cluster) = self.ctx.gke_clusters.get(key).await? else {
            debug!("GKECluster no longer exists");
            return Ok(Action::Done);
        };

        let Some(cluster) = self.owner(&gke_cluster).await? else {
            info!("waiting for Cluster controller to set OwnerRef on GKECluster");
            return Ok(Action::await_change());
        };

        if is_paused(&cluster, &gke_cluster) {
            info!(cluster = ?cluster.meta().name, "GKECluster or linked Cluster is paused");
            return Ok(Action::Done);
        }

        let scope = GkeClusterScope::new(GkeClusterScopeParams {
            store: Some(self.ctx.gke_clusters.clone()),
            cluster: Some(cluster),
            gke_cluster: Some(gke_cluster),
            clients: self.ctx.clients.clone(),
            invocation: Some(invocation.clone()),
            span: Some(Span::current()),
        })?;

        let ctx = self.ctx.clone();
        with_scope(scope, move |scope| reconcile_normal(ctx, scope).boxed()).await
    }
}

async fn reconcile_normal(ctx: Arc<Context>, scope: &mut GkeClusterScope) -> Result<Action> {
    let Some(container) = scope.clients().container.clone() else {
        debug!("no GKE client configured, nothing to observe");
        return Ok(Action::Done);
    };

    let observed = container
        .get_cluster(scope.project(), scope.region(), scope.name())
        .await?;
    let Some(info) = observed else {
        info!(project = %scope.project(), region = %scope.region(), "GKE cluster not found yet");
        return Ok(Action::requeue(PROVISIONING_POLL_INTERVAL));
    };

    match info.status {
        ClusterState::Running => {
            if let Some(endpoint) = &info.endpoint {
                scope.set_endpoint(endpoint.clone());
            }
            if !scope.is_ready() {
                scope.set_ready();
                ctx.recorder.record(
                    scope.gke_cluster().object_ref(&()),
                    reasons::CLUSTER_READY,
                    "GKE cluster is running",
                    Severity::Normal,
                );
                info!("GKE cluster is running");
            }
            Ok(Action::Done)
        }
        ClusterState::Error | ClusterState::Degraded => {
            let message = format!(
                "GKE cluster is {:?}: {}",
                info.status,
                info.status_message.as_deref().unwrap_or("no details")
            );
            warn!(%message, "GKE cluster unhealthy");
            ctx.recorder.record(
                scope.gke_cluster().object_ref(&()),
                reasons::CLUSTER_FAILED,
                message.clone(),
                Severity::Warning,
            );
            Err(Error::domain(scope.key().to_string(), message))
        }
        state => {
            debug!(?state, "GKE cluster still changing");
            Ok(Action::requeue(PROVISIONING_POLL_INTERVAL))
        }
    }
}

//! Scope around a GKECluster and its owning Cluster

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use capg_common::crd::{Cluster, GkeCluster, GkeClusterStatus};
use capg_common::{Error, Invocation, ObjectKey, ResourceStore, Result};
use tracing::{info_span, warn, Span};

use crate::{GkeClients, PatchHelper, Scope};

const SCOPE_KIND: &str = "GKECluster";

/// Inputs for [`GkeClusterScope::new`]
#[derive(Default)]
pub struct GkeClusterScopeParams {
    /// Store the GKECluster is written back to
    pub store: Option<Arc<dyn ResourceStore<GkeCluster>>>,
    /// Owning Cluster API cluster
    pub cluster: Option<Cluster>,
    /// The object under reconciliation
    pub gke_cluster: Option<GkeCluster>,
    /// Cloud clients
    pub clients: GkeClients,
    /// Deadline of the current invocation; unbounded if absent
    pub invocation: Option<Invocation>,
    /// Span for log output; one is created if absent
    pub span: Option<Span>,
}

/// Transactional handle on one GKECluster
pub struct GkeClusterScope {
    store: Arc<dyn ResourceStore<GkeCluster>>,
    patch: PatchHelper<GkeCluster>,
    clients: GkeClients,
    cluster: Cluster,
    gke_cluster: GkeCluster,
    invocation: Invocation,
    span: Span,
    closed: bool,
}

impl fmt::Debug for GkeClusterScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GkeClusterScope")
            .field("key", &self.key())
            .field("closed", &self.closed)
            .finish()
    }
}

impl GkeClusterScope {
    /// Open a scope; fails without I/O if a required input is missing
    pub fn new(params: GkeClusterScopeParams) -> Result<Self> {
        let store = params
            .store
            .ok_or_else(|| Error::construction(SCOPE_KIND, "store client is required"))?;
        let cluster = params
            .cluster
            .ok_or_else(|| Error::construction(SCOPE_KIND, "cluster is required"))?;
        let gke_cluster = params
            .gke_cluster
            .ok_or_else(|| Error::construction(SCOPE_KIND, "gke cluster is required"))?;

        let patch = PatchHelper::new(&gke_cluster)?;
        let key = ObjectKey::from_resource(&gke_cluster);
        let span = params
            .span
            .unwrap_or_else(|| info_span!("gke_cluster_scope", key = %key));

        Ok(Self {
            store,
            patch,
            clients: params.clients,
            cluster,
            gke_cluster,
            invocation: params.invocation.unwrap_or_else(Invocation::unbounded),
            span,
            closed: false,
        })
    }

    /// Identity of the wrapped object
    pub fn key(&self) -> ObjectKey {
        ObjectKey::from_resource(&self.gke_cluster)
    }

    /// GCP project
    pub fn project(&self) -> &str {
        &self.gke_cluster.spec.project
    }

    /// GKE location
    pub fn region(&self) -> &str {
        &self.gke_cluster.spec.region
    }

    /// Object name, also the GKE cluster name
    pub fn name(&self) -> &str {
        self.gke_cluster.metadata.name.as_deref().unwrap_or_default()
    }

    /// Object namespace
    pub fn namespace(&self) -> &str {
        self.gke_cluster.metadata.namespace.as_deref().unwrap_or_default()
    }

    /// Owning Cluster
    pub fn cluster(&self) -> &Cluster {
        &self.cluster
    }

    /// Wrapped object as currently mutated
    pub fn gke_cluster(&self) -> &GkeCluster {
        &self.gke_cluster
    }

    /// Cloud clients
    pub fn clients(&self) -> &GkeClients {
        &self.clients
    }

    /// Span for log output
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Whether the status already says ready
    pub fn is_ready(&self) -> bool {
        self.gke_cluster.status.as_ref().is_some_and(|s| s.ready)
    }

    fn status_mut(&mut self) -> &mut GkeClusterStatus {
        self.gke_cluster.status.get_or_insert_with(Default::default)
    }

    /// Mark the control plane ready
    pub fn set_ready(&mut self) {
        self.status_mut().ready = true;
    }

    /// Record the control plane endpoint
    pub fn set_endpoint(&mut self, endpoint: impl Into<String>) {
        self.status_mut().endpoint = Some(endpoint.into());
    }

    /// Set an annotation on the wrapped object
    pub fn set_annotation(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.gke_cluster
            .metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(key.into(), value.into());
    }

    /// Write the object back if it changed
    pub async fn patch_object(&mut self) -> Result<bool> {
        self.patch
            .patch(&mut self.gke_cluster, self.store.as_ref(), &self.invocation)
            .await
    }
}

#[async_trait]
impl Scope for GkeClusterScope {
    async fn close(mut self) -> Result<()> {
        self.closed = true;
        self.patch_object().await.map(|_| ())
    }
}

impl Drop for GkeClusterScope {
    fn drop(&mut self) {
        if !self.closed {
            let _entered = self.span.enter();
            warn!(key = %self.key(), "scope dropped without close, changes discarded");
        }
    }
}

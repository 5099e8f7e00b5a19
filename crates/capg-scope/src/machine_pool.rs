//! Scope around a GKEMachinePool, its MachinePool and their cluster

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use capg_common::crd::{
    Cluster, GkeCluster, GkeMachinePool, GkeMachinePoolStatus, MachinePool, MachinePoolStatusError,
};
use capg_common::{Error, Invocation, ObjectKey, ResourceStore, Result};
use tracing::{info_span, warn, Span};

use crate::{GkeClients, PatchHelper, Scope};

const SCOPE_KIND: &str = "GKEMachinePool";

/// Inputs for [`GkeMachinePoolScope::new`]
#[derive(Default)]
pub struct GkeMachinePoolScopeParams {
    /// Store the GKEMachinePool is written back to
    pub store: Option<Arc<dyn ResourceStore<GkeMachinePool>>>,
    /// Cluster API cluster the pool belongs to
    pub cluster: Option<Cluster>,
    /// Owning Cluster API machine pool
    pub machine_pool: Option<MachinePool>,
    /// Infrastructure object of the cluster
    pub gke_cluster: Option<GkeCluster>,
    /// The object under reconciliation
    pub gke_machine_pool: Option<GkeMachinePool>,
    /// Cloud clients
    pub clients: GkeClients,
    /// Deadline of the current invocation; unbounded if absent
    pub invocation: Option<Invocation>,
    /// Span for log output; one is created if absent
    pub span: Option<Span>,
}

/// Transactional handle on one GKEMachinePool
pub struct GkeMachinePoolScope {
    store: Arc<dyn ResourceStore<GkeMachinePool>>,
    patch: PatchHelper<GkeMachinePool>,
    clients: GkeClients,
    cluster: Cluster,
    machine_pool: MachinePool,
    gke_cluster: GkeCluster,
    gke_machine_pool: GkeMachinePool,
    invocation: Invocation,
    span: Span,
    closed: bool,
}

impl fmt::Debug for GkeMachinePoolScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GkeMachinePoolScope")
            .field("key", &self.key())
            .field("closed", &self.closed)
            .finish()
    }
}

impl GkeMachinePoolScope {
    /// Open a scope; fails without I/O if a required input is missing
    pub fn new(params: GkeMachinePoolScopeParams) -> Result<Self> {
        let missing = |what: &str| Error::construction(SCOPE_KIND, format!("{what} is required"));

        let store = params.store.ok_or_else(|| missing("store client"))?;
        let machine_pool = params.machine_pool.ok_or_else(|| missing("machine pool"))?;
        let cluster = params.cluster.ok_or_else(|| missing("cluster"))?;
        let gke_cluster = params.gke_cluster.ok_or_else(|| missing("gke cluster"))?;
        let gke_machine_pool = params
            .gke_machine_pool
            .ok_or_else(|| missing("gke machine pool"))?;

        let patch = PatchHelper::new(&gke_machine_pool)?;
        let key = ObjectKey::from_resource(&gke_machine_pool);
        let span = params
            .span
            .unwrap_or_else(|| info_span!("gke_machine_pool_scope", key = %key));

        Ok(Self {
            store,
            patch,
            clients: params.clients,
            cluster,
            machine_pool,
            gke_cluster,
            gke_machine_pool,
            invocation: params.invocation.unwrap_or_else(Invocation::unbounded),
            span,
            closed: false,
        })
    }

    /// Identity of the wrapped object
    pub fn key(&self) -> ObjectKey {
        ObjectKey::from_resource(&self.gke_machine_pool)
    }

    /// GKE location, taken from the cluster
    pub fn region(&self) -> &str {
        &self.gke_cluster.spec.region
    }

    /// GCP project, taken from the cluster
    pub fn project(&self) -> &str {
        &self.gke_cluster.spec.project
    }

    /// Name of the GKE cluster the pool belongs to
    pub fn gke_cluster_name(&self) -> &str {
        self.gke_cluster.metadata.name.as_deref().unwrap_or_default()
    }

    /// Object name
    pub fn name(&self) -> &str {
        self.gke_machine_pool
            .metadata
            .name
            .as_deref()
            .unwrap_or_default()
    }

    /// Object namespace
    pub fn namespace(&self) -> &str {
        self.gke_machine_pool
            .metadata
            .namespace
            .as_deref()
            .unwrap_or_default()
    }

    /// GKE node pool name; the object name unless set in the spec
    pub fn node_pool_name(&self) -> &str {
        self.gke_machine_pool
            .spec
            .node_pool_name
            .as_deref()
            .unwrap_or_else(|| self.name())
    }

    /// Owning Cluster
    pub fn cluster(&self) -> &Cluster {
        &self.cluster
    }

    /// Owning MachinePool
    pub fn machine_pool(&self) -> &MachinePool {
        &self.machine_pool
    }

    /// Infrastructure object of the cluster
    pub fn gke_cluster(&self) -> &GkeCluster {
        &self.gke_cluster
    }

    /// Wrapped object as currently mutated
    pub fn gke_machine_pool(&self) -> &GkeMachinePool {
        &self.gke_machine_pool
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
        self.gke_machine_pool
            .status
            .as_ref()
            .is_some_and(|s| s.ready)
    }

    fn status_mut(&mut self) -> &mut GkeMachinePoolStatus {
        self.gke_machine_pool
            .status
            .get_or_insert_with(Default::default)
    }

    /// Mark the node pool ready
    pub fn set_ready(&mut self) {
        self.status_mut().ready = true;
    }

    /// Record a terminal failure message
    pub fn set_failure_message(&mut self, err: &dyn fmt::Display) {
        self.status_mut().failure_message = Some(err.to_string());
    }

    /// Record a terminal failure reason
    pub fn set_failure_reason(&mut self, reason: MachinePoolStatusError) {
        self.status_mut().failure_reason = Some(reason);
    }

    /// Set an annotation on the wrapped object
    pub fn set_annotation(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.gke_machine_pool
            .metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(key.into(), value.into());
    }

    /// Write the object back if it changed
    pub async fn patch_object(&mut self) -> Result<bool> {
        self.patch
            .patch(
                &mut self.gke_machine_pool,
                self.store.as_ref(),
                &self.invocation,
            )
            .await
    }
}

#[async_trait]
impl Scope for GkeMachinePoolScope {
    async fn close(mut self) -> Result<()> {
        self.closed = true;
        self.patch_object().await.map(|_| ())
    }
}

impl Drop for GkeMachinePoolScope {
    fn drop(&mut self) {
        if !self.closed {
            let _entered = self.span.enter();
            warn!(key = %self.key(), "scope dropped without close, changes discarded");
        }
    }
}

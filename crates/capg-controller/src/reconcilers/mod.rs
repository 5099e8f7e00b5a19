//! GKE reconcilers and the context they share
//!
//! Both reconcilers only observe GKE: they read the cloud state through
//! [`ContainerService`] and reflect it into the status of their object.

mod gke_cluster;
mod gke_machine_pool;

pub use gke_cluster::GkeClusterReconciler;
pub use gke_machine_pool::GkeMachinePoolReconciler;

use std::sync::Arc;
use std::time::Duration;

use capg_common::crd::{Cluster, GkeCluster, GkeMachinePool, MachinePool};
use capg_common::events::Recorder;
use capg_common::gcp::ContainerService;
use capg_common::store::KubeStore;
use capg_common::{Error, ObjectKey, ResourceStore, Result, PAUSED_ANNOTATION};
use capg_scope::GkeClients;
use kube::{Client, Resource};

/// How long to wait before looking at a GKE resource that is still changing
pub const PROVISIONING_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Shared state for the GKE reconcilers
pub struct Context {
    /// GKECluster objects
    pub gke_clusters: Arc<dyn ResourceStore<GkeCluster>>,
    /// GKEMachinePool objects
    pub gke_machine_pools: Arc<dyn ResourceStore<GkeMachinePool>>,
    /// Cluster API clusters
    pub clusters: Arc<dyn ResourceStore<Cluster>>,
    /// Cluster API machine pools
    pub machine_pools: Arc<dyn ResourceStore<MachinePool>>,
    /// Cloud clients handed to scopes
    pub clients: GkeClients,
    /// Event sink
    pub recorder: Recorder,
}

impl Context {
    /// Start building a context
    pub fn builder() -> ContextBuilder {
        ContextBuilder::default()
    }
}

/// Builder for [`Context`]
///
/// Stores not set explicitly are backed by the API server and require
/// [`ContextBuilder::client`].
#[derive(Default)]
pub struct ContextBuilder {
    client: Option<Client>,
    namespace: Option<String>,
    gke_clusters: Option<Arc<dyn ResourceStore<GkeCluster>>>,
    gke_machine_pools: Option<Arc<dyn ResourceStore<GkeMachinePool>>>,
    clusters: Option<Arc<dyn ResourceStore<Cluster>>>,
    machine_pools: Option<Arc<dyn ResourceStore<MachinePool>>>,
    container: Option<Arc<dyn ContainerService>>,
    recorder: Option<Recorder>,
}

impl ContextBuilder {
    /// Back unset stores by `client`, restricted to `namespace` if given
    pub fn client(mut self, client: Client, namespace: Option<String>) -> Self {
        self.client = Some(client);
        self.namespace = namespace;
        self
    }

    /// Override the GKECluster store
    pub fn gke_clusters(mut self, store: Arc<dyn ResourceStore<GkeCluster>>) -> Self {
        self.gke_clusters = Some(store);
        self
    }

    /// Override the GKEMachinePool store
    pub fn gke_machine_pools(mut self, store: Arc<dyn ResourceStore<GkeMachinePool>>) -> Self {
        self.gke_machine_pools = Some(store);
        self
    }

    /// Override the Cluster store
    pub fn clusters(mut self, store: Arc<dyn ResourceStore<Cluster>>) -> Self {
        self.clusters = Some(store);
        self
    }

    /// Override the MachinePool store
    pub fn machine_pools(mut self, store: Arc<dyn ResourceStore<MachinePool>>) -> Self {
        self.machine_pools = Some(store);
        self
    }

    /// GKE container API used to observe clusters and node pools
    pub fn container(mut self, container: Arc<dyn ContainerService>) -> Self {
        self.container = Some(container);
        self
    }

    /// Event sink; events are dropped if unset
    pub fn recorder(mut self, recorder: Recorder) -> Self {
        self.recorder = Some(recorder);
        self
    }

    fn store<K>(&self, explicit: Option<Arc<dyn ResourceStore<K>>>) -> Result<Arc<dyn ResourceStore<K>>>
    where
        K: capg_common::StoreObject,
    {
        if let Some(store) = explicit {
            return Ok(store);
        }
        let client = self.client.clone().ok_or_else(|| {
            Error::validation(format!(
                "no store for {} and no client to create one",
                K::kind(&())
            ))
        })?;
        Ok(Arc::new(KubeStore::<K>::new(client, self.namespace.clone())))
    }

    /// Build the context
    pub fn build(mut self) -> Result<Context> {
        let gke_clusters = self.gke_clusters.take();
        let gke_machine_pools = self.gke_machine_pools.take();
        let clusters = self.clusters.take();
        let machine_pools = self.machine_pools.take();
        Ok(Context {
            gke_clusters: self.store(gke_clusters)?,
            gke_machine_pools: self.store(gke_machine_pools)?,
            clusters: self.store(clusters)?,
            machine_pools: self.store(machine_pools)?,
            clients: GkeClients {
                container: self.container.take(),
            },
            recorder: self.recorder.take().unwrap_or_else(Recorder::disabled),
        })
    }
}

/// Key of the first owner of `obj` with the given group and kind
///
/// Owners live in the namespace of the owned object.
fn owner_key<K: Resource>(obj: &K, group: &str, kind: &str) -> Option<ObjectKey> {
    let namespace = obj.meta().namespace.clone();
    obj.meta()
        .owner_references
        .as_deref()
        .unwrap_or_default()
        .iter()
        .find(|owner| owner.kind == kind && api_group(&owner.api_version) == group)
        .map(|owner| ObjectKey {
            namespace: namespace.clone(),
            name: owner.name.clone(),
        })
}

fn api_group(api_version: &str) -> &str {
    match api_version.split_once('/') {
        Some((group, _)) => group,
        None => "",
    }
}

fn has_paused_annotation<K: Resource>(obj: &K) -> bool {
    obj.meta()
        .annotations
        .as_ref()
        .is_some_and(|a| a.contains_key(PAUSED_ANNOTATION))
}

/// Whether reconciliation of `obj` under `cluster` is suspended
fn is_paused<K: Resource>(cluster: &Cluster, obj: &K) -> bool {
    cluster.spec.paused || has_paused_annotation(cluster) || has_paused_annotation(obj)
}

//! Custom Resource Definitions
//!
//! `GKECluster` and `GKEMachinePool` are owned by this provider. `Cluster`
//! and `MachinePool` are Cluster API kinds read to resolve owners.

mod capi;
mod gke_cluster;
mod gke_machine_pool;
mod types;

pub use capi::{Cluster, ClusterSpec, InfrastructureRef, MachinePool, MachinePoolSpec};
pub use gke_cluster::{GkeCluster, GkeClusterSpec, GkeClusterStatus};
pub use gke_machine_pool::{GkeMachinePool, GkeMachinePoolSpec, GkeMachinePoolStatus};
pub use types::MachinePoolStatusError;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::CustomResourceExt;

/// CRDs owned (installed and written) by this provider
pub fn owned_crds() -> Vec<CustomResourceDefinition> {
    vec![GkeCluster::crd(), GkeMachinePool::crd()]
}

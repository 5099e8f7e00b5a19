//! Read-only mirrors of the Cluster API parent objects
//!
//! Only the fields the GKE reconcilers consult are modelled; unknown fields
//! are ignored on deserialization. These types are never written back, and
//! their CRDs belong to Cluster API, not to this provider.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Reference from a Cluster API object to its infrastructure provider object
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InfrastructureRef {
    /// API version of the referenced object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    /// Kind of the referenced object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Name of the referenced object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Namespace of the referenced object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Subset of the Cluster API `Cluster` spec
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "cluster.x-k8s.io",
    version = "v1alpha3",
    kind = "Cluster",
    plural = "clusters",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Reconciliation of the cluster and its children is suspended
    #[serde(default)]
    pub paused: bool,

    /// Infrastructure provider object for this cluster
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub infrastructure_ref: Option<InfrastructureRef>,
}

/// Subset of the Cluster API `MachinePool` spec
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "exp.cluster.x-k8s.io",
    version = "v1alpha3",
    kind = "MachinePool",
    plural = "machinepools",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct MachinePoolSpec {
    /// Name of the owning Cluster
    #[serde(default)]
    pub cluster_name: String,

    /// Desired number of nodes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
}

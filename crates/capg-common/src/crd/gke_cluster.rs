//! GKECluster Custom Resource Definition
//!
//! Infrastructure provider object backing a Cluster API `Cluster` with a
//! managed GKE control plane.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Specification for a GKECluster
///
/// Example:
/// ```yaml
/// apiVersion: infrastructure.cluster.x-k8s.io/v1alpha3
/// kind: GKECluster
/// metadata:
///   name: demo
/// spec:
///   project: my-project
///   region: europe-west1
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "infrastructure.cluster.x-k8s.io",
    version = "v1alpha3",
    kind = "GKECluster",
    root = "GkeCluster",
    plural = "gkeclusters",
    namespaced,
    status = "GkeClusterStatus",
    printcolumn = r#"{"name":"Project","type":"string","jsonPath":".spec.project"}"#,
    printcolumn = r#"{"name":"Region","type":"string","jsonPath":".spec.region"}"#,
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.ready"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct GkeClusterSpec {
    /// GCP project hosting the cluster
    pub project: String,

    /// GCP region (GKE location) of the cluster
    pub region: String,
}

/// Observed state of a GKECluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GkeClusterStatus {
    /// The GKE control plane is running
    #[serde(default)]
    pub ready: bool,

    /// Control plane endpoint reported by GKE
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

//! GKEMachinePool Custom Resource Definition
//!
//! Infrastructure provider object backing a Cluster API `MachinePool` with a
//! GKE node pool.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::MachinePoolStatusError;

/// Specification for a GKEMachinePool
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "infrastructure.cluster.x-k8s.io",
    version = "v1alpha3",
    kind = "GKEMachinePool",
    root = "GkeMachinePool",
    plural = "gkemachinepools",
    namespaced,
    status = "GkeMachinePoolStatus",
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.ready"}"#,
    printcolumn = r#"{"name":"Reason","type":"string","jsonPath":".status.failureReason"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct GkeMachinePoolSpec {
    /// GKE node pool name; defaults to the object name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_pool_name: Option<String>,

    /// Compute Engine machine type of the nodes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_type: Option<String>,
}

/// Observed state of a GKEMachinePool
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GkeMachinePoolStatus {
    /// The node pool is running
    #[serde(default)]
    pub ready: bool,

    /// Terminal problem reconciling the node pool
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<MachinePoolStatusError>,

    /// Human-readable description of the terminal problem
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn machine_pool_status_round_trips_failure_fields() {
        let yaml = r#"
apiVersion: infrastructure.cluster.x-k8s.io/v1alpha3
kind: GKEMachinePool
metadata:
  name: pool-a
  namespace: default
spec:
  machineType: e2-standard-4
status:
  ready: false
  failureReason: CreateError
  failureMessage: quota exceeded
"#;
        let pool: GkeMachinePool = serde_yaml::from_str(yaml).expect("parse");
        let status = pool.status.expect("status");
        assert_eq!(
            status.failure_reason,
            Some(MachinePoolStatusError::CreateError)
        );
        assert_eq!(status.failure_message.as_deref(), Some("quota exceeded"));
        assert_eq!(pool.spec.node_pool_name, None);
        assert_eq!(pool.spec.machine_type.as_deref(), Some("e2-standard-4"));
    }
}

//! Supporting types shared by the GKE infrastructure CRDs

use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Terminal failure classification written to `status.failureReason`
///
/// Values match the Cluster API machine status error strings so that the
/// owning MachinePool controller can surface them unchanged.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum MachinePoolStatusError {
    /// The spec cannot be realised as written
    InvalidConfiguration,
    /// A spec change that cannot be applied in place
    UnsupportedChange,
    /// The cloud lacks capacity or quota
    InsufficientResources,
    /// Creating the node pool failed
    CreateError,
    /// Updating the node pool failed
    UpdateError,
    /// Deleting the node pool failed
    DeleteError,
    /// Nodes never joined the cluster
    JoinClusterTimeoutError,
}

impl MachinePoolStatusError {
    /// Wire representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidConfiguration => "InvalidConfiguration",
            Self::UnsupportedChange => "UnsupportedChange",
            Self::InsufficientResources => "InsufficientResources",
            Self::CreateError => "CreateError",
            Self::UpdateError => "UpdateError",
            Self::DeleteError => "DeleteError",
            Self::JoinClusterTimeoutError => "JoinClusterTimeoutError",
        }
    }
}

impl fmt::Display for MachinePoolStatusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

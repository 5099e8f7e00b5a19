//! Common types for the GKE cluster-api provider: CRDs, errors, stores and
//! the process-wide coordination primitives shared by every controller.

#![deny(missing_docs)]

pub mod clock;
pub mod crd;
pub mod error;
pub mod events;
pub mod gcp;
pub mod invocation;
pub mod leader_election;
pub mod retry;
pub mod scheme;
pub mod store;
pub mod telemetry;

pub use error::Error;
pub use invocation::Invocation;
pub use store::{ObjectKey, ResourceStore, StoreObject, WatchEvent, WriteTarget};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Field manager used for every write issued by this provider
pub const FIELD_MANAGER: &str = "capg-controller";

/// Name of the Lease used to elect the active controller manager
pub const DEFAULT_LEADER_ELECTION_ID: &str = "controller-leader-election-capg";

/// Namespace holding the leader election Lease when none is configured
pub const DEFAULT_LEADER_ELECTION_NAMESPACE: &str = "capg-system";

/// Label Cluster API puts on every object belonging to a cluster
pub const CLUSTER_NAME_LABEL: &str = "cluster.x-k8s.io/cluster-name";

/// Annotation that pauses reconciliation of a Cluster API object
pub const PAUSED_ANNOTATION: &str = "cluster.x-k8s.io/paused";

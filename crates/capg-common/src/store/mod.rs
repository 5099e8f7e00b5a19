//! Resource store abstraction
//!
//! Reconcilers and scopes never talk to the API server directly; they go
//! through a [`ResourceStore`], which offers reads, a restartable change
//! stream and version-checked writes of either the main resource or its
//! status subresource. [`KubeStore`] is the real
//! backend, [`MemoryStore`] a deterministic in-process one.

mod kube_store;
mod memory;

pub use kube_store::KubeStore;
pub use memory::{CommittedWrite, MemoryStore, UpdateCall};

use std::fmt;

use kube::core::NamespaceResourceScope;
use kube::Resource;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::Result;

/// Identity of a namespaced object
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    /// Namespace; `None` resolves to the client's default namespace
    pub namespace: Option<String>,
    /// Object name
    pub name: String,
}

impl ObjectKey {
    /// Key for `name` in `namespace`
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    /// Key of an existing object
    pub fn from_resource<K: Resource>(obj: &K) -> Self {
        let meta = obj.meta();
        Self {
            namespace: meta.namespace.clone(),
            name: meta.name.clone().unwrap_or_default(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Change notification from [`ResourceStore::watch`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WatchEvent {
    /// Object created, modified, or listed during a (re)sync
    Applied(ObjectKey),
    /// Object removed
    Deleted(ObjectKey),
}

impl WatchEvent {
    /// Key the event refers to
    pub fn key(&self) -> &ObjectKey {
        match self {
            WatchEvent::Applied(key) | WatchEvent::Deleted(key) => key,
        }
    }
}

/// Part of an object a conditional write replaces
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteTarget {
    /// Metadata and spec; the stored status is left as is
    Object,
    /// The status subresource; everything else is left as is
    Status,
}

/// Bound satisfied by every kind the stores handle
pub trait StoreObject:
    Resource<DynamicType = (), Scope = NamespaceResourceScope>
    + Clone
    + Serialize
    + DeserializeOwned
    + fmt::Debug
    + Send
    + Sync
    + 'static
{
}

impl<K> StoreObject for K where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>
        + Clone
        + Serialize
        + DeserializeOwned
        + fmt::Debug
        + Send
        + Sync
        + 'static
{
}

/// Read, watch and conditionally write objects of kind `K`
#[async_trait]
pub trait ResourceStore<K: StoreObject>: Send + Sync {
    /// Fetch one object; `Ok(None)` if it does not exist
    async fn get(&self, key: &ObjectKey) -> Result<Option<K>>;

    /// All objects visible to this store
    async fn list(&self) -> Result<Vec<K>>;

    /// Lazy, infinite change stream
    ///
    /// Starts with an `Applied` event for every existing object. An `Err`
    /// item means the stream must be restarted by calling `watch` again.
    fn watch(&self) -> BoxStream<'static, Result<WatchEvent>>;

    /// Write metadata and spec of `obj` if the stored version still equals `expected_version`
    ///
    /// The stored status is not touched. Returns the new resourceVersion.
    /// Fails with `Error::Conflict` when the version is stale and
    /// `Error::NotFound` when the object is gone.
    async fn conditional_update(&self, obj: &K, expected_version: &str) -> Result<String>;

    /// Write the status of `obj` under the same version check
    ///
    /// Nothing outside the status is touched; errors as for
    /// [`conditional_update`](Self::conditional_update).
    async fn conditional_update_status(&self, obj: &K, expected_version: &str) -> Result<String>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{GkeCluster, GkeClusterSpec};

    #[test]
    fn key_display_includes_namespace() {
        assert_eq!(ObjectKey::new("default", "demo").to_string(), "default/demo");
        let bare = ObjectKey {
            namespace: None,
            name: "demo".to_string(),
        };
        assert_eq!(bare.to_string(), "demo");
    }

    #[test]
    fn key_from_resource() {
        let mut cluster = GkeCluster::new("demo", GkeClusterSpec::default());
        cluster.metadata.namespace = Some("capi".to_string());
        assert_eq!(ObjectKey::from_resource(&cluster), ObjectKey::new("capi", "demo"));
    }
}

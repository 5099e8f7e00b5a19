//! Registry of the resource kinds this process knows how to handle
//!
//! Built once at startup and shared via `Arc<Scheme>`. The scheduler refuses
//! controllers for unregistered kinds, and startup checks that the CRDs of
//! every owned kind are installed.

use std::fmt;

use dashmap::DashMap;
use kube::Resource;

use crate::crd::{Cluster, GkeCluster, GkeMachinePool, MachinePool};

/// Identity of a registered kind
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KindInfo {
    /// API group
    pub group: String,
    /// API version
    pub version: String,
    /// Kind name
    pub kind: String,
    /// Plural resource name
    pub plural: String,
    /// Whether this provider installs and writes the kind
    pub owned: bool,
}

impl KindInfo {
    fn of<K: Resource<DynamicType = ()>>(owned: bool) -> Self {
        Self {
            group: K::group(&()).to_string(),
            version: K::version(&()).to_string(),
            kind: K::kind(&()).to_string(),
            plural: K::plural(&()).to_string(),
            owned,
        }
    }

    /// `<plural>.<group>`, the CRD object name
    pub fn crd_name(&self) -> String {
        format!("{}.{}", self.plural, self.group)
    }

    /// `<group>/<version>`
    pub fn api_version(&self) -> String {
        format!("{}/{}", self.group, self.version)
    }

    fn id(&self) -> String {
        format!("{}.{}", self.kind, self.group)
    }
}

impl fmt::Display for KindInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.api_version(), self.kind)
    }
}

/// Process-wide kind registry
#[derive(Default)]
pub struct Scheme {
    kinds: DashMap<String, KindInfo>,
}

impl Scheme {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the provider's own kinds and the Cluster API parents
    pub fn with_defaults() -> Self {
        let scheme = Self::new();
        scheme.register_owned::<GkeCluster>();
        scheme.register_owned::<GkeMachinePool>();
        scheme.register::<Cluster>();
        scheme.register::<MachinePool>();
        scheme
    }

    /// Register a kind read by this provider
    pub fn register<K: Resource<DynamicType = ()>>(&self) {
        self.insert(KindInfo::of::<K>(false));
    }

    /// Register a kind installed and written by this provider
    pub fn register_owned<K: Resource<DynamicType = ()>>(&self) {
        self.insert(KindInfo::of::<K>(true));
    }

    fn insert(&self, info: KindInfo) {
        self.kinds.insert(info.id(), info);
    }

    /// Registration of `K`, if any
    pub fn kind_info<K: Resource<DynamicType = ()>>(&self) -> Option<KindInfo> {
        let wanted = KindInfo::of::<K>(false);
        self.kinds.get(&wanted.id()).map(|e| e.value().clone())
    }

    /// Whether `K` has been registered
    pub fn is_registered<K: Resource<DynamicType = ()>>(&self) -> bool {
        self.kind_info::<K>().is_some()
    }

    /// Kinds whose CRDs this provider owns, sorted by kind
    pub fn owned_kinds(&self) -> Vec<KindInfo> {
        let mut owned: Vec<KindInfo> = self
            .kinds
            .iter()
            .filter(|e| e.owned)
            .map(|e| e.value().clone())
            .collect();
        owned.sort_by(|a, b| a.kind.cmp(&b.kind));
        owned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_register_all_participating_kinds() {
        let scheme = Scheme::with_defaults();
        assert!(scheme.is_registered::<GkeCluster>());
        assert!(scheme.is_registered::<GkeMachinePool>());
        assert!(scheme.is_registered::<Cluster>());
        assert!(scheme.is_registered::<MachinePool>());
    }

    #[test]
    fn only_gke_kinds_are_owned() {
        let owned = Scheme::with_defaults().owned_kinds();
        let names: Vec<String> = owned.iter().map(|k| k.crd_name()).collect();
        assert_eq!(
            names,
            vec![
                "gkeclusters.infrastructure.cluster.x-k8s.io",
                "gkemachinepools.infrastructure.cluster.x-k8s.io",
            ]
        );
    }

    #[test]
    fn empty_scheme_knows_nothing() {
        let scheme = Scheme::new();
        assert!(!scheme.is_registered::<GkeCluster>());
        scheme.register_owned::<GkeCluster>();
        let info = scheme.kind_info::<GkeCluster>().unwrap();
        assert_eq!(info.to_string(), "infrastructure.cluster.x-k8s.io/v1alpha3/GKECluster");
    }
}

//! Snapshot-and-diff commit of one object

use std::marker::PhantomData;

use capg_common::{Error, Invocation, ObjectKey, ResourceStore, Result, StoreObject};
use kube::Resource;
use serde_json::Value;
use tracing::debug;

/// An object split into everything but its status, and its status
#[derive(Debug, PartialEq)]
struct Parts {
    object: Value,
    status: Value,
}

impl Parts {
    fn of<K: StoreObject>(obj: &K) -> Result<Self> {
        let mut object = serde_json::to_value(obj)?;
        let status = match &mut object {
            Value::Object(map) => map.remove("status").unwrap_or(Value::Null),
            _ => Value::Null,
        };
        Ok(Self { object, status })
    }
}

/// Remembers an object as first observed and writes it back only if it changed
///
/// Metadata/spec and status are compared separately and only the changed
/// parts are written, so a status-only change is a single write. When both
/// changed, the object goes first and the status second, pinned to the
/// version the first write produced; the invocation is checked again in
/// between, so nothing is written once it has ended.
pub struct PatchHelper<K> {
    baseline: Parts,
    _kind: PhantomData<fn() -> K>,
}

impl<K: StoreObject> PatchHelper<K> {
    /// Snapshot `obj`
    pub fn new(obj: &K) -> Result<Self> {
        Ok(Self {
            baseline: Parts::of(obj)?,
            _kind: PhantomData,
        })
    }

    /// Whether `obj` differs from the snapshot
    pub fn has_changes(&self, obj: &K) -> Result<bool> {
        Ok(Parts::of(obj)? != self.baseline)
    }

    /// Write `obj` back if it changed; returns whether a write was issued
    ///
    /// Writes are conditional on the resourceVersion observed when the
    /// object was read, and are abandoned if `invocation` ends first. On
    /// success `obj` carries the new version and becomes the new snapshot.
    pub async fn patch(
        &mut self,
        obj: &mut K,
        store: &dyn ResourceStore<K>,
        invocation: &Invocation,
    ) -> Result<bool> {
        let current = Parts::of(obj)?;
        let object_changed = current.object != self.baseline.object;
        let status_changed = current.status != self.baseline.status;
        if !object_changed && !status_changed {
            return Ok(false);
        }

        let key = ObjectKey::from_resource(obj).to_string();
        let mut expected = obj
            .meta()
            .resource_version
            .clone()
            .ok_or_else(|| Error::validation(format!("{key} has no resourceVersion")))?;

        if object_changed {
            invocation.check(&key)?;
            let version = invocation
                .run(&key, store.conditional_update(&*obj, &expected))
                .await?;
            debug!(key = %key, expected_version = %expected, new_version = %version, "object committed");
            obj.meta_mut().resource_version = Some(version.clone());
            self.baseline.object = Parts::of(obj)?.object;
            expected = version;
        }

        if status_changed {
            invocation.check(&key)?;
            let version = invocation
                .run(&key, store.conditional_update_status(&*obj, &expected))
                .await?;
            debug!(key = %key, expected_version = %expected, new_version = %version, "status committed");
            obj.meta_mut().resource_version = Some(version);
        }

        self.baseline = Parts::of(obj)?;
        Ok(true)
    }
}

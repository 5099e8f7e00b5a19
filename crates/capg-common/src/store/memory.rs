//! In-process store with API-server write semantics
//!
//! Versions come from one monotonically increasing counter, the first
//! inserted object getting `"1"`. Every write attempt and every committed
//! write is recorded so tests can assert on what reached the store.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use serde_json::Value;

use super::{ObjectKey, ResourceStore, StoreObject, WatchEvent, WriteTarget};
use crate::{Error, Result};

const EVENT_BUFFER: usize = 1024;

/// One conditional write, recorded when it starts
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpdateCall {
    /// Object written
    pub key: ObjectKey,
    /// Part of the object written
    pub target: WriteTarget,
    /// Version the writer claimed to have observed
    pub expected_version: String,
}

/// A write that was applied
#[derive(Clone, Debug)]
pub struct CommittedWrite {
    /// Object written
    pub key: ObjectKey,
    /// Part of the object written
    pub target: WriteTarget,
    /// Version the writer claimed to have observed
    pub expected_version: String,
    /// Version after the write
    pub new_version: String,
    /// When the write landed
    pub at: tokio::time::Instant,
}

struct State<K> {
    objects: BTreeMap<ObjectKey, K>,
    version: u64,
    calls: Vec<UpdateCall>,
    committed: Vec<CommittedWrite>,
    injected: VecDeque<Error>,
    in_flight: HashMap<ObjectKey, usize>,
    max_in_flight: usize,
    max_in_flight_per_key: usize,
    write_latency: Duration,
}

/// [`ResourceStore`] held entirely in memory
pub struct MemoryStore<K> {
    state: Arc<Mutex<State<K>>>,
    events: broadcast::Sender<WatchEvent>,
}

impl<K> Clone for MemoryStore<K> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
            events: self.events.clone(),
        }
    }
}

impl<K: StoreObject> Default for MemoryStore<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: StoreObject> MemoryStore<K> {
    /// Empty store
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            state: Arc::new(Mutex::new(State {
                objects: BTreeMap::new(),
                version: 0,
                calls: Vec::new(),
                committed: Vec::new(),
                injected: VecDeque::new(),
                in_flight: HashMap::new(),
                max_in_flight: 0,
                max_in_flight_per_key: 0,
                write_latency: Duration::ZERO,
            })),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<K>> {
        // A panicking test thread must not hide the store from the others
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn notify(&self, event: WatchEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Create or overwrite an object as an external writer would; returns its version
    pub fn insert(&self, mut obj: K) -> String {
        let key = ObjectKey::from_resource(&obj);
        let version = {
            let mut state = self.lock();
            state.version += 1;
            let version = state.version.to_string();
            obj.meta_mut().resource_version = Some(version.clone());
            state.objects.insert(key.clone(), obj);
            version
        };
        self.notify(WatchEvent::Applied(key));
        version
    }

    /// Mutate a stored object as an external writer; `None` if absent
    pub fn modify(&self, key: &ObjectKey, f: impl FnOnce(&mut K)) -> Option<String> {
        let version = {
            let mut state = self.lock();
            if !state.objects.contains_key(key) {
                return None;
            }
            state.version += 1;
            let version = state.version.to_string();
            let obj = state.objects.get_mut(key)?;
            f(obj);
            obj.meta_mut().resource_version = Some(version.clone());
            version
        };
        self.notify(WatchEvent::Applied(key.clone()));
        Some(version)
    }

    /// Remove an object; returns whether it existed
    pub fn delete(&self, key: &ObjectKey) -> bool {
        let removed = self.lock().objects.remove(key).is_some();
        if removed {
            self.notify(WatchEvent::Deleted(key.clone()));
        }
        removed
    }

    /// Current copy of an object
    pub fn object(&self, key: &ObjectKey) -> Option<K> {
        self.lock().objects.get(key).cloned()
    }

    /// Make the next conditional write fail with `err` before touching state
    pub fn fail_next_update(&self, err: Error) {
        self.lock().injected.push_back(err);
    }

    /// Delay every write by `latency` before it is applied
    pub fn set_write_latency(&self, latency: Duration) {
        self.lock().write_latency = latency;
    }

    /// Every conditional write attempted so far
    pub fn update_calls(&self) -> Vec<UpdateCall> {
        self.lock().calls.clone()
    }

    /// Every write that was applied
    pub fn committed_writes(&self) -> Vec<CommittedWrite> {
        self.lock().committed.clone()
    }

    /// Highest number of writes in progress at once
    pub fn max_concurrent_writes(&self) -> usize {
        self.lock().max_in_flight
    }

    /// Highest number of writes in progress at once for a single key
    pub fn max_concurrent_writes_per_key(&self) -> usize {
        self.lock().max_in_flight_per_key
    }
}

/// Tracks one in-progress write; released even when the write future is dropped
struct InFlight<K> {
    state: Arc<Mutex<State<K>>>,
    key: ObjectKey,
}

impl<K> InFlight<K> {
    fn enter(state: &Arc<Mutex<State<K>>>, key: ObjectKey) -> Self {
        {
            let mut s = state.lock().unwrap_or_else(|p| p.into_inner());
            let per_key = {
                let n = s.in_flight.entry(key.clone()).or_insert(0);
                *n += 1;
                *n
            };
            let total: usize = s.in_flight.values().sum();
            s.max_in_flight = s.max_in_flight.max(total);
            s.max_in_flight_per_key = s.max_in_flight_per_key.max(per_key);
        }
        Self {
            state: Arc::clone(state),
            key,
        }
    }
}

impl<K> Drop for InFlight<K> {
    fn drop(&mut self) {
        let mut s = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(n) = s.in_flight.get_mut(&self.key) {
            *n -= 1;
            if *n == 0 {
                s.in_flight.remove(&self.key);
            }
        }
    }
}

#[async_trait]
impl<K: StoreObject> ResourceStore<K> for MemoryStore<K> {
    async fn get(&self, key: &ObjectKey) -> Result<Option<K>> {
        Ok(self.object(key))
    }

    async fn list(&self) -> Result<Vec<K>> {
        Ok(self.lock().objects.values().cloned().collect())
    }

    fn watch(&self) -> BoxStream<'static, Result<WatchEvent>> {
        // Subscribe before snapshotting so nothing falls between the two
        let updates = BroadcastStream::new(self.events.subscribe()).map(|item| {
            item.map_err(|e| Error::transport_with_context("watch", e.to_string()))
        });
        let snapshot: Vec<Result<WatchEvent>> = self
            .lock()
            .objects
            .keys()
            .map(|k| Ok(WatchEvent::Applied(k.clone())))
            .collect();
        stream::iter(snapshot).chain(updates).boxed()
    }

    async fn conditional_update(&self, obj: &K, expected_version: &str) -> Result<String> {
        self.write(obj, expected_version, WriteTarget::Object).await
    }

    async fn conditional_update_status(&self, obj: &K, expected_version: &str) -> Result<String> {
        self.write(obj, expected_version, WriteTarget::Status).await
    }
}

impl<K: StoreObject> MemoryStore<K> {
    async fn write(&self, obj: &K, expected_version: &str, target: WriteTarget) -> Result<String> {
        let key = ObjectKey::from_resource(obj);
        let (latency, injected) = {
            let mut state = self.lock();
            state.calls.push(UpdateCall {
                key: key.clone(),
                target,
                expected_version: expected_version.to_string(),
            });
            (state.write_latency, state.injected.pop_front())
        };
        let _in_flight = InFlight::enter(&self.state, key.clone());

        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if let Some(err) = injected {
            return Err(err);
        }

        let new_version = {
            let mut state = self.lock();
            let current = state
                .objects
                .get(&key)
                .ok_or_else(|| Error::not_found(key.to_string()))?;
            if current.meta().resource_version.as_deref().unwrap_or_default() != expected_version {
                return Err(Error::conflict(key.to_string(), expected_version));
            }
            let mut stored = merge(current, obj, target)?;
            state.version += 1;
            let new_version = state.version.to_string();
            stored.meta_mut().resource_version = Some(new_version.clone());
            state.objects.insert(key.clone(), stored);
            state.committed.push(CommittedWrite {
                key: key.clone(),
                target,
                expected_version: expected_version.to_string(),
                new_version: new_version.clone(),
                at: tokio::time::Instant::now(),
            });
            new_version
        };
        self.notify(WatchEvent::Applied(key));
        Ok(new_version)
    }
}

/// `current` with the `target` part taken from `incoming`, as the API server applies it
fn merge<K: StoreObject>(current: &K, incoming: &K, target: WriteTarget) -> Result<K> {
    let current = serde_json::to_value(current)?;
    let incoming = serde_json::to_value(incoming)?;
    let (mut base, status) = match target {
        WriteTarget::Object => (incoming, current.get("status").cloned()),
        WriteTarget::Status => (current, incoming.get("status").cloned()),
    };
    if let Value::Object(map) = &mut base {
        match status {
            Some(status) => map.insert("status".to_string(), status),
            None => map.remove("status"),
        };
    }
    Ok(serde_json::from_value(base)?)
}

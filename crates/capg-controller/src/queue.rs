//! Deduplicating, delay-aware work queue for one resource kind
//!
//! A key is in at most one of three places: absent (idle), queued with a
//! `not_before` time, or running. Notifications for a running key only
//! record that another run is wanted; it is queued again when the running
//! invocation reports back through [`WorkQueue::done`].

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use capg_common::ObjectKey;
use tokio::sync::Notify;
use tokio::time::Instant;

/// A pending unit of work
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkItem {
    /// Kind the key belongs to
    pub kind: String,
    /// Object to reconcile
    pub key: ObjectKey,
    /// Earliest time a worker may pick it up
    pub not_before: Instant,
}

/// Externally visible state of a key
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyStatus {
    /// Nothing scheduled
    Idle,
    /// Waiting for a worker
    Queued {
        /// Earliest time a worker may pick it up
        not_before: Instant,
    },
    /// A worker holds the key
    Running {
        /// Whether another run was requested meanwhile
        rerun: bool,
    },
}

#[derive(Debug)]
enum KeyState {
    Queued { not_before: Instant },
    Running { rerun: Option<Instant> },
}

#[derive(Debug, Default)]
struct Inner {
    states: HashMap<ObjectKey, KeyState>,
    schedule: BTreeSet<(Instant, ObjectKey)>,
    failures: HashMap<ObjectKey, u32>,
    shutdown: bool,
}

impl Inner {
    fn queue(&mut self, key: ObjectKey, at: Instant) {
        self.schedule.insert((at, key.clone()));
        self.states.insert(key, KeyState::Queued { not_before: at });
    }
}

/// Work queue shared by the workers of one kind
#[derive(Debug)]
pub struct WorkQueue {
    kind: String,
    inner: Mutex<Inner>,
    notify: Notify,
}

impl WorkQueue {
    /// Empty queue for `kind`
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
        }
    }

    /// Kind served by this queue
    pub fn kind(&self) -> &str {
        &self.kind
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // Every critical section leaves Inner consistent, so a poisoned
        // lock is still usable.
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Schedule `key` to run as soon as possible
    pub fn enqueue(&self, key: ObjectKey) {
        self.enqueue_at(key, Instant::now());
    }

    /// Schedule `key` to run after `delay`
    pub fn enqueue_after(&self, key: ObjectKey, delay: Duration) {
        self.enqueue_at(key, Instant::now() + delay);
    }

    /// Schedule `key` to run no earlier than `at`
    ///
    /// An already queued key keeps the earlier of the two times. A running
    /// key is marked for one more run after it finishes.
    pub fn enqueue_at(&self, key: ObjectKey, at: Instant) {
        let mut inner = self.lock();
        if inner.shutdown {
            return;
        }
        match inner.states.get_mut(&key) {
            None => inner.queue(key, at),
            Some(KeyState::Queued { not_before }) => {
                if at < *not_before {
                    let old = *not_before;
                    inner.schedule.remove(&(old, key.clone()));
                    inner.queue(key, at);
                } else {
                    return;
                }
            }
            Some(KeyState::Running { rerun }) => {
                *rerun = Some(rerun.map_or(at, |r| r.min(at)));
                return;
            }
        }
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Wait for the next key that is due and mark it running
    ///
    /// Returns `None` once the queue is shut down. Cancel safe: a key is
    /// only claimed by the poll that returns it.
    pub async fn next(&self) -> Option<ObjectKey> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wake_at = {
                let mut inner = self.lock();
                if inner.shutdown {
                    return None;
                }
                match inner.schedule.first().cloned() {
                    Some((at, key)) if at <= Instant::now() => {
                        inner.schedule.remove(&(at, key.clone()));
                        inner
                            .states
                            .insert(key.clone(), KeyState::Running { rerun: None });
                        return Some(key);
                    }
                    Some((at, _)) => Some(at),
                    None => None,
                }
            };

            match wake_at {
                Some(at) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Release a running key, optionally asking for another run at `requeue_at`
    ///
    /// A run requested while the key was running is merged in; the earlier
    /// time wins.
    pub fn done(&self, key: &ObjectKey, requeue_at: Option<Instant>) {
        let mut inner = self.lock();
        let rerun = match inner.states.remove(key) {
            Some(KeyState::Running { rerun }) => rerun,
            Some(other) => {
                inner.states.insert(key.clone(), other);
                return;
            }
            None => None,
        };
        let next = match (requeue_at, rerun) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        let Some(at) = next else {
            return;
        };
        if inner.shutdown {
            return;
        }
        inner.queue(key.clone(), at);
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Consecutive failures recorded for `key`
    pub fn failures(&self, key: &ObjectKey) -> u32 {
        self.lock().failures.get(key).copied().unwrap_or(0)
    }

    /// Count one more failure for `key`, returning the new count
    pub fn record_failure(&self, key: &ObjectKey) -> u32 {
        let mut inner = self.lock();
        let count = inner.failures.entry(key.clone()).or_insert(0);
        *count = count.saturating_add(1);
        *count
    }

    /// Reset the failure count of `key`
    pub fn forget(&self, key: &ObjectKey) {
        self.lock().failures.remove(key);
    }

    /// Current state of `key`
    pub fn status(&self, key: &ObjectKey) -> KeyStatus {
        match self.lock().states.get(key) {
            None => KeyStatus::Idle,
            Some(KeyState::Queued { not_before }) => KeyStatus::Queued {
                not_before: *not_before,
            },
            Some(KeyState::Running { rerun }) => KeyStatus::Running {
                rerun: rerun.is_some(),
            },
        }
    }

    /// The queued work item for `key`, if any
    pub fn pending(&self, key: &ObjectKey) -> Option<WorkItem> {
        match self.lock().states.get(key) {
            Some(KeyState::Queued { not_before }) => Some(WorkItem {
                kind: self.kind.clone(),
                key: key.clone(),
                not_before: *not_before,
            }),
            _ => None,
        }
    }

    /// Number of queued keys, due or not
    pub fn len(&self) -> usize {
        self.lock().schedule.len()
    }

    /// Whether no key is queued
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop handing out work; pending `next` calls return `None`
    pub fn shutdown(&self) {
        self.lock().shutdown = true;
        self.notify.notify_waiters();
    }
}

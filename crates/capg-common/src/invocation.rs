//! Deadline and cancellation for a single reconcile invocation
//!
//! The scheduler hands every invocation an [`Invocation`]; scopes check it
//! before their conditional write and race the write against it, so nothing
//! is committed once the deadline has passed or leadership was lost.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

/// Far enough in the future to never fire
const UNBOUNDED: Duration = Duration::from_secs(60 * 60 * 24 * 365);

/// Deadline plus cancellation token of one reconcile invocation
#[derive(Clone, Debug)]
pub struct Invocation {
    started: Instant,
    deadline: Instant,
    cancel: CancellationToken,
}

impl Invocation {
    /// Invocation expiring `timeout` from now, cancelled with `cancel`
    pub fn new(timeout: Duration, cancel: CancellationToken) -> Self {
        let started = Instant::now();
        Self {
            started,
            deadline: started + timeout,
            cancel,
        }
    }

    /// Invocation with no deadline that is never cancelled
    pub fn unbounded() -> Self {
        Self::new(UNBOUNDED, CancellationToken::new())
    }

    /// When the invocation expires
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Token cancelled when the invocation must stop
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Fail if the invocation was cancelled or has expired
    pub fn check(&self, resource: &str) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::cancelled(resource));
        }
        if Instant::now() >= self.deadline {
            return Err(Error::timeout(resource, self.deadline - self.started));
        }
        Ok(())
    }

    /// Drive `fut` until it completes, the deadline passes, or the token fires
    ///
    /// `fut` is dropped at the point it was suspended when the invocation
    /// ends first.
    pub async fn run<T, F>(&self, resource: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.check(resource)?;
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::cancelled(resource)),
            _ = tokio::time::sleep_until(self.deadline) => {
                Err(Error::timeout(resource, self.deadline - self.started))
            }
            out = fut => out,
        }
    }
}

//! Requeue policy: how a reconcile outcome maps onto the work queue
//!
//! | outcome | next run | failure counter |
//! |---|---|---|
//! | `Done` | none | reset |
//! | `RequeueNow` / `RequeueAfter(d)` | now / after `d` | reset |
//! | `Conflict`, `Cancelled` | now | unchanged |
//! | `Timeout`, `Transport`, retryable `Kube`/`Domain` | after backoff | +1 |
//! | anything else | none | reset |

use std::time::Duration;

use capg_common::retry::RetryConfig;
use capg_common::{Error, Result};

use crate::Action;

/// How the failure counter of a key changes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureUpdate {
    /// Leave as is
    Keep,
    /// Back to zero
    Reset,
    /// One more consecutive failure
    Increment,
}

/// What to do with a key after an invocation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Decision {
    /// Delay before the next run; `None` drops the key until the next notification
    pub requeue: Option<Duration>,
    /// Change to the failure counter
    pub failures: FailureUpdate,
}

impl Decision {
    fn drop_key() -> Self {
        Self {
            requeue: None,
            failures: FailureUpdate::Reset,
        }
    }

    fn immediately() -> Self {
        Self {
            requeue: Some(Duration::ZERO),
            failures: FailureUpdate::Keep,
        }
    }
}

/// Decide the next step for a key given its outcome and prior failure count
pub fn decide(outcome: &Result<Action>, failures: u32, backoff: &RetryConfig) -> Decision {
    match outcome {
        Ok(action) => Decision {
            requeue: action.delay(),
            failures: FailureUpdate::Reset,
        },
        Err(Error::Conflict { .. } | Error::Cancelled { .. }) => Decision::immediately(),
        Err(e) if e.is_retryable() => Decision {
            requeue: Some(backoff.delay_for_attempt(failures)),
            failures: FailureUpdate::Increment,
        },
        Err(_) => Decision::drop_key(),
    }
}

//! What a reconcile asks the scheduler to do next

use std::time::Duration;

/// Successful reconcile outcome
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    /// Nothing more to do until the next notification or resync
    Done,
    /// Run again as soon as a worker is free
    RequeueNow,
    /// Run again after the given delay
    RequeueAfter(Duration),
}

impl Action {
    /// Run again after `duration`
    pub fn requeue(duration: Duration) -> Self {
        if duration.is_zero() {
            Action::RequeueNow
        } else {
            Action::RequeueAfter(duration)
        }
    }

    /// Wait for the next change notification
    pub fn await_change() -> Self {
        Action::Done
    }

    /// Delay before the next run, if any
    pub fn delay(&self) -> Option<Duration> {
        match self {
            Action::Done => None,
            Action::RequeueNow => Some(Duration::ZERO),
            Action::RequeueAfter(d) => Some(*d),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_delay_is_immediate() {
        assert_eq!(Action::requeue(Duration::ZERO), Action::RequeueNow);
        assert_eq!(
            Action::requeue(Duration::from_secs(30)).delay(),
            Some(Duration::from_secs(30))
        );
        assert_eq!(Action::await_change().delay(), None);
    }
}

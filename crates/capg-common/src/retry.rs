//! Exponential backoff for transient failures.
//!
//! Two consumers share one [`RetryConfig`]: startup checks that loop on a
//! fallible call via [`retry_with_backoff`], and the scheduler, which only
//! needs the delay for its n-th consecutive failure ([`RetryConfig::delay_for_attempt`]).

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

/// Backoff parameters
#[derive(Clone, Debug, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = infinite)
    pub max_attempts: u32,
    /// Delay after the first failure
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Growth factor between consecutive delays
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Create a config with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// Per-key requeue backoff: 500ms doubling up to 5 minutes
    pub fn requeue() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(300),
            backoff_multiplier: 2.0,
        }
    }

    /// Delay to wait after `failures` consecutive failures (0-based), without jitter
    pub fn delay_for_attempt(&self, failures: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(failures.min(64) as i32);
        let secs = self.initial_delay.as_secs_f64() * factor;
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

/// Run `operation` until it succeeds or `max_attempts` is exhausted.
///
/// Delays grow per [`RetryConfig::delay_for_attempt`] with 0.5x to 1.5x jitter.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                attempt += 1;
                if config.max_attempts > 0 && attempt >= config.max_attempts {
                    error!(
                        operation = %operation_name,
                        attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                let jitter = rand::thread_rng().gen_range(0.5..1.5);
                let delay = Duration::from_secs_f64(
                    config.delay_for_attempt(attempt - 1).as_secs_f64() * jitter,
                );

                warn!(
                    operation = %operation_name,
                    attempt,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "Operation failed, retrying"
                );

                tokio::time::sleep(delay).await;
            }
        }
    }
}

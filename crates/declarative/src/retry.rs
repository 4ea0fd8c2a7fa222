//! Retry logic with exponential backoff for transient errors.

use crate::clock::{CancellationToken, Clock};
use crate::error::AdapterError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first
    pub max_attempts: u32,
    /// Base delay between retries
    pub base_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_factor: f64,
    /// Maximum delay between retries
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryConfig {
    /// Create a new retry config with custom settings.
    pub fn new(max_attempts: u32, base_delay: Duration, backoff_factor: f64) -> Self {
        Self {
            max_attempts,
            base_delay,
            backoff_factor,
            max_delay: Duration::from_secs(60),
        }
    }

    /// Calculate the delay for a given attempt number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self.base_delay.as_secs_f64() * self.backoff_factor.powi(attempt as i32);
        let capped = delay.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    /// Create a config that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }
}

/// Callback trait for retry progress notifications.
pub trait RetryCallback {
    /// Called when an operation is being retried.
    ///
    /// # Arguments
    /// * `attempt` - Attempt number that just failed (1-indexed)
    /// * `max_attempts` - Maximum number of attempts
    /// * `error` - The error that triggered the retry
    /// * `delay` - Time until next attempt
    fn on_retry(&self, attempt: u32, max_attempts: u32, error: &AdapterError, delay: Duration);
}

/// No-op callback that does nothing.
pub struct NoCallback;

impl RetryCallback for NoCallback {
    fn on_retry(&self, _attempt: u32, _max_attempts: u32, _error: &AdapterError, _delay: Duration) {}
}

/// Outcome of a retried operation
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T, AdapterError>,
    /// Number of times the operation ran
    pub attempts: u32,
}

/// Execute an operation with retry logic.
///
/// Retries the operation if it returns a retryable error, using exponential
/// backoff between attempts. Permanent errors and cancellation return
/// immediately. Backoff waits are cancellable.
pub fn with_retry<T, F>(
    config: &RetryConfig,
    clock: &dyn Clock,
    cancel: &CancellationToken,
    callback: Option<&dyn RetryCallback>,
    mut operation: F,
) -> RetryOutcome<T>
where
    F: FnMut() -> Result<T, AdapterError>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempts = 0;

    loop {
        if cancel.is_cancelled() {
            return RetryOutcome {
                result: Err(AdapterError::Cancelled),
                attempts,
            };
        }

        attempts += 1;
        match operation() {
            Ok(value) => {
                return RetryOutcome {
                    result: Ok(value),
                    attempts,
                };
            }
            Err(e) => {
                // If error is not retryable, or this was the last attempt, stop
                if !e.is_retryable() || attempts >= max_attempts {
                    return RetryOutcome {
                        result: Err(e),
                        attempts,
                    };
                }

                let delay = config.delay_for_attempt(attempts - 1);
                if let Some(cb) = callback {
                    cb.on_retry(attempts, max_attempts, &e, delay);
                }

                if !cancel.sleep(clock, delay) {
                    return RetryOutcome {
                        result: Err(AdapterError::Cancelled),
                        attempts,
                    };
                }
            }
        }
    }
}

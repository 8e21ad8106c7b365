//! Retry runner with exponential backoff
//!
//! Wraps recoverable operations (segment initialization, transient I/O)
//! and retries them with bounded exponential backoff. Fatal faults
//! surface immediately; after the budget is exhausted the last fault
//! surfaces.

use crate::Result;
use std::time::Duration;
use tracing::{debug, warn};

/// Retry policy configuration
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts
    pub max_retries: usize,
    /// Initial backoff duration
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Backoff multiplier for exponential growth
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Backoff duration for a 0-indexed attempt:
    /// `min(initial * multiplier^attempt, max)`
    pub fn backoff(&self, attempt: usize) -> Duration {
        let backoff_ms =
            self.initial_backoff.as_millis() as f64 * self.backoff_multiplier.powi(attempt as i32);
        Duration::from_millis(backoff_ms as u64).min(self.max_backoff)
    }
}

/// Run an operation, retrying recoverable faults with backoff.
///
/// The originator names the operation in logs.
pub fn run_with_backoff<T>(
    policy: &RetryPolicy,
    originator: &str,
    mut operation: impl FnMut() -> Result<T>,
) -> Result<T> {
    let mut attempt = 0;
    loop {
        match operation() {
            Ok(result) => {
                if attempt > 0 {
                    debug!(originator, attempt = attempt + 1, "operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if !e.is_retryable() => {
                return Err(e);
            }
            Err(e) => {
                if attempt >= policy.max_retries {
                    warn!(
                        originator,
                        attempt = attempt + 1,
                        max_retries = policy.max_retries,
                        error = %e,
                        "retries exhausted, giving up"
                    );
                    return Err(e);
                }
                let backoff = policy.backoff(attempt);
                warn!(
                    originator,
                    attempt = attempt + 1,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "recoverable fault, backing off"
                );
                std::thread::sleep(backoff);
                attempt += 1;
            }
        }
    }
}

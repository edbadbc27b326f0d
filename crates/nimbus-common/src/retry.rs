//! Bounded retry with jittered delays.
//!
//! Inline retries cover the transient failures the controller expects while
//! building a cluster: CNI manifest downloads, kubeadm joins racing the API
//! server, load balancers that have not been assigned an address yet.
//!
//! # Example
//!
//! ```ignore
//! use nimbus_common::retry::{retry_with_backoff, RetryConfig};
//!
//! let out = retry_with_backoff(
//!     &RetryConfig::fixed(3, Duration::from_secs(10)),
//!     "kubeadm join",
//!     || async { executor.run(&join_command).await },
//! ).await?;
//! ```

use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

use crate::Error;

/// Default jitter applied to every delay (±20%)
pub const DEFAULT_JITTER: f64 = 0.2;

/// Configuration for operations that may fail transiently.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one (0 = infinite)
    pub max_attempts: u32,
    /// Delay after the first failure
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Multiplier applied to the delay after each failure (1.0 = fixed spacing)
    pub backoff_multiplier: f64,
    /// Fraction of the delay randomly added or removed (0.2 = ±20%)
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0, // infinite
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: DEFAULT_JITTER,
        }
    }
}

impl RetryConfig {
    /// Create an exponential config with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// Fixed spacing between a bounded number of attempts
    pub fn fixed(attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: attempts,
            initial_delay: delay,
            max_delay: delay,
            backoff_multiplier: 1.0,
            jitter: DEFAULT_JITTER,
        }
    }

    /// Disable jitter (exact delays)
    pub fn without_jitter(mut self) -> Self {
        self.jitter = 0.0;
        self
    }
}

/// Apply symmetric jitter to a delay.
pub fn jittered(delay: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 || delay.is_zero() {
        return delay;
    }
    let factor = rand::thread_rng().gen_range((1.0 - jitter)..(1.0 + jitter));
    Duration::from_secs_f64(delay.as_secs_f64() * factor)
}

/// Execute an async operation until it succeeds, attempts run out, or it
/// fails with an error that [`Error::is_retryable`] marks as permanent.
///
/// # Returns
/// The result of the operation, or the last error.
pub async fn retry_with_backoff<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> crate::Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = crate::Result<T>>,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if !e.is_retryable() => {
                error!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    output = e.output().unwrap_or_default(),
                    "Operation failed with a permanent error"
                );
                return Err(e);
            }
            Err(e) => {
                if config.max_attempts > 0 && attempt >= config.max_attempts {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        output = e.output().unwrap_or_default(),
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                let sleep_for = jittered(delay, config.jitter);

                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    output = e.output().unwrap_or_default(),
                    delay_ms = sleep_for.as_millis(),
                    "Operation failed, retrying"
                );

                tokio::time::sleep(sleep_for).await;

                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * config.backoff_multiplier)
                        .min(config.max_delay.as_secs_f64()),
                );
            }
        }
    }
}

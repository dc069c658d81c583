//! Cancellable retry with exponential backoff.
//!
//! [`with_retry`] wraps any fallible async operation. It knows nothing about
//! connections: the session uses it for the connect sequence, but anything
//! returning [`Result`] can be retried.
//!
//! # Example
//!
//! ```
//! use bend_core::{RetryConfig, with_retry, Error};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Error> {
//! let config = RetryConfig::quick();
//! let cancel = CancellationToken::new();
//!
//! let value = with_retry(&config, &cancel, "read_sensor", || async {
//!     Ok::<_, Error>(42)
//! })
//! .await?;
//! assert_eq!(value, 42);
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Suspension primitive used between attempts.
///
/// Production code uses [`TokioSleeper`]. Tests can substitute a sleeper that
/// records the requested delays instead of waiting.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// [`Sleeper`] backed by `tokio::time::sleep`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (0 means no retries).
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Backoff multiplier (1.0 = constant delay, 2.0 = double each time).
    pub backoff_multiplier: f64,
    /// Whether to add up to 25% random jitter to delays.
    pub jitter: bool,
}

impl Default for RetryConfig {
    /// Three retries after 2 s, 4 s and 8 s.
    fn default() -> Self {
        Self::for_connect()
    }
}

impl RetryConfig {
    /// Create a new retry config with custom settings.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    /// No retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    // ==================== Presets ====================

    /// Connection sequence: open link, configure, subscribe.
    ///
    /// The sensor needs a couple of seconds to recover from a refused
    /// connection, so the base delay is long.
    pub fn for_connect() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    /// Recovery after unexpected link loss.
    pub fn for_reconnect() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }

    /// Quick, time-sensitive operations.
    pub fn quick() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(500),
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    // ==================== Builder Methods ====================

    /// Set maximum number of retries.
    #[must_use]
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Set initial delay.
    #[must_use]
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set maximum delay.
    #[must_use]
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set backoff multiplier.
    #[must_use]
    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enable or disable jitter.
    #[must_use]
    pub fn jitter(mut self, enabled: bool) -> Self {
        self.jitter = enabled;
        self
    }

    /// Check the configuration for values that would misbehave.
    pub fn validate(&self) -> Result<()> {
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(Error::invalid_config(format!(
                "backoff_multiplier must be >= 1.0, got {}",
                self.backoff_multiplier
            )));
        }
        if self.max_delay < self.initial_delay {
            return Err(Error::invalid_config(
                "max_delay must not be shorter than initial_delay",
            ));
        }
        Ok(())
    }

    /// Total attempts including the first one.
    pub fn total_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let base_delay = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let capped_delay = base_delay.min(self.max_delay.as_secs_f64());

        let final_delay = if self.jitter {
            let jitter_factor = 1.0 + (rand::rng().random::<f64>() * 0.25);
            capped_delay * jitter_factor
        } else {
            capped_delay
        };

        Duration::from_secs_f64(final_delay)
    }
}

/// Execute an async operation with retry logic, sleeping on the tokio timer.
///
/// See [`with_retry_using`].
pub async fn with_retry<F, Fut, T>(
    config: &RetryConfig,
    cancel: &CancellationToken,
    operation_name: &str,
    operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    with_retry_using(config, cancel, operation_name, &TokioSleeper, operation).await
}

/// Execute an async operation with retry logic.
///
/// Runs `operation` once, then up to `config.max_retries` more times while
/// it fails, waiting `delay_for_attempt(n)` between attempts.
///
/// Cancellation beats the retry budget:
/// - a token already cancelled before the first attempt returns
///   [`Error::Cancelled`] without running the operation;
/// - a failure observed after the token fired is returned as is;
/// - a token firing during a backoff wait abandons the retry and returns the
///   error that triggered the wait.
pub async fn with_retry_using<F, Fut, T>(
    config: &RetryConfig,
    cancel: &CancellationToken,
    operation_name: &str,
    sleeper: &dyn Sleeper,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }

    let mut attempt = 0;
    loop {
        let error = match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    debug!("{} succeeded after {} retries", operation_name, attempt);
                }
                return Ok(result);
            }
            Err(e) => e,
        };

        if cancel.is_cancelled() {
            debug!("{} cancelled after attempt {}", operation_name, attempt + 1);
            return Err(error);
        }

        if attempt >= config.max_retries {
            return Err(error);
        }

        let delay = config.delay_for_attempt(attempt);
        warn!(
            "{} failed (attempt {}/{}): {}, retrying in {:?}",
            operation_name,
            attempt + 1,
            config.total_attempts(),
            error,
            delay
        );

        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                debug!("{} backoff interrupted by cancellation", operation_name);
                return Err(error);
            }
            () = sleeper.sleep(delay) => {}
        }

        attempt += 1;
    }
}

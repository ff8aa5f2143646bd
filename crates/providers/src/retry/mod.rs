//! Retry executor for provider operations
//!
//! Wraps any async operation returning [`crate::Result`] with exponential
//! backoff. Failures are classified through [`ProviderError::kind`]; only the
//! transient kinds are retried, and rate limits back off harder than the rest.
//!
//! ```rust,no_run
//! # async fn demo() -> providers::Result<()> {
//! use providers::retry::{RetryConfig, RetryContext, RetryExecutor};
//!
//! let executor = RetryExecutor::new(RetryConfig::fast());
//! let value = executor
//!     .execute_with_retry(&RetryContext::new("ping"), || async { Ok(42) })
//!     .await?;
//! # assert_eq!(value, 42);
//! # Ok(())
//! # }
//! ```

use common::EventBus;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::error::{ErrorKind, ProviderError, Result};
use crate::events::RetryEvent;

mod metrics;

pub use metrics::{ErrorRecord, RetryMetrics};

/// Configuration for retry behavior with exponential backoff
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (excluding initial attempt)
    pub max_retries: u32,
    /// Delay before the first retry
    #[serde(rename = "initial_delay_ms", with = "crate::config::duration_ms")]
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    #[serde(rename = "max_delay_ms", with = "crate::config::duration_ms")]
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Extra factor applied to rate limit backoff
    pub rate_limit_multiplier: f64,
    /// Randomise delays by +/-10%
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            rate_limit_multiplier: 3.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Fewer, slower retries for production traffic
    pub fn conservative() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 1.5,
            ..Self::default()
        }
    }

    /// More retries for high-availability scenarios
    pub fn aggressive() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(120),
            backoff_multiplier: 2.5,
            ..Self::default()
        }
    }

    /// Short delays for latency sensitive callers
    pub fn fast() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_millis(25),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            rate_limit_multiplier: 2.0,
            jitter: false,
        }
    }

    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_rate_limit_multiplier(mut self, multiplier: f64) -> Self {
        self.rate_limit_multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }
}

/// Identifies one logical operation for logging, events and metrics.
#[derive(Debug, Clone, Default)]
pub struct RetryContext {
    pub operation: String,
    pub provider: Option<String>,
    /// Deadline applied to every individual attempt
    pub timeout: Option<Duration>,
    /// Overrides [`RetryConfig::max_retries`]
    pub max_retries: Option<u32>,
}

impl RetryContext {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            ..Default::default()
        }
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// Applies the retry policy and aggregates retry metrics.
#[derive(Debug)]
pub struct RetryExecutor {
    config: RetryConfig,
    events: EventBus<RetryEvent>,
    metrics: Mutex<RetryMetrics>,
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

impl RetryExecutor {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            events: EventBus::new("retry", 256),
            metrics: Mutex::new(RetryMetrics::default()),
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus<RetryEvent> {
        &self.events
    }

    /// Snapshot of the aggregated retry metrics.
    pub fn metrics(&self) -> RetryMetrics {
        self.metrics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn reset_metrics(&self) {
        *self.metrics.lock().unwrap_or_else(PoisonError::into_inner) = RetryMetrics::default();
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error or
    /// runs out of attempts.
    ///
    /// The operation is invoked at most `max_retries + 1` times. Each attempt
    /// races against `context.timeout`; an elapsed deadline counts as a
    /// [`ProviderError::Timeout`]. The last error is returned unchanged.
    pub async fn execute_with_retry<T, F, Fut>(
        &self,
        context: &RetryContext,
        mut operation: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_retries = context.max_retries.unwrap_or(self.config.max_retries);
        let start_time = Instant::now();
        let mut total_delay = Duration::ZERO;

        for attempt in 0..=max_retries {
            debug!(
                operation = %context.operation,
                provider = context.provider.as_deref().unwrap_or("-"),
                "Attempt {}/{}",
                attempt + 1,
                max_retries + 1
            );

            let outcome = match context.timeout {
                Some(limit) => match tokio::time::timeout(limit, operation()).await {
                    Ok(result) => result,
                    Err(_) => Err(ProviderError::timeout(limit)),
                },
                None => operation().await,
            };

            let error = match outcome {
                Ok(value) => {
                    self.record(|m| m.record_success(attempt + 1));
                    if attempt > 0 {
                        info!(
                            operation = %context.operation,
                            "Operation succeeded after {} retries (total time: {:?}, delays: {:?})",
                            attempt,
                            start_time.elapsed(),
                            total_delay
                        );
                        self.events.publish(RetryEvent::RetrySuccess {
                            operation: context.operation.clone(),
                            provider: context.provider.clone(),
                            attempts: attempt + 1,
                        });
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            let kind = error.kind();
            self.record(|m| m.record_error(context, &error));

            if !kind.is_retryable() {
                debug!(
                    operation = %context.operation,
                    "Not retrying {} error: {}",
                    kind,
                    error
                );
                self.record(|m| m.record_failure(attempt + 1));
                return Err(error);
            }

            if attempt == max_retries {
                error!(
                    operation = %context.operation,
                    "Operation failed after {} attempts over {:?}: {}",
                    attempt + 1,
                    start_time.elapsed(),
                    error
                );
                self.record(|m| m.record_failure(attempt + 1));
                self.events.publish(RetryEvent::RetryFailed {
                    operation: context.operation.clone(),
                    provider: context.provider.clone(),
                    attempts: attempt + 1,
                    error_kind: kind,
                    error: error.to_string(),
                });
                return Err(error);
            }

            let delay = backoff_delay(&self.config, attempt, &error);
            total_delay += delay;
            warn!(
                operation = %context.operation,
                delay_ms = delay.as_millis() as u64,
                "Retrying after {} error: {} (attempt {}/{})",
                kind,
                error,
                attempt + 1,
                max_retries + 1
            );

            tokio::time::sleep(delay).await;

            self.events.publish(RetryEvent::RetryAttempt {
                operation: context.operation.clone(),
                provider: context.provider.clone(),
                attempt: attempt + 2,
                max_attempts: max_retries + 1,
                delay_ms: delay.as_millis() as u64,
                error_kind: kind,
                error: error.to_string(),
            });
        }

        // The loop always returns on its final iteration.
        Err(ProviderError::Configuration(format!(
            "retry loop for '{}' ended without an outcome",
            context.operation
        )))
    }

    fn record(&self, update: impl FnOnce(&mut RetryMetrics)) {
        let mut metrics = self.metrics.lock().unwrap_or_else(PoisonError::into_inner);
        update(&mut metrics);
    }
}

/// Delay before retry number `attempt + 1`.
///
/// `initial_delay * backoff_multiplier^attempt`, multiplied again by
/// `rate_limit_multiplier` for rate limits and never shorter than a server
/// supplied `Retry-After`, then capped at `max_delay`.
pub fn backoff_delay(config: &RetryConfig, attempt: u32, error: &ProviderError) -> Duration {
    let base_delay = config.initial_delay.as_millis() as f64;
    let mut delay_ms = base_delay * config.backoff_multiplier.powi(attempt as i32);

    if error.kind() == ErrorKind::RateLimit {
        delay_ms *= config.rate_limit_multiplier;
    }
    if let Some(retry_after) = error.retry_after() {
        delay_ms = delay_ms.max(retry_after.as_millis() as f64);
    }

    let cap = config.max_delay.as_millis() as f64;
    delay_ms = delay_ms.min(cap);

    if config.jitter {
        let jitter_range = delay_ms * 0.1;
        if jitter_range > 0.0 {
            let jitter = rand::thread_rng().gen_range(-jitter_range..jitter_range);
            delay_ms = (delay_ms + jitter).clamp(0.0, cap);
        }
    }

    Duration::from_millis(delay_ms as u64)
}

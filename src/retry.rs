use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::error::{LabellerError, Result};
use crate::gateway::{ErrorClass, ModelConfig};
use crate::orchestrator::RunSignal;

const RANDOMIZATION_FACTOR: f64 = 0.1;

/// Bounded retry with exponential backoff and a per-attempt timeout
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    pub attempt_timeout: Duration,
    /// Whether an attempt cut off by `attempt_timeout` may be retried
    pub retry_timeouts: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            multiplier: config.multiplier,
            attempt_timeout: Duration::from_secs(config.attempt_timeout_secs),
            retry_timeouts: true,
        }
    }

    /// Same policy, with timeouts retried only when the model lists
    /// [`ErrorClass::Timeout`] as retryable
    pub fn for_model(&self, model: &ModelConfig) -> Self {
        Self {
            retry_timeouts: model.retryable_error_classes.contains(&ErrorClass::Timeout),
            ..self.clone()
        }
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_backoff)
            .with_multiplier(self.multiplier)
            .with_max_interval(self.max_backoff)
            .with_randomization_factor(RANDOMIZATION_FACTOR)
            .with_max_elapsed_time(None)
            .build()
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error,
    /// or `max_attempts` calls have failed. The attempt number (from 1) is
    /// passed to the operation. No new attempt starts once `signal` fires.
    pub async fn run<T, F, Fut>(
        &self,
        operation_name: &str,
        signal: &RunSignal,
        mut operation: F,
    ) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut backoff = self.backoff();
        let mut attempt = 0;

        loop {
            signal.check()?;
            attempt += 1;

            let outcome = match tokio::time::timeout(self.attempt_timeout, operation(attempt)).await
            {
                Ok(result) => result,
                Err(_) => Err(LabellerError::ModelCall {
                    message: format!(
                        "{} timed out after {:?}",
                        operation_name, self.attempt_timeout
                    ),
                    retryable: self.retry_timeouts,
                }),
            };

            match outcome {
                Ok(value) => {
                    if attempt > 1 {
                        debug!("{} succeeded on attempt {}", operation_name, attempt);
                    }
                    return Ok(value);
                }
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) if attempt >= self.max_attempts => {
                    warn!(
                        "{} failed after {} attempts: {}",
                        operation_name, attempt, e
                    );
                    return Err(LabellerError::RetryExhausted {
                        attempts: attempt,
                        last_error: e.to_string(),
                    });
                }
                Err(e) => {
                    let delay = backoff.next_backoff().unwrap_or(self.max_backoff);
                    warn!(
                        "{} failed (attempt {}/{}): {}. Retrying in {:?}...",
                        operation_name, attempt, self.max_attempts, e, delay
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = signal.cancelled() => {}
                    }
                }
            }
        }
    }
}

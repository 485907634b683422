//! Caller-side retry with bounded exponential backoff.
//!
//! The model hub only classifies failures. Callers (the documentation agent
//! and the retrieval index) wrap hub calls in [`with_retry`] to decide how
//! often a transient failure is attempted again.

use std::future::Future;
use std::time::Duration;

use repodoc_config::RetryConfig;

use super::LlmError;

/// How many times, and how patiently, a transient failure is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// A policy that retries without sleeping. Used by tests and replay.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// Delay before attempt `attempt + 1`, given the error that ended `attempt`.
    fn backoff(&self, attempt: u32, err: &LlmError) -> Duration {
        let exp = self
            .initial_backoff
            .saturating_mul(2u32.saturating_pow(attempt.min(16)));
        let wanted = match err {
            LlmError::RateLimited { retry_after_secs } => {
                exp.max(Duration::from_secs(*retry_after_secs))
            }
            _ => exp,
        };
        wanted.min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }
}

/// Execute an async operation with exponential backoff retry.
///
/// Retries only errors for which [`LlmError::is_retryable`] holds. Any other
/// error, and the last error once attempts are exhausted, is returned.
pub async fn with_retry<F, Fut, T>(policy: &RetryPolicy, label: &str, mut op: F) -> Result<T, LlmError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, LlmError>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                if !err.is_retryable() || attempt >= attempts {
                    return Err(err);
                }
                let backoff = policy.backoff(attempt - 1, &err);
                tracing::warn!(
                    call = label,
                    attempt,
                    max_attempts = attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %err,
                    "model call failed, retrying"
                );
                tokio::time::sleep(backoff).await;
            }
        }
    }
}

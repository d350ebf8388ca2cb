use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::errors::ServiceError;

/// Configuration for transport-level retries.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts including the first call.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    /// Fractional jitter applied to each delay, e.g. `0.2` for ±20 %.
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            backoff_factor: 2.0,
            jitter: 0.2,
        }
    }
}

impl RetryConfig {
    /// Undithered delay before retry number `attempt` (1-based).
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = self.backoff_factor.powi(attempt.saturating_sub(1) as i32);
        let secs = (self.initial_delay.as_secs_f64() * exp).min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(secs)
    }

    fn jittered_delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt).as_secs_f64();
        if self.jitter <= 0.0 {
            return Duration::from_secs_f64(base);
        }
        let factor = rand::thread_rng().gen_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        Duration::from_secs_f64((base * factor).max(0.0))
    }
}

/// Persisted-retry schedule for background workers: `min(base * 2^(attempts-1), cap)`.
/// `attempts` is the count after the failed attempt was recorded.
pub fn capped_backoff(base_secs: u64, cap_secs: u64, attempts: i32) -> chrono::Duration {
    let exponent = attempts.saturating_sub(1).clamp(0, 32) as u32;
    let secs = base_secs
        .saturating_mul(2u64.saturating_pow(exponent))
        .min(cap_secs);
    chrono::Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX / 1_000))
}

/// Decides whether an error is worth another attempt.
pub trait RetryPolicy<E> {
    fn is_retryable(&self, error: &E) -> bool;
}

/// Retries only infrastructure failures; client and conflict errors surface at once.
pub struct TransientErrorPolicy;

impl RetryPolicy<ServiceError> for TransientErrorPolicy {
    fn is_retryable(&self, error: &ServiceError) -> bool {
        error.is_transient()
    }
}

/// Execute an async operation with exponential backoff and jitter.
pub async fn with_retry<F, Fut, T, E>(
    config: &RetryConfig,
    policy: impl RetryPolicy<E>,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempts = 0;
    loop {
        attempts += 1;
        match operation().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(attempts, "operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(error) => {
                if attempts >= config.max_attempts || !policy.is_retryable(&error) {
                    return Err(error);
                }
                let delay = config.jittered_delay(attempts);
                warn!(attempts, delay_ms = delay.as_millis() as u64, error = %error, "retrying after transient failure");
                sleep(delay).await;
            }
        }
    }
}

/// Runs `operation` under [`TransientErrorPolicy`]; a transient error that
/// survives every attempt becomes `ServiceUnavailable`.
pub async fn retry_transient<F, Fut, T>(config: &RetryConfig, operation: F) -> Result<T, ServiceError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ServiceError>>,
{
    match with_retry(config, TransientErrorPolicy, operation).await {
        Err(err) if err.is_transient() => {
            warn!(error = %err, "transient failure persisted after retries");
            Err(ServiceError::ServiceUnavailable(
                "temporarily unable to complete the request".to_string(),
            ))
        }
        other => other,
    }
}

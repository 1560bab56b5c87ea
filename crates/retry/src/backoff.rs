//! Jittered exponential backoff.
//!
//! The delay before retry `n` (1-based) is
//! `clamp(initial * factor^(n-1), initial / 2, max)`, then perturbed by up to
//! `±jitter` of its value and clamped into the same bounds again.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use tally_core::config::RetryConfig;
use tally_core::TallyError;

/// Errors that know whether another attempt could succeed.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for TallyError {
    fn is_retryable(&self) -> bool {
        tally_core::is_retryable(self)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    pub jitter_factor: f64,
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
            initial_delay: config.initial_delay(),
            max_delay: config.max_delay(),
            backoff_factor: config.backoff_factor,
            jitter_factor: config.jitter_factor,
        }
    }

    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    fn floor(&self) -> Duration {
        self.initial_delay / 2
    }

    fn clamp(&self, delay: Duration) -> Duration {
        let floor = self.floor();
        let ceiling = self.max_delay.max(floor);
        delay.clamp(floor, ceiling)
    }

    /// Un-jittered delay to wait after failed attempt `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let scaled = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        let delay = if scaled.is_finite() && scaled < self.max_delay.as_secs_f64() {
            Duration::from_secs_f64(scaled.max(0.0))
        } else {
            self.max_delay
        };
        self.clamp(delay)
    }

    /// Perturb `delay` by a uniform random fraction in `[-jitter, +jitter]`.
    pub fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter_factor <= 0.0 {
            return self.clamp(delay);
        }
        let spread = rand::thread_rng().gen_range(-self.jitter_factor..=self.jitter_factor);
        let perturbed = delay.as_secs_f64() * (1.0 + spread);
        self.clamp(Duration::from_secs_f64(perturbed.max(0.0)))
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// attempt budget is spent. The last error is returned unchanged.
pub async fn with_retry<T, E, F, Fut>(policy: &RetryPolicy, op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + Display,
{
    with_retry_notify(policy, op, |_: &E, _, _| {}).await
}

/// Like [`with_retry`], calling `notify(error, attempt, delay)` before each sleep.
pub async fn with_retry_notify<T, E, F, Fut, N>(
    policy: &RetryPolicy,
    mut op: F,
    mut notify: N,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + Display,
    N: FnMut(&E, u32, Duration),
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match op().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(attempt, "operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) => {
                if !err.is_retryable() {
                    debug!(attempt, error = %err, "non-retryable error, giving up");
                    return Err(err);
                }
                if attempt >= max_attempts {
                    warn!(attempts = attempt, error = %err, "retry budget exhausted");
                    return Err(err);
                }

                let delay = policy.jittered(policy.delay_for(attempt));
                debug!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retryable error, backing off"
                );
                notify(&err, attempt, delay);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

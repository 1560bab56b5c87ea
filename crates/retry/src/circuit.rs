//! Circuit breaker guarding a single downstream dependency.
//!
//! State transitions:
//!
//! ```text
//! CLOSED --(failures reach threshold)--> OPEN
//! OPEN --(reset timeout since last failure)--> HALF_OPEN
//! HALF_OPEN --(probe succeeds)--> CLOSED
//! HALF_OPEN --(probe fails)--> OPEN
//! ```
//!
//! The state is shared by every concurrent caller holding the same breaker.
//! It lives behind a `std::sync::Mutex` that is only held for bookkeeping,
//! never across the wrapped call. An admitted call that never reports back
//! (its future dropped, or the call panicked) counts as a failure, so a
//! half-open probe always ends in CLOSED or OPEN.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use tally_core::config::CircuitBreakerConfig;
use tally_core::{Clock, SystemClock, TallyError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitStatus {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CircuitStatus::Closed => "CLOSED",
            CircuitStatus::Open => "OPEN",
            CircuitStatus::HalfOpen => "HALF_OPEN",
        };
        f.write_str(s)
    }
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitState {
    pub status: CircuitStatus,
    pub failure_count: u32,
    pub half_open_attempts: u32,
    pub last_failure: Option<Instant>,
}

impl CircuitState {
    fn closed() -> Self {
        Self {
            status: CircuitStatus::Closed,
            failure_count: 0,
            half_open_attempts: 0,
            last_failure: None,
        }
    }
}

/// Returned instead of invoking the wrapped call while the circuit is open.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("circuit '{name}' is open, retry after {retry_after:?}")]
pub struct CircuitOpenError {
    pub name: String,
    pub retry_after: Duration,
}

impl From<CircuitOpenError> for TallyError {
    fn from(err: CircuitOpenError) -> Self {
        TallyError::CircuitOpen { name: err.name }
    }
}

pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<CircuitState>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.snapshot())
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self::with_clock(name, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            clock,
            state: Mutex::new(CircuitState::closed()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn snapshot(&self) -> CircuitState {
        self.lock().clone()
    }

    pub fn status(&self) -> CircuitStatus {
        self.lock().status
    }

    fn lock(&self) -> MutexGuard<'_, CircuitState> {
        // A panic while holding the guard cannot leave the state half-written:
        // every update is a plain field assignment.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Decide whether a call may proceed right now.
    fn admit(&self) -> Result<(), CircuitOpenError> {
        let now = self.clock.now();
        let reset = self.config.reset_timeout();
        let mut state = self.lock();

        match state.status {
            CircuitStatus::Closed => Ok(()),
            CircuitStatus::Open => {
                let since = state
                    .last_failure
                    .map(|t| now.saturating_duration_since(t))
                    .unwrap_or(reset);
                if since >= reset {
                    info!(circuit = %self.name, "reset timeout elapsed, half-opening circuit");
                    state.status = CircuitStatus::HalfOpen;
                    state.half_open_attempts = 1;
                    Ok(())
                } else {
                    Err(self.open_error(reset - since))
                }
            }
            CircuitStatus::HalfOpen => {
                if state.half_open_attempts < self.config.half_open_max_attempts.max(1) {
                    state.half_open_attempts += 1;
                    Ok(())
                } else {
                    Err(self.open_error(Duration::ZERO))
                }
            }
        }
    }

    fn open_error(&self, retry_after: Duration) -> CircuitOpenError {
        CircuitOpenError {
            name: self.name.clone(),
            retry_after,
        }
    }

    fn on_success(&self) {
        let mut state = self.lock();
        match state.status {
            CircuitStatus::Closed => {
                state.failure_count = state.failure_count.saturating_sub(1);
            }
            CircuitStatus::HalfOpen => {
                info!(circuit = %self.name, "probe succeeded, closing circuit");
                *state = CircuitState::closed();
            }
            // A call admitted before the circuit opened finished late.
            CircuitStatus::Open => {}
        }
    }

    fn on_failure(&self) {
        let now = self.clock.now();
        let mut state = self.lock();
        state.last_failure = Some(now);

        match state.status {
            CircuitStatus::Closed => {
                state.failure_count += 1;
                if state.failure_count >= self.config.failure_threshold.max(1) {
                    warn!(
                        circuit = %self.name,
                        failures = state.failure_count,
                        "failure threshold reached, opening circuit"
                    );
                    state.status = CircuitStatus::Open;
                }
            }
            CircuitStatus::HalfOpen => {
                warn!(circuit = %self.name, "probe failed, re-opening circuit");
                state.status = CircuitStatus::Open;
                state.half_open_attempts = 0;
            }
            CircuitStatus::Open => {
                state.failure_count += 1;
            }
        }
    }

    /// Run `op` through the breaker. While open, `op` is not invoked and a
    /// [`CircuitOpenError`] converted into `E` is returned instead.
    pub async fn call<T, E, F, Fut>(&self, op: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<CircuitOpenError>,
    {
        if let Err(open) = self.admit() {
            debug!(circuit = %self.name, "call rejected, circuit open");
            return Err(open.into());
        }

        let in_flight = InFlight {
            breaker: self,
            settled: false,
        };
        let result = op().await;
        in_flight.settle(result.is_ok());
        result
    }
}

/// Held across an admitted call; reports a failure on drop unless settled.
struct InFlight<'a> {
    breaker: &'a CircuitBreaker,
    settled: bool,
}

impl InFlight<'_> {
    fn settle(mut self, ok: bool) {
        self.settled = true;
        if ok {
            self.breaker.on_success();
        } else {
            self.breaker.on_failure();
        }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.settled {
            warn!(
                circuit = %self.breaker.name,
                "call abandoned before completing, counting as failure"
            );
            self.breaker.on_failure();
        }
    }
}

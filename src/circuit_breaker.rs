//! Circuit breaker for courier-provider calls.
//!
//! A provider that keeps failing stops receiving traffic for a cooldown
//! period; callers see the open circuit as `DispatchUnavailable` and the
//! order stays in its pre-call state for retry.

use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// Cooldown before a probe request is allowed through.
    pub cooldown: Duration,
    /// Successes required in half-open before closing again.
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(60),
            success_threshold: 2,
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure: Option<Instant>,
}

#[derive(Debug, Error)]
pub enum CircuitBreakerError<E> {
    #[error("circuit open")]
    Open,
    #[error("call failed")]
    Inner(E),
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure: None,
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state.lock().unwrap().state
    }

    /// Runs `f` under circuit protection. The state lock is only held for
    /// bookkeeping, never across the awaited call.
    pub async fn call<F, Fut, R, E>(&self, f: F) -> Result<R, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<R, E>>,
    {
        if !self.try_acquire() {
            return Err(CircuitBreakerError::Open);
        }
        match f().await {
            Ok(result) => {
                self.on_success();
                Ok(result)
            }
            Err(err) => {
                self.on_failure();
                Err(CircuitBreakerError::Inner(err))
            }
        }
    }

    fn try_acquire(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        match state.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let cooled = state
                    .last_failure
                    .is_some_and(|at| at.elapsed() >= self.config.cooldown);
                if cooled {
                    state.state = CircuitState::HalfOpen;
                    state.success_count = 0;
                    true
                } else {
                    false
                }
            }
        }
    }

    fn on_success(&self) {
        let mut state = self.state.lock().unwrap();
        match state.state {
            CircuitState::HalfOpen => {
                state.success_count += 1;
                if state.success_count >= self.config.success_threshold {
                    state.state = CircuitState::Closed;
                    state.failure_count = 0;
                }
            }
            CircuitState::Closed => state.failure_count = 0,
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self) {
        let mut state = self.state.lock().unwrap();
        state.last_failure = Some(Instant::now());
        match state.state {
            CircuitState::HalfOpen => {
                state.state = CircuitState::Open;
            }
            CircuitState::Closed => {
                state.failure_count += 1;
                if state.failure_count >= self.config.failure_threshold {
                    state.state = CircuitState::Open;
                    tracing::warn!(
                        failures = state.failure_count,
                        "circuit opened after consecutive provider failures"
                    );
                }
            }
            CircuitState::Open => {}
        }
    }
}

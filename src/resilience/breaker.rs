//! Three-state circuit breaker.
//!
//! Closed counts consecutive failures and trips to Open at the threshold.
//! Open fails fast until the recovery timeout elapses, then admits a
//! single Half-Open probe. Consecutive probe successes close the circuit;
//! a probe failure re-opens it.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::errors::{Result, SqlFlowError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn name(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half-open",
        }
    }
}

#[derive(Debug, Clone)]
pub struct BreakerPolicy {
    /// Consecutive failures that trip the circuit.
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close it again.
    pub success_threshold: u32,
    pub recovery_timeout: Duration,
}

impl Default for BreakerPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    policy: BreakerPolicy,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(policy: BreakerPolicy) -> Self {
        Self {
            policy,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    /// Gate before a call. Fails fast while Open; admits one probe when
    /// the recovery window has elapsed.
    pub fn check(&self, key: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.policy.recovery_timeout {
                    inner.state = BreakerState::HalfOpen;
                    inner.consecutive_successes = 0;
                    inner.probe_in_flight = true;
                    Ok(())
                } else {
                    Err(SqlFlowError::CircuitOpen {
                        key: key.to_string(),
                    })
                }
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(SqlFlowError::CircuitOpen {
                        key: key.to_string(),
                    })
                } else {
                    inner.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    pub fn on_success(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = 0;
        match inner.state {
            BreakerState::HalfOpen => {
                inner.probe_in_flight = false;
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.policy.success_threshold {
                    inner.state = BreakerState::Closed;
                    inner.opened_at = None;
                }
            }
            _ => inner.consecutive_successes = 0,
        }
    }

    pub fn on_failure(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_successes = 0;
        match inner.state {
            BreakerState::HalfOpen => {
                inner.probe_in_flight = false;
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
            }
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.policy.failure_threshold {
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
            BreakerState::Open => {}
        }
    }
}

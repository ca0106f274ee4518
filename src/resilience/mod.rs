//! Connector resilience wrapper.
//!
//! Every external call (connection test, read, write, credential refresh)
//! goes through a composed policy: rate-limit gate, then circuit-breaker
//! gate, then a retry loop with exponential backoff wrapping the call,
//! with recovery hooks on specific failure signatures (auth failure
//! triggers one credential refresh, then one more attempt).
//!
//! Breaker and token-bucket state is process-wide, keyed by
//! `(connector_type, host)`, so concurrent pipelines share budgets. The
//! registry is initialized lazily at first use and lives for the process.

use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use dashmap::DashMap;
use tracing::{debug, warn};

use crate::config::ResilienceOverrides;
use crate::connectors::ConnectorKind;
use crate::errors::{ConnectorErrorKind, Result, SqlFlowError};

pub mod breaker;
pub mod rate_limit;

pub use breaker::{BreakerPolicy, BreakerState, CircuitBreaker};
pub use rate_limit::{Backpressure, RateGate, RateLimitPolicy};

/// Retry parameters; the delay schedule is produced by
/// `backoff::ExponentialBackoff`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    /// ±25% randomization of each delay.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    fn schedule(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.initial_delay,
            randomization_factor: if self.jitter { 0.25 } else { 0.0 },
            multiplier: self.multiplier,
            max_interval: self.max_delay,
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        }
    }
}

/// The full, resolved policy applied to one connector's calls.
#[derive(Debug, Clone)]
pub struct Policy {
    pub retry: RetryPolicy,
    pub breaker: BreakerPolicy,
    pub rate_limit: Option<RateLimitPolicy>,
    pub call_timeout: Duration,
    pub max_recovery_attempts: u32,
}

impl Policy {
    /// Smart defaults per connector kind; the least specific tier.
    pub fn for_kind(kind: ConnectorKind) -> Self {
        match kind {
            ConnectorKind::Api => Self {
                retry: RetryPolicy {
                    max_attempts: 5,
                    initial_delay: Duration::from_millis(500),
                    multiplier: 2.0,
                    max_delay: Duration::from_secs(60),
                    jitter: true,
                },
                breaker: BreakerPolicy::default(),
                rate_limit: Some(RateLimitPolicy::new(300)),
                call_timeout: Duration::from_secs(30),
                max_recovery_attempts: 1,
            },
            ConnectorKind::Database => Self {
                retry: RetryPolicy {
                    max_attempts: 3,
                    initial_delay: Duration::from_millis(250),
                    multiplier: 2.0,
                    max_delay: Duration::from_secs(10),
                    jitter: true,
                },
                breaker: BreakerPolicy::default(),
                rate_limit: None,
                call_timeout: Duration::from_secs(120),
                max_recovery_attempts: 1,
            },
            ConnectorKind::ObjectStore => Self {
                retry: RetryPolicy {
                    max_attempts: 4,
                    initial_delay: Duration::from_millis(400),
                    multiplier: 2.0,
                    max_delay: Duration::from_secs(30),
                    jitter: true,
                },
                breaker: BreakerPolicy::default(),
                rate_limit: None,
                call_timeout: Duration::from_secs(60),
                max_recovery_attempts: 1,
            },
            ConnectorKind::File => Self {
                retry: RetryPolicy {
                    max_attempts: 2,
                    initial_delay: Duration::from_millis(100),
                    multiplier: 2.0,
                    max_delay: Duration::from_secs(2),
                    jitter: false,
                },
                breaker: BreakerPolicy {
                    failure_threshold: 10,
                    ..BreakerPolicy::default()
                },
                rate_limit: None,
                call_timeout: Duration::from_secs(60),
                max_recovery_attempts: 0,
            },
        }
    }

    /// Applies the simple-knob tier, then the full tier where present.
    pub fn with_overrides(mut self, overrides: &ResilienceOverrides) -> Self {
        if let Some(attempts) = overrides.retry_attempts {
            self.retry.max_attempts = attempts;
        }
        if let Some(timeout_ms) = overrides.timeout_ms {
            self.call_timeout = Duration::from_millis(timeout_ms);
        }
        if let Some(per_minute) = overrides.rate_limit_per_minute {
            self.rate_limit = Some(RateLimitPolicy::new(per_minute));
        }

        if let Some(full) = &overrides.full {
            if let Some(v) = full.max_attempts {
                self.retry.max_attempts = v;
            }
            if let Some(v) = full.initial_delay_ms {
                self.retry.initial_delay = Duration::from_millis(v);
            }
            if let Some(v) = full.multiplier {
                self.retry.multiplier = v;
            }
            if let Some(v) = full.max_delay_ms {
                self.retry.max_delay = Duration::from_millis(v);
            }
            if let Some(v) = full.jitter {
                self.retry.jitter = v;
            }
            if let Some(v) = full.failure_threshold {
                self.breaker.failure_threshold = v;
            }
            if let Some(v) = full.success_threshold {
                self.breaker.success_threshold = v;
            }
            if let Some(v) = full.recovery_timeout_ms {
                self.breaker.recovery_timeout = Duration::from_millis(v);
            }
            if let Some(v) = full.max_recovery_attempts {
                self.max_recovery_attempts = v;
            }
            if let Some(limit) = self.rate_limit.as_mut() {
                if let Some(v) = full.burst_size {
                    limit.burst_size = v;
                }
                if let Some(v) = full.max_queue_size {
                    limit.backpressure = Backpressure::Queue { max_queue_size: v };
                }
                if let Some(bp) = &full.backpressure {
                    limit.backpressure = match bp.as_str() {
                        "drop" => Backpressure::Drop,
                        "queue" => Backpressure::Queue {
                            max_queue_size: full.max_queue_size.unwrap_or(64),
                        },
                        _ => Backpressure::Wait,
                    };
                }
            }
        }
        self
    }
}

/// Classifies an error for the retry loop. Only connector-shaped failures
/// participate; engine/SQL errors are configuration-level exclusions and
/// never count against the breaker.
fn classify(err: &SqlFlowError) -> ConnectorErrorKind {
    match err {
        SqlFlowError::Connector { kind, .. } => *kind,
        SqlFlowError::Timeout { .. } => ConnectorErrorKind::Transient,
        SqlFlowError::Io(_) => ConnectorErrorKind::Transient,
        SqlFlowError::Reqwest(e) => {
            if e.is_timeout() || e.is_connect() {
                ConnectorErrorKind::Transient
            } else if let Some(status) = e.status() {
                match status.as_u16() {
                    401 | 403 => ConnectorErrorKind::Auth,
                    429 => ConnectorErrorKind::RateLimited,
                    500..=599 => ConnectorErrorKind::Transient,
                    _ => ConnectorErrorKind::Permanent,
                }
            } else {
                ConnectorErrorKind::Transient
            }
        }
        SqlFlowError::Sqlx(e) => match e {
            sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
                ConnectorErrorKind::Transient
            }
            _ => ConnectorErrorKind::Permanent,
        },
        SqlFlowError::ObjectStore(e) => match e {
            object_store::Error::NotFound { .. } => ConnectorErrorKind::Permanent,
            _ => ConnectorErrorKind::Transient,
        },
        _ => ConnectorErrorKind::Permanent,
    }
}

/// Whether the error should count against the breaker. Permanent errors
/// (bad SQL, bad request) say nothing about the dependency's health.
fn counts_for_breaker(kind: ConnectorErrorKind) -> bool {
    !matches!(kind, ConnectorErrorKind::Permanent)
}

struct KeyedState {
    breaker: CircuitBreaker,
    gate: Option<RateGate>,
}

/// Process-wide resilience state, keyed by `(connector_type, host)`.
pub struct ResilienceRegistry {
    states: DashMap<String, Arc<KeyedState>>,
}

static GLOBAL: OnceLock<ResilienceRegistry> = OnceLock::new();

impl ResilienceRegistry {
    pub fn new() -> Self {
        Self {
            states: DashMap::new(),
        }
    }

    /// The process-global registry shared by every pipeline.
    pub fn global() -> &'static ResilienceRegistry {
        GLOBAL.get_or_init(ResilienceRegistry::new)
    }

    fn state_for(&self, key: &str, policy: &Policy) -> Result<Arc<KeyedState>> {
        if let Some(state) = self.states.get(key) {
            return Ok(state.clone());
        }
        let gate = match &policy.rate_limit {
            Some(rl) => Some(RateGate::new(rl)?),
            None => None,
        };
        let state = Arc::new(KeyedState {
            breaker: CircuitBreaker::new(policy.breaker.clone()),
            gate,
        });
        Ok(self
            .states
            .entry(key.to_string())
            .or_insert(state)
            .clone())
    }

    /// Runs `op` under the composed policy. `recover` is invoked on auth
    /// failures, at most `max_recovery_attempts` times; returning `true`
    /// means credentials were refreshed and one more attempt is warranted.
    pub async fn call<T, F, Fut, R, RFut>(
        &self,
        key: &str,
        connector: &str,
        operation: &str,
        policy: &Policy,
        mut op: F,
        mut recover: R,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
        R: FnMut() -> RFut,
        RFut: Future<Output = Result<bool>>,
    {
        let state = self.state_for(key, policy)?;
        let mut schedule = policy.retry.schedule();
        let mut attempt: u32 = 0;
        let mut recoveries: u32 = 0;

        loop {
            attempt += 1;

            if let Some(gate) = &state.gate {
                gate.acquire(key, connector).await?;
            }
            state.breaker.check(key)?;

            let started = Instant::now();
            let outcome = tokio::time::timeout(policy.call_timeout, op()).await;
            let latency_ms = started.elapsed().as_millis() as u64;

            let err = match outcome {
                Ok(Ok(value)) => {
                    state.breaker.on_success();
                    debug!(
                        connector,
                        operation,
                        attempt,
                        outcome = "ok",
                        latency_ms,
                        breaker_state = state.breaker.state().name(),
                        "call succeeded"
                    );
                    return Ok(value);
                }
                Ok(Err(e)) => e,
                Err(_) => SqlFlowError::Timeout {
                    operation: format!("{connector}.{operation}"),
                    budget_ms: policy.call_timeout.as_millis() as u64,
                },
            };

            let kind = classify(&err);
            if counts_for_breaker(kind) {
                state.breaker.on_failure();
            }

            match kind {
                ConnectorErrorKind::Permanent => {
                    warn!(
                        connector,
                        operation,
                        attempt,
                        outcome = "permanent",
                        latency_ms,
                        breaker_state = state.breaker.state().name(),
                        error = %err,
                        "call failed"
                    );
                    return Err(err);
                }
                ConnectorErrorKind::Auth => {
                    if recoveries < policy.max_recovery_attempts {
                        recoveries += 1;
                        debug!(connector, operation, "auth failure; refreshing credentials");
                        match recover().await {
                            Ok(true) => continue,
                            Ok(false) => return Err(err),
                            Err(refresh_err) => {
                                warn!(connector, error = %refresh_err, "credential refresh failed");
                                return Err(err);
                            }
                        }
                    }
                    return Err(err);
                }
                ConnectorErrorKind::Transient | ConnectorErrorKind::RateLimited => {
                    if attempt >= policy.retry.max_attempts {
                        warn!(
                            connector,
                            operation,
                            attempt,
                            outcome = "exhausted",
                            latency_ms,
                            breaker_state = state.breaker.state().name(),
                            error = %err,
                            "retries exhausted"
                        );
                        return Err(err);
                    }
                    let delay = schedule
                        .next_backoff()
                        .unwrap_or(policy.retry.max_delay);
                    debug!(
                        connector,
                        operation,
                        attempt,
                        outcome = "retry",
                        latency_ms,
                        backoff_ms = delay.as_millis() as u64,
                        breaker_state = state.breaker.state().name(),
                        error = %err,
                        "transient failure"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Convenience wrapper for calls with no recovery hook.
    pub async fn call_simple<T, F, Fut>(
        &self,
        key: &str,
        connector: &str,
        operation: &str,
        policy: &Policy,
        op: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.call(key, connector, operation, policy, op, || async { Ok(false) })
            .await
    }
}

impl Default for ResilienceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

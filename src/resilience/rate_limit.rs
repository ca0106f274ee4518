//! Token-bucket rate limiting.
//!
//! Backed by a `governor` direct limiter per registry key, so concurrent
//! pipelines hitting the same host share one budget. The backpressure
//! strategy decides what happens when the bucket is empty: wait for a
//! token, drop the call, or wait while the queue of waiters is short.

use std::num::NonZeroU32;
use std::sync::atomic::{AtomicUsize, Ordering};

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};

use crate::errors::{ConnectorErrorKind, Result, SqlFlowError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backpressure {
    /// Block until a token is available.
    Wait,
    /// Fail the call immediately when no token is available.
    Drop,
    /// Wait, but only while fewer than `max_queue_size` callers wait.
    Queue { max_queue_size: usize },
}

#[derive(Debug, Clone)]
pub struct RateLimitPolicy {
    pub per_minute: u32,
    pub burst_size: u32,
    pub backpressure: Backpressure,
}

impl RateLimitPolicy {
    pub fn new(per_minute: u32) -> Self {
        Self {
            per_minute,
            burst_size: per_minute.div_ceil(4).max(1),
            backpressure: Backpressure::Wait,
        }
    }
}

pub struct RateGate {
    limiter: DefaultDirectRateLimiter,
    backpressure: Backpressure,
    waiting: AtomicUsize,
}

impl RateGate {
    pub fn new(policy: &RateLimitPolicy) -> Result<Self> {
        let per_minute = NonZeroU32::new(policy.per_minute).ok_or_else(|| {
            SqlFlowError::Config("rate_limit_per_minute must be greater than zero".into())
        })?;
        let burst = NonZeroU32::new(policy.burst_size.max(1)).expect("clamped to >= 1");
        let quota = Quota::per_minute(per_minute).allow_burst(burst);
        Ok(Self {
            limiter: RateLimiter::direct(quota),
            backpressure: policy.backpressure.clone(),
            waiting: AtomicUsize::new(0),
        })
    }

    /// Acquires one token according to the backpressure strategy.
    pub async fn acquire(&self, key: &str, connector: &str) -> Result<()> {
        match &self.backpressure {
            Backpressure::Wait => {
                self.limiter.until_ready().await;
                Ok(())
            }
            Backpressure::Drop => self.limiter.check().map_err(|_| SqlFlowError::Connector {
                connector: connector.to_string(),
                kind: ConnectorErrorKind::RateLimited,
                message: format!("call dropped by local rate limit for '{key}'"),
            }),
            Backpressure::Queue { max_queue_size } => {
                if self.limiter.check().is_ok() {
                    return Ok(());
                }
                if self.waiting.fetch_add(1, Ordering::SeqCst) >= *max_queue_size {
                    self.waiting.fetch_sub(1, Ordering::SeqCst);
                    return Err(SqlFlowError::RateLimitQueueFull {
                        key: key.to_string(),
                    });
                }
                self.limiter.until_ready().await;
                self.waiting.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_burst_admits_then_drops() {
        let gate = RateGate::new(&RateLimitPolicy {
            per_minute: 60,
            burst_size: 2,
            backpressure: Backpressure::Drop,
        })
        .unwrap();

        assert!(gate.acquire("k", "c").await.is_ok());
        assert!(gate.acquire("k", "c").await.is_ok());
        let err = gate.acquire("k", "c").await.unwrap_err();
        assert!(matches!(
            err,
            SqlFlowError::Connector {
                kind: ConnectorErrorKind::RateLimited,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_queue_overflow() {
        let gate = RateGate::new(&RateLimitPolicy {
            per_minute: 60,
            burst_size: 1,
            backpressure: Backpressure::Queue { max_queue_size: 0 },
        })
        .unwrap();

        // The burst token admits the first caller; the next may not queue.
        assert!(gate.acquire("k", "c").await.is_ok());
        let err = gate.acquire("k", "c").await.unwrap_err();
        assert!(matches!(err, SqlFlowError::RateLimitQueueFull { .. }));
    }
}

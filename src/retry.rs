//! Bounded retry and polling primitives.
//!
//! Both take an injected [`Clock`] so deadlines and backoff are deterministic
//! under tokio's paused test time.

use crate::{EngineError, Result};
use async_trait::async_trait;
use log::debug;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;

    async fn sleep(&self, duration: Duration);
}

/// Clock backed by the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`, doubling from the base and capped.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or attempts run out.
///
/// The last error is returned as-is when attempts are exhausted.
pub async fn with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    clock: &dyn Clock,
    what: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                let delay = policy.delay_after(attempt);
                debug!(
                    "{} failed (attempt {}/{}), retrying in {:?}: {}",
                    what, attempt, policy.max_attempts, delay, e
                );
                clock.sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Poll `probe` until it yields a value or `deadline` elapses.
///
/// `Ok(None)` and retryable errors mean "not yet"; a non-retryable error stops
/// polling immediately. Dropping the returned future cancels the wait.
pub async fn wait_for<T, F, Fut>(
    clock: &dyn Clock,
    deadline: Duration,
    interval: Duration,
    what: &str,
    mut probe: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let started = clock.now();
    loop {
        match probe().await {
            Ok(Some(value)) => return Ok(value),
            Ok(None) => {}
            Err(e) if e.is_retryable() => debug!("{} not ready: {}", what, e),
            Err(e) => return Err(e),
        }

        let elapsed = clock.now().saturating_duration_since(started);
        if elapsed >= deadline {
            return Err(EngineError::ConditionTimedOut(format!(
                "{} after {:?}",
                what, deadline
            )));
        }
        clock.sleep(interval.min(deadline - elapsed)).await;
    }
}

//! Retry and timeout for unary calls.
//!
//! Only unary calls go through [Resilient]. A streaming call that failed half
//! way can not be repeated without duplicating or losing items, so streaming
//! calls surface their first error to the caller.
use std::time::Duration;

use futures_lite::Future;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::CallError;

/// Bounded retries with linear backoff, and a timeout per attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay_ms: u64,
    attempt_timeout_ms: u64,
}

impl RetryPolicy {
    /// Create a policy. `max_attempts` counts the first attempt, and is at least 1.
    pub fn new(max_attempts: u32, base_delay_ms: u64, attempt_timeout_ms: u64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay_ms,
            attempt_timeout_ms,
        }
    }

    /// Attempts in total, including the first one
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay after the first failed attempt
    pub fn base_delay_ms(&self) -> u64 {
        self.base_delay_ms
    }

    /// Time one attempt may take
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    /// Delay after failed attempt number `attempt`, counting from 1.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.base_delay_ms.saturating_mul(attempt as u64))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, 200, 2_000)
    }
}

/// Retry decorator for unary calls.
///
/// `P` decides which errors are worth another attempt. By default that is
/// [CallError::is_transient].
#[derive(Debug, Clone)]
pub struct Resilient<P = fn(&CallError) -> bool> {
    policy: RetryPolicy,
    retry_if: P,
}

impl Resilient {
    /// Retry transient errors according to `policy`.
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            retry_if: CallError::is_transient,
        }
    }
}

impl Default for Resilient {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl<P> Resilient<P>
where
    P: Fn(&CallError) -> bool,
{
    /// Replace the retry predicate.
    pub fn with_classifier<Q>(self, retry_if: Q) -> Resilient<Q>
    where
        Q: Fn(&CallError) -> bool,
    {
        Resilient {
            policy: self.policy,
            retry_if,
        }
    }

    /// The policy of this decorator
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `f` until it succeeds, fails with an error that is not retried, or
    /// runs out of attempts.
    ///
    /// Every attempt is a fresh call of `f` under the attempt timeout. An
    /// attempt that times out fails with [CallError::DeadlineExceeded].
    pub async fn call<F, Fut, T, E>(&self, mut f: F) -> Result<T, CallError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        CallError: From<E>,
    {
        let max_attempts = self.policy.max_attempts();
        let mut attempt = 1;
        loop {
            let res = match tokio::time::timeout(self.policy.attempt_timeout(), f()).await {
                Ok(res) => res.map_err(CallError::from),
                Err(_elapsed) => Err(CallError::DeadlineExceeded),
            };
            let cause = match res {
                Ok(value) => return Ok(value),
                Err(cause) => cause,
            };
            if attempt >= max_attempts || !(self.retry_if)(&cause) {
                debug!(attempt, "giving up: {cause}");
                return Err(cause);
            }
            let delay = self.policy.delay_for_attempt(attempt);
            warn!(attempt, ?delay, "attempt failed, retrying: {cause}");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    };

    use tokio::time::Instant;

    use super::*;

    fn reset() -> CallError {
        CallError::transient(anyhow::anyhow!("connection reset"))
    }

    #[test]
    fn backoff_grows_linearly() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts(), 3);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(policy.attempt_timeout(), Duration::from_secs(2));
    }

    #[test]
    fn at_least_one_attempt() {
        assert_eq!(RetryPolicy::new(0, 10, 10).max_attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let start = Instant::now();
        let res = Resilient::default()
            .call(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n < 3 {
                        Err(reset())
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;
        assert_eq!(res.ok(), Some(3));
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(600), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(700), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let res: Result<(), _> = Resilient::default()
            .call(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(reset()) }
            })
            .await;
        assert!(matches!(res, Err(CallError::Transient(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_errors_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let res: Result<(), _> = Resilient::default()
            .call(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(CallError::fatal(anyhow::anyhow!("malformed request"))) }
            })
            .await;
        assert!(matches!(res, Err(CallError::Fatal(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_attempts_time_out_and_are_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let start = Instant::now();
        let res = Resilient::default()
            .call(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n == 1 {
                        tokio::time::sleep(Duration::from_secs(10)).await;
                    }
                    Ok::<_, CallError>(n)
                }
            })
            .await;
        assert_eq!(res.ok(), Some(2));
        assert!(start.elapsed() >= Duration::from_millis(2_200));
    }

    #[tokio::test(start_paused = true)]
    async fn custom_classifier() {
        let calls = Arc::new(AtomicU32::new(0));
        let res: Result<(), _> = Resilient::default()
            .with_classifier(|_: &CallError| false)
            .call(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(reset()) }
            })
            .await;
        assert!(res.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}

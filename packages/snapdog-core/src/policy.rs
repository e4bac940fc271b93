//! A tiny resilience policy combinator: `retry(max, delay_fn) + timeout(d) + on_attempt(fn)`.
//!
//! Generalises the fixed-delay-array retry helper used for Sonos SOAP calls in the
//! teacher codebase into the exponential-backoff-with-jitter shape this core needs,
//! shared by C2 (Snapcast reconnect/health-check), C4 (MQTT reconnect), C11 (startup
//! probes) and C12 (KNX reconnect) with different parameters rather than four
//! independent copies.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

/// Backoff shape for successive retry attempts.
#[derive(Debug, Clone, Copy)]
pub enum Backoff {
    Exponential,
    Linear,
    Constant,
}

/// Retry policy: how many attempts, what delay curve, whether to jitter, and an
/// optional overall per-attempt timeout.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff: Backoff,
    pub use_jitter: bool,
    pub attempt_timeout: Option<Duration>,
}

impl RetryPolicy {
    /// Snapcast/MQTT/KNX reconnect shape: unbounded-ish, capped delay, jittered.
    pub fn reconnect(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            backoff: Backoff::Exponential,
            use_jitter: true,
            attempt_timeout: None,
        }
    }

    /// C11's `ExecuteWithRetry` shape: base 1s, cap 30s, max 5 attempts.
    pub fn startup_step() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff: Backoff::Exponential,
            use_jitter: true,
            attempt_timeout: None,
        }
    }

    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let raw_ms = match self.backoff {
            Backoff::Constant => self.base_delay.as_millis() as u64,
            Backoff::Linear => self.base_delay.as_millis() as u64 * u64::from(attempt),
            Backoff::Exponential => {
                self.base_delay.as_millis() as u64 * 2u64.saturating_pow(attempt.saturating_sub(1))
            }
        };
        let capped_ms = raw_ms.min(self.max_delay.as_millis() as u64);
        let final_ms = if self.use_jitter && capped_ms > 0 {
            rand::thread_rng().gen_range(0..=capped_ms)
        } else {
            capped_ms
        };
        Duration::from_millis(final_ms)
    }
}

/// Runs `operation` under `policy`, retrying while `is_retryable` returns true.
/// `on_attempt(attempt, max_attempts, &err)` is called before each sleep, matching
/// the "policy logs attempt N/M with the last error" requirement of C2 §4.2.
pub async fn retry<F, Fut, T, E>(
    policy: RetryPolicy,
    name: &str,
    is_retryable: impl Fn(&E) -> bool,
    on_attempt: impl Fn(u32, u32, &E),
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut last_error = None;
    for attempt in 1..=policy.max_attempts {
        match run_with_optional_timeout(policy.attempt_timeout, operation()).await {
            Ok(result) => return Ok(result),
            Err(TimedOutOr::Inner(err)) if is_retryable(&err) => {
                on_attempt(attempt, policy.max_attempts, &err);
                last_error = Some(err);
            }
            Err(TimedOutOr::Inner(err)) => return Err(err),
            Err(TimedOutOr::TimedOut) => {
                tracing::warn!(operation = name, attempt, "attempt timed out");
                continue;
            }
        }
        if attempt < policy.max_attempts {
            tokio::time::sleep(policy.delay_for_attempt(attempt)).await;
        }
    }
    Err(last_error.expect("retry loop always records the last error before exhausting attempts"))
}

enum TimedOutOr<E> {
    Inner(E),
    TimedOut,
}

async fn run_with_optional_timeout<Fut, T, E>(
    timeout: Option<Duration>,
    fut: Fut,
) -> Result<T, TimedOutOr<E>>
where
    Fut: Future<Output = Result<T, E>>,
{
    match timeout {
        Some(d) => match tokio::time::timeout(d, fut).await {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(e)) => Err(TimedOutOr::Inner(e)),
            Err(_) => Err(TimedOutOr::TimedOut),
        },
        None => fut.await.map_err(TimedOutOr::Inner),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retries_until_success() {
        let attempts = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff: Backoff::Constant,
            use_jitter: false,
            attempt_timeout: None,
        };
        let result: Result<u32, &str> = retry(
            policy,
            "test",
            |_e: &&str| true,
            |_, _, _| {},
            || {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err("not yet")
                    } else {
                        Ok(42)
                    }
                }
            },
        )
        .await;
        assert_eq!(result, Ok(42));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_error_returns_immediately() {
        let attempts = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff: Backoff::Constant,
            use_jitter: false,
            attempt_timeout: None,
        };
        let result: Result<u32, &str> = retry(
            policy,
            "test",
            |_e: &&str| false,
            |_, _, _| {},
            || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async move { Err("fatal") }
            },
        )
        .await;
        assert_eq!(result, Err("fatal"));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn exponential_delay_is_capped_by_max_delay() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff: Backoff::Exponential,
            use_jitter: false,
            attempt_timeout: None,
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(30));
    }
}

//! Retry orchestration
//!
//! Bounded sequential attempts with linear backoff. Every attempt is
//! independent: the closure re-opens its connection and re-runs the
//! handshake from scratch, because a failed handshake may have left the
//! prior stream unusable. The final attempt's error is returned
//! unchanged so the root cause is never wrapped out of sight.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Attempt count and backoff base for a publish run
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff_base: Duration) -> Self {
        Self {
            max_attempts,
            backoff_base,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_secs(2),
        }
    }
}

/// Run `attempt` up to `policy.max_attempts` times.
///
/// The closure receives the 1-based attempt index. After failed
/// attempt `k < max`, waits `backoff_base * k` before the next. Calls
/// are strictly sequential.
pub async fn run_with_retry<T, E, F, Fut>(policy: RetryPolicy, mut attempt: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    debug_assert!(policy.max_attempts >= 1);
    let mut k = 1;
    loop {
        debug!(attempt = k, max = policy.max_attempts, "starting attempt");
        match attempt(k).await {
            Ok(value) => {
                info!(attempt = k, "attempt succeeded");
                return Ok(value);
            }
            Err(e) if k < policy.max_attempts => {
                let backoff = policy.backoff_base * k;
                warn!(attempt = k, error = %e, backoff = ?backoff, "attempt failed, backing off");
                sleep(backoff).await;
                k += 1;
            }
            Err(e) => {
                warn!(attempt = k, error = %e, "final attempt failed");
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_millis(10))
    }

    #[tokio::test]
    async fn always_failing_runs_exactly_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = run_with_retry(fast_policy(3), |k| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Err(format!("boom on attempt {}", k)) }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // The last attempt's error comes back unmodified.
        assert_eq!(result.unwrap_err(), "boom on attempt 3");
    }

    #[tokio::test]
    async fn fails_once_then_succeeds_calls_twice() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = run_with_retry(fast_policy(3), |k| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if k == 1 {
                    Err("transient".to_string())
                } else {
                    Ok(k)
                }
            }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(result.unwrap(), 2);
    }

    #[tokio::test]
    async fn single_attempt_policy_never_backs_off() {
        let started = std::time::Instant::now();
        let result: Result<(), String> =
            run_with_retry(RetryPolicy::new(1, Duration::from_secs(60)), |_| async {
                Err("boom".to_string())
            })
            .await;

        assert!(result.is_err());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn backoff_is_linear_in_the_attempt_index() {
        let policy = RetryPolicy::new(3, Duration::from_millis(50));
        let started = std::time::Instant::now();
        let _: Result<(), &str> = run_with_retry(policy, |_| async { Err("boom") }).await;

        // 50ms after attempt 1 + 100ms after attempt 2.
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(150), "elapsed {:?}", elapsed);
    }

    #[tokio::test]
    async fn immediate_success_is_one_call() {
        let calls = AtomicU32::new(0);
        let result: Result<&str, &str> = run_with_retry(fast_policy(3), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok("done") }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(result.unwrap(), "done");
    }
}

//! Retry utilities with exponential backoff and jitter.
//!
//! Two entry points share one backoff policy:
//!
//! - [`retry_with_backoff`] retries any failure and is used for transient
//!   external calls.
//! - [`retry_on_conflict`] retries only lost optimistic-concurrency races and
//!   wraps a whole read-modify-write cycle. The closure must re-read the
//!   document on every call so a retry never writes a stale etag.
//!
//! ```ignore
//! use mantle_common::retry::{retry_on_conflict, RetryConfig};
//!
//! let doc = retry_on_conflict(&RetryConfig::conflict(), "put_cluster", &cancel, || async {
//!     let mut doc = store.get(&key).await?;
//!     doc.cluster.properties.provisioning_state = ProvisioningState::Updating;
//!     store.update(doc).await
//! })
//! .await?;
//! ```

use std::future::Future;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::Error;

/// Configuration for operations that may fail transiently.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (0 = infinite)
    pub max_attempts: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Upper bound on total time spent retrying (None = unbounded)
    pub max_elapsed: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0, // infinite
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            max_elapsed: None,
        }
    }
}

impl RetryConfig {
    /// Create a config with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// Policy for read-modify-write loops on a single document
    ///
    /// 50ms doubling to 2s, giving up after 30s in total.
    pub fn conflict() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
            backoff_multiplier: 2.0,
            max_elapsed: Some(Duration::from_secs(30)),
        }
    }

    fn jittered(&self, delay: Duration) -> Duration {
        // 0.5x to 1.5x of the delay
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        Duration::from_secs_f64(delay.as_secs_f64() * jitter)
    }

    fn next_delay(&self, delay: Duration) -> Duration {
        Duration::from_secs_f64(
            (delay.as_secs_f64() * self.backoff_multiplier).min(self.max_delay.as_secs_f64()),
        )
    }

    fn exhausted(&self, attempt: u32, started: Instant, next_sleep: Duration) -> bool {
        if self.max_attempts > 0 && attempt >= self.max_attempts {
            return true;
        }
        match self.max_elapsed {
            Some(budget) => started.elapsed() + next_sleep > budget,
            None => false,
        }
    }
}

/// Execute an async operation with exponential backoff and jitter.
///
/// Retries every error until success, `max_attempts`, or `max_elapsed`.
/// Returns the last error when the budget is exhausted.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let started = Instant::now();
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                let jittered_delay = config.jittered(delay);
                if config.exhausted(attempt, started, jittered_delay) {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = jittered_delay.as_millis(),
                    "Operation failed, retrying"
                );

                tokio::time::sleep(jittered_delay).await;
                delay = config.next_delay(delay);
            }
        }
    }
}

/// Re-run a read-modify-write closure until it stops losing etag races.
///
/// Only [`Error::is_precondition_failed`] triggers a retry; every other error
/// is returned immediately. Cancelling `cancel` aborts the loop between
/// attempts (and during a backoff sleep) with [`Error::Cancelled`], so no
/// write happens after cancellation is observed.
pub async fn retry_on_conflict<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let started = Instant::now();
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        if cancel.is_cancelled() {
            return Err(Error::cancelled(operation_name));
        }
        attempt += 1;

        let e = match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if e.is_precondition_failed() => e,
            Err(e) => return Err(e),
        };

        let jittered_delay = config.jittered(delay);
        if config.exhausted(attempt, started, jittered_delay) {
            error!(
                operation = %operation_name,
                attempt = attempt,
                error = %e,
                "Concurrency retry budget exhausted"
            );
            return Err(e);
        }

        warn!(
            operation = %operation_name,
            attempt = attempt,
            error = %e,
            delay_ms = jittered_delay.as_millis(),
            "Lost etag race, re-reading"
        );

        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::cancelled(operation_name)),
            _ = tokio::time::sleep(jittered_delay) => {}
        }
        delay = config.next_delay(delay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast() -> RetryConfig {
        RetryConfig {
            max_attempts: 5,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            backoff_multiplier: 2.0,
            max_elapsed: None,
        }
    }

    #[tokio::test]
    async fn test_succeeds_immediately() {
        let config = RetryConfig::with_max_attempts(3);
        let result: Result<i32, &str> =
            retry_with_backoff(&config, "op", || async { Ok(42) }).await;
        assert_eq!(result, Ok(42));
    }

    #[tokio::test]
    async fn test_succeeds_after_failures() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<i32, &str> = retry_with_backoff(&fast(), "op", || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("fail")
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(42));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausts_max_attempts() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let config = RetryConfig {
            max_attempts: 3,
            ..fast()
        };

        let result: Result<i32, &str> = retry_with_backoff(&config, "op", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err("always fails")
            }
        })
        .await;

        assert_eq!(result, Err("always fails"));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn conflict_retry_reruns_until_race_is_won() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let cancel = CancellationToken::new();

        let result = retry_on_conflict(&fast(), "put", &cancel, || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::precondition_failed("stale etag"))
                } else {
                    Ok("written")
                }
            }
        })
        .await;

        assert_eq!(result.expect("third attempt should win"), "written");
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn conflict_retry_does_not_retry_other_errors() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let cancel = CancellationToken::new();

        let result: Result<(), Error> = retry_on_conflict(&fast(), "put", &cancel, || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(Error::validation("bad cidr"))
            }
        })
        .await;

        assert!(matches!(result, Err(Error::Validation { .. })));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn conflict_retry_gives_up_after_elapsed_budget() {
        let config = RetryConfig {
            max_attempts: 0,
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 1.0,
            max_elapsed: Some(Duration::from_millis(30)),
        };
        let cancel = CancellationToken::new();

        let result: Result<(), Error> = retry_on_conflict(&config, "put", &cancel, || async {
            Err(Error::precondition_failed("always stale"))
        })
        .await;

        let err = result.expect_err("budget should run out");
        assert!(err.is_precondition_failed());
    }

    #[tokio::test]
    async fn cancellation_stops_retry_loop_without_another_attempt() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();

        let result: Result<(), Error> = retry_on_conflict(&fast(), "put", &cancel, || {
            let c = c.clone();
            let trigger = trigger.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                trigger.cancel();
                Err(Error::precondition_failed("stale"))
            }
        })
        .await;

        assert!(matches!(result, Err(Error::Cancelled { .. })));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}

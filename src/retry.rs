//! Retry utilities with exponential backoff.
//!
//! Two flavours are provided:
//!
//! - [`retry_with_backoff`] / [`retry_with_backoff_if`] retry any async operation,
//!   optionally filtering which errors are worth another attempt.
//! - [`retry_on_conflict`] is the optimistic-concurrency primitive used for every
//!   read-modify-write against the cluster: only HTTP 409 is retried, anything
//!   else fails immediately, and exhausting the attempts yields [`Error::Conflict`].
//!
//! # Example
//!
//! ```ignore
//! use meshtap::retry::{retry_on_conflict, RetryConfig};
//!
//! let deployment = retry_on_conflict(&RetryConfig::conflict(), "deployment/shop/orders", || async {
//!     let mut d = client.get_deployment("shop", "orders").await?.ok_or(...)?;
//!     edit(&mut d);
//!     client.replace_deployment("shop", &d).await
//! })
//! .await?;
//! ```

use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

use crate::Error;

/// Configuration for operations that may fail transiently.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = infinite)
    pub max_attempts: u32,
    /// Initial delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff (1.0 keeps the delay fixed)
    pub backoff_multiplier: f64,
    /// Randomize each delay between 0.5x and 1.5x
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0, // infinite
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
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

    /// Conflict-retry policy: 3 attempts, 1s initial backoff doubled each time, no jitter
    pub fn conflict() -> Self {
        Self::conflict_with(3, Duration::from_secs(1))
    }

    /// Conflict-retry policy with explicit attempt ceiling and base backoff
    pub fn conflict_with(max_attempts: u32, initial_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    fn next_delay(&self, delay: Duration) -> Duration {
        Duration::from_secs_f64(
            (delay.as_secs_f64() * self.backoff_multiplier).min(self.max_delay.as_secs_f64()),
        )
    }

    fn sleep_for(&self, delay: Duration) -> Duration {
        if self.jitter {
            let jitter = rand::thread_rng().gen_range(0.5..1.5);
            Duration::from_secs_f64(delay.as_secs_f64() * jitter)
        } else {
            delay
        }
    }
}

/// Execute an async operation with exponential backoff, retrying every error.
///
/// # Returns
/// The result of the operation, or the last error if max_attempts is exhausted.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_with_backoff_if(config, operation_name, |_| true, operation).await
}

/// Execute an async operation with exponential backoff, retrying only errors
/// accepted by `should_retry`. Other errors are returned immediately.
pub async fn retry_with_backoff_if<F, Fut, T, E, P>(
    config: &RetryConfig,
    operation_name: &str,
    should_retry: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if !should_retry(&e) {
                    return Err(e);
                }

                if config.max_attempts > 0 && attempt >= config.max_attempts {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                let sleep = config.sleep_for(delay);
                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = sleep.as_millis(),
                    "Operation failed, retrying"
                );

                tokio::time::sleep(sleep).await;
                delay = config.next_delay(delay);
            }
        }
    }
}

/// Run a read-modify-write against a cluster object, retrying on version conflicts.
///
/// `operation` must re-fetch the object on every call so each attempt edits the
/// latest version. Non-conflict errors propagate immediately; when all attempts
/// conflict the result is [`Error::Conflict`] naming `resource`.
pub async fn retry_on_conflict<F, Fut, T>(
    config: &RetryConfig,
    resource: &str,
    operation: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, Error>>,
{
    match retry_with_backoff_if(config, resource, Error::is_conflict, operation).await {
        Err(e) if e.is_conflict() => Err(Error::Conflict {
            resource: resource.to_string(),
            attempts: config.max_attempts,
        }),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::api_error;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            backoff_multiplier: 2.0,
            jitter: true,
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

        let result: Result<i32, &str> = retry_with_backoff(&fast(5), "op", || {
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

        let result: Result<i32, &str> = retry_with_backoff(&fast(3), "op", || {
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
    async fn test_filtered_errors_are_not_retried() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<i32, &str> =
            retry_with_backoff_if(&fast(5), "op", |e: &&str| *e == "transient", || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err("fatal")
                }
            })
            .await;

        assert_eq!(result, Err("fatal"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    // ==========================================================================
    // Story Tests: Optimistic Concurrency
    // ==========================================================================

    /// Story: A platform controller bumps the Deployment between our read and
    /// write twice; the third attempt lands.
    #[tokio::test]
    async fn story_conflict_retry_recovers_from_concurrent_edits() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let config = RetryConfig::conflict_with(3, Duration::from_millis(1));

        let result = retry_on_conflict(&config, "deployment/shop/orders", || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(api_error(409, "Conflict"))
                } else {
                    Ok("replaced")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "replaced");
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    /// Story: Persistent conflicts escalate to a typed conflict error
    #[tokio::test]
    async fn story_conflict_retry_gives_up_at_ceiling() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let config = RetryConfig::conflict_with(3, Duration::from_millis(1));

        let result: Result<(), Error> = retry_on_conflict(&config, "service/shop/orders", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(api_error(409, "Conflict"))
            }
        })
        .await;

        match result {
            Err(Error::Conflict { resource, attempts }) => {
                assert_eq!(resource, "service/shop/orders");
                assert_eq!(attempts, 3);
            }
            other => panic!("expected conflict error, got {:?}", other),
        }
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    /// Story: A forbidden write is fatal on the first attempt
    #[tokio::test]
    async fn story_non_conflict_errors_fail_fast() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let config = RetryConfig::conflict_with(3, Duration::from_millis(1));

        let result: Result<(), Error> = retry_on_conflict(&config, "configmap/shop/x", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(api_error(403, "Forbidden"))
            }
        })
        .await;

        assert!(matches!(result, Err(Error::Kube { .. })));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn conflict_policy_doubles_without_jitter() {
        let config = RetryConfig::conflict();
        assert_eq!(config.max_attempts, 3);
        assert!(!config.jitter);
        assert_eq!(config.sleep_for(Duration::from_secs(1)), Duration::from_secs(1));
        assert_eq!(
            config.next_delay(Duration::from_secs(1)),
            Duration::from_secs(2)
        );
    }
}

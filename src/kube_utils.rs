//! Kubernetes client construction and bounded polling helpers

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tracing::trace;

use crate::Error;

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients
///
/// Exec sessions that `cat` a large capture file ride on this timeout.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Poll `check_fn` until it returns `Ok(true)` or `timeout` elapses.
///
/// Errors from the check are treated like "not yet" and logged at trace level,
/// so a flapping API server does not abort the wait. A not-found error ends the
/// wait immediately: the object is gone and will not become ready. The loop has
/// a single exit predicate and an explicit deadline.
pub async fn poll_until<F, Fut>(
    timeout: Duration,
    poll_interval: Duration,
    timeout_msg: impl Into<String>,
    mut check_fn: F,
) -> Result<(), Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, Error>>,
{
    let start = tokio::time::Instant::now();
    let timeout_msg = timeout_msg.into();

    loop {
        match check_fn().await {
            Ok(true) => return Ok(()),
            Ok(false) => {
                trace!("Polling condition not yet met, retrying...");
            }
            Err(e) if e.is_not_found() => return Err(e),
            Err(e) => {
                trace!(error = %e, "Polling check returned error (retrying)");
            }
        }

        if start.elapsed() >= timeout {
            return Err(Error::timeout("poll_until", timeout_msg));
        }

        tokio::time::sleep(poll_interval).await;
    }
}

/// Create a kube client from optional kubeconfig path with default timeouts
pub async fn create_client(kubeconfig: Option<&Path>) -> Result<Client, Error> {
    create_client_with_timeout(kubeconfig, DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT).await
}

/// Create a kube client from optional kubeconfig path with custom timeouts
///
/// Without a kubeconfig the configuration is inferred (in-cluster service
/// account, then `KUBECONFIG` / `~/.kube/config`).
pub async fn create_client_with_timeout(
    kubeconfig: Option<&Path>,
    connect_timeout: Duration,
    read_timeout: Duration,
) -> Result<Client, Error> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::internal_with_context(
                    "create_client",
                    format!("failed to read kubeconfig {}: {}", path.display(), e),
                )
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| {
                    Error::internal_with_context(
                        "create_client",
                        format!("failed to load kubeconfig: {}", e),
                    )
                })?
        }
        None => Config::infer().await.map_err(|e| {
            Error::internal_with_context("create_client", format!("failed to infer config: {}", e))
        })?,
    };

    config.connect_timeout = Some(connect_timeout);
    config.read_timeout = Some(read_timeout);
    Client::try_from(config).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to create client: {}", e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn poll_until_returns_once_condition_holds() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let result = poll_until(
            Duration::from_secs(1),
            Duration::from_millis(1),
            "never ready",
            || {
                let c = c.clone();
                async move { Ok(c.fetch_add(1, Ordering::SeqCst) >= 2) }
            },
        )
        .await;

        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn poll_until_keeps_polling_through_errors() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let result = poll_until(
            Duration::from_secs(1),
            Duration::from_millis(1),
            "never ready",
            || {
                let c = c.clone();
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(Error::internal("api server hiccup"))
                    } else {
                        Ok(true)
                    }
                }
            },
        )
        .await;

        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn poll_until_stops_on_not_found() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let result = poll_until(
            Duration::from_secs(5),
            Duration::from_millis(1),
            "never ready",
            || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err::<bool, _>(Error::not_found("deployment", "shop/orders"))
                }
            },
        )
        .await;

        assert!(result.unwrap_err().is_not_found());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_until_times_out_with_message() {
        let result = poll_until(
            Duration::from_secs(5),
            Duration::from_secs(1),
            "deployment shop/orders never became ready",
            || async { Ok(false) },
        )
        .await;

        match result {
            Err(Error::Timeout { message, .. }) => {
                assert!(message.contains("shop/orders"));
            }
            other => panic!("expected timeout, got {:?}", other),
        }
    }
}

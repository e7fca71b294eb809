//! Delayed auto-stop scheduling
//!
//! Each session with a duration gets one cancellable timer. Scheduling again
//! for the same session replaces the previous timer; a timer that fired or
//! was cancelled is forgotten.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

struct ScheduledStop {
    cancel_token: CancellationToken,
    generation: u64,
}

/// Registry of pending auto-stop timers keyed by session id
#[derive(Clone, Default)]
pub struct AutoStopScheduler {
    pending: Arc<DashMap<String, ScheduledStop>>,
    generation: Arc<AtomicU64>,
}

impl AutoStopScheduler {
    /// Create an empty scheduler
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `on_expiry(session_id)` after `delay` unless cancelled first
    ///
    /// A zero delay schedules nothing and returns false.
    pub fn schedule<F, Fut>(&self, session_id: &str, delay: Duration, on_expiry: F) -> bool
    where
        F: FnOnce(String) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if delay.is_zero() {
            return false;
        }

        let cancel_token = CancellationToken::new();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        if let Some(previous) = self.pending.insert(
            session_id.to_string(),
            ScheduledStop {
                cancel_token: cancel_token.clone(),
                generation,
            },
        ) {
            previous.cancel_token.cancel();
        }

        let pending = self.pending.clone();
        let session_id = session_id.to_string();
        debug!(session_id = %session_id, delay_secs = delay.as_secs(), "Scheduled auto-stop");

        tokio::spawn(async move {
            tokio::select! {
                _ = cancel_token.cancelled() => {
                    debug!(session_id = %session_id, "Auto-stop cancelled");
                }
                _ = tokio::time::sleep(delay) => {
                    // A newer timer for the same session keeps its entry
                    pending.remove_if(&session_id, |_, s| s.generation == generation);
                    info!(session_id = %session_id, "Auto-stop timer fired");
                    on_expiry(session_id).await;
                }
            }
        });
        true
    }

    /// Cancel the session's pending timer; returns whether one existed
    pub fn cancel(&self, session_id: &str) -> bool {
        match self.pending.remove(session_id) {
            Some((_, scheduled)) => {
                scheduled.cancel_token.cancel();
                debug!(session_id = %session_id, "Cancelled auto-stop");
                true
            }
            None => false,
        }
    }

    /// Whether a timer is pending for the session
    pub fn is_scheduled(&self, session_id: &str) -> bool {
        self.pending.contains_key(session_id)
    }

    /// Number of pending timers
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// True when no timer is pending
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Cancel every pending timer (shutdown)
    pub fn cancel_all(&self) {
        let count = self.pending.len();
        if count > 0 {
            info!(count, "Cancelling all pending auto-stops");
            self.pending.retain(|_, scheduled| {
                scheduled.cancel_token.cancel();
                false
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn recorder() -> (
        mpsc::UnboundedSender<String>,
        mpsc::UnboundedReceiver<String>,
    ) {
        mpsc::unbounded_channel()
    }

    fn on_expiry(
        tx: mpsc::UnboundedSender<String>,
    ) -> impl FnOnce(String) -> std::pin::Pin<Box<dyn Future<Output = ()> + Send>> + Send + 'static
    {
        move |id| {
            Box::pin(async move {
                let _ = tx.send(id);
            })
        }
    }

    // ==========================================================================
    // Story Tests: Auto-Stop Timers
    // ==========================================================================

    /// Story: A timer fires once its delay elapses and is then forgotten
    #[tokio::test(start_paused = true)]
    async fn story_timer_fires_after_delay() {
        let scheduler = AutoStopScheduler::new();
        let (tx, mut rx) = recorder();

        assert!(scheduler.schedule("rec-1", Duration::from_secs(5), on_expiry(tx)));
        assert!(scheduler.is_scheduled("rec-1"));

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(rx.recv().await.as_deref(), Some("rec-1"));
        assert!(!scheduler.is_scheduled("rec-1"));
    }

    /// Story: Stopping a session before its deadline means the timer never fires
    #[tokio::test(start_paused = true)]
    async fn story_cancel_before_expiry() {
        let scheduler = AutoStopScheduler::new();
        let (tx, mut rx) = recorder();

        scheduler.schedule("rec-1", Duration::from_secs(5), on_expiry(tx));
        assert!(scheduler.cancel("rec-1"));
        // Cancelling twice is harmless
        assert!(!scheduler.cancel("rec-1"));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(rx.try_recv().is_err());
        assert!(scheduler.is_empty());
    }

    /// Story: Rescheduling replaces the earlier timer
    #[tokio::test(start_paused = true)]
    async fn story_reschedule_replaces_timer() {
        let scheduler = AutoStopScheduler::new();
        let (tx, mut rx) = recorder();

        scheduler.schedule("rec-1", Duration::from_secs(5), on_expiry(tx.clone()));
        scheduler.schedule("rec-1", Duration::from_secs(20), on_expiry(tx));
        assert_eq!(scheduler.len(), 1);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(rx.try_recv().is_err());
        assert!(scheduler.is_scheduled("rec-1"));

        tokio::time::sleep(Duration::from_secs(15)).await;
        assert_eq!(rx.recv().await.as_deref(), Some("rec-1"));
    }

    #[tokio::test]
    async fn zero_delay_schedules_nothing() {
        let scheduler = AutoStopScheduler::new();
        let (tx, _rx) = recorder();
        assert!(!scheduler.schedule("rec-1", Duration::ZERO, on_expiry(tx)));
        assert!(scheduler.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_all_clears_everything() {
        let scheduler = AutoStopScheduler::new();
        let (tx, mut rx) = recorder();
        scheduler.schedule("a", Duration::from_secs(5), on_expiry(tx.clone()));
        scheduler.schedule("b", Duration::from_secs(5), on_expiry(tx));

        scheduler.cancel_all();
        assert!(scheduler.is_empty());
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(rx.try_recv().is_err());
    }
}

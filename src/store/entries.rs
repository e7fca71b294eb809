//! Captured entry persistence and harvest bookkeeping

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use super::{entries_key, processed_key, StoreBackend};
use crate::model::RecordedEntry;
use crate::Result;

/// Append-only entry lists plus the per-session processed-file sets
#[derive(Clone)]
pub struct EntryStore {
    backend: Arc<dyn StoreBackend>,
    ttl: Duration,
}

impl EntryStore {
    /// Create a store over `backend`
    pub fn new(backend: Arc<dyn StoreBackend>, ttl: Duration) -> Self {
        Self { backend, ttl }
    }

    /// Append entries to a session's list
    pub async fn append(&self, session_id: &str, entries: &[RecordedEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let values = entries
            .iter()
            .map(serde_json::to_string)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        self.backend
            .push(&entries_key(session_id), values, self.ttl)
            .await
    }

    /// Read entries in insertion order; unreadable items are skipped
    pub async fn list(
        &self,
        session_id: &str,
        offset: usize,
        limit: Option<usize>,
    ) -> Result<Vec<RecordedEntry>> {
        let raw = self
            .backend
            .range(&entries_key(session_id), offset, limit)
            .await?;
        Ok(raw
            .iter()
            .filter_map(|json| match serde_json::from_str(json) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    warn!(session_id = %session_id, error = %e, "Skipping unreadable entry");
                    None
                }
            })
            .collect())
    }

    /// Number of stored entries
    pub async fn count(&self, session_id: &str) -> Result<usize> {
        self.backend.list_len(&entries_key(session_id)).await
    }

    /// Record that a capture file was harvested; true when it was not already
    pub async fn mark_processed(&self, session_id: &str, file_key: &str) -> Result<bool> {
        self.backend
            .set_add(&processed_key(session_id), file_key, self.ttl)
            .await
    }

    /// Release a claim taken by [`mark_processed`](Self::mark_processed) so the
    /// file is harvested again
    pub async fn unmark_processed(&self, session_id: &str, file_key: &str) -> Result<bool> {
        self.backend
            .set_remove(&processed_key(session_id), file_key)
            .await
    }

    /// Whether a capture file was already harvested
    pub async fn is_processed(&self, session_id: &str, file_key: &str) -> Result<bool> {
        self.backend
            .set_contains(&processed_key(session_id), file_key)
            .await
    }
}

//! Session record persistence

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, warn};

use super::{entries_key, processed_key, state_key, StoreBackend, KEY_PREFIX};
use crate::model::{RecordingSession, SessionStatus};
use crate::{Error, Result};

/// Stores one JSON record per session; every write refreshes the TTL
#[derive(Clone)]
pub struct SessionStore {
    backend: Arc<dyn StoreBackend>,
    ttl: Duration,
}

impl SessionStore {
    /// Create a store over `backend`
    pub fn new(backend: Arc<dyn StoreBackend>, ttl: Duration) -> Self {
        Self { backend, ttl }
    }

    /// Insert or overwrite a session record
    pub async fn save(&self, session: &RecordingSession) -> Result<()> {
        let json = serde_json::to_string(session)?;
        self.backend
            .set_ex(&state_key(&session.session_id), json, self.ttl)
            .await?;
        debug!(session_id = %session.session_id, status = %session.status, "Saved session");
        Ok(())
    }

    /// Load a session record
    pub async fn load(&self, session_id: &str) -> Result<Option<RecordingSession>> {
        match self.backend.get(&state_key(session_id)).await? {
            Some(json) => serde_json::from_str(&json).map(Some).map_err(|e| {
                Error::serialization(format!("session {} record is corrupt: {}", session_id, e))
            }),
            None => Ok(None),
        }
    }

    /// Load a session record or fail with not-found
    pub async fn require(&self, session_id: &str) -> Result<RecordingSession> {
        self.load(session_id)
            .await?
            .ok_or_else(|| Error::not_found("session", session_id))
    }

    /// Whether a session record exists
    pub async fn exists(&self, session_id: &str) -> Result<bool> {
        Ok(self.backend.get(&state_key(session_id)).await?.is_some())
    }

    /// Delete the session record together with its entries and processed markers
    pub async fn delete(&self, session_id: &str) -> Result<()> {
        self.backend
            .del(vec![
                state_key(session_id),
                entries_key(session_id),
                processed_key(session_id),
            ])
            .await?;
        debug!(session_id = %session_id, "Deleted session");
        Ok(())
    }

    /// Move a session to `status`
    ///
    /// Returns false without writing when the session is gone or the move
    /// would go backwards. Reaching STOPPED or ERROR stamps `stopped_at`.
    pub async fn update_status(&self, session_id: &str, status: SessionStatus) -> Result<bool> {
        let Some(mut session) = self.load(session_id).await? else {
            warn!(session_id = %session_id, status = %status, "Status update for missing session skipped");
            return Ok(false);
        };
        if !session.status.can_transition_to(status) {
            warn!(
                session_id = %session_id,
                from = %session.status,
                to = %status,
                "Backward status transition skipped"
            );
            return Ok(false);
        }
        session.status = status;
        if status.is_terminal() && session.stopped_at.is_none() {
            session.stopped_at = Some(Utc::now());
        }
        self.save(&session).await?;
        Ok(true)
    }

    /// Mark a session as failed with `message`
    pub async fn set_error(&self, session_id: &str, message: &str) -> Result<bool> {
        let Some(mut session) = self.load(session_id).await? else {
            warn!(session_id = %session_id, error = %message, "Error update for missing session skipped");
            return Ok(false);
        };
        session.status = SessionStatus::Error;
        session.error_message = Some(message.to_string());
        if session.stopped_at.is_none() {
            session.stopped_at = Some(Utc::now());
        }
        self.save(&session).await?;
        Ok(true)
    }

    /// Every stored session, oldest first
    pub async fn list_all(&self) -> Result<Vec<RecordingSession>> {
        let mut sessions = Vec::new();
        for key in self.backend.keys_with_prefix(KEY_PREFIX).await? {
            let Some(id) = key
                .strip_prefix(KEY_PREFIX)
                .and_then(|rest| rest.strip_suffix(":state"))
            else {
                continue;
            };
            match self.load(id).await {
                Ok(Some(session)) => sessions.push(session),
                Ok(None) => {}
                Err(e) => warn!(session_id = %id, error = %e, "Skipping unreadable session"),
            }
        }
        sessions.sort_by_key(|s| s.started_at);
        Ok(sessions)
    }

    /// Sessions currently RECORDING
    pub async fn list_active(&self) -> Result<Vec<RecordingSession>> {
        Ok(self
            .list_all()
            .await?
            .into_iter()
            .filter(|s| s.is_active())
            .collect())
    }

    /// The active session targeting `namespace/service`, if any
    pub async fn find_active_for_service(
        &self,
        namespace: &str,
        service: &str,
    ) -> Result<Option<RecordingSession>> {
        Ok(self
            .list_active()
            .await?
            .into_iter()
            .find(|s| s.namespace == namespace && s.service_name == service))
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::recording_session;
    use super::*;
    use crate::store::{MemoryBackend, MockStoreBackend};

    fn store() -> SessionStore {
        SessionStore::new(Arc::new(MemoryBackend::new()), Duration::from_secs(3600))
    }

    // ==========================================================================
    // Story Tests: Session Lifecycle in the Store
    // ==========================================================================

    /// Story: A session moves forward through its lifecycle and never back
    #[tokio::test]
    async fn story_status_only_moves_forward() {
        let store = store();
        store.save(&recording_session("rec-1")).await.unwrap();

        assert!(store.update_status("rec-1", SessionStatus::Stopping).await.unwrap());
        assert!(!store.update_status("rec-1", SessionStatus::Recording).await.unwrap());
        assert!(store.update_status("rec-1", SessionStatus::Stopped).await.unwrap());

        let s = store.require("rec-1").await.unwrap();
        assert_eq!(s.status, SessionStatus::Stopped);
        assert!(s.stopped_at.is_some());
    }

    /// Story: Updates racing a delete are skipped, not errors
    #[tokio::test]
    async fn story_updates_on_missing_session_are_skipped() {
        let store = store();
        assert!(!store.update_status("ghost", SessionStatus::Stopped).await.unwrap());
        assert!(!store.set_error("ghost", "boom").await.unwrap());
        assert!(!store.exists("ghost").await.unwrap());
        assert!(store.require("ghost").await.unwrap_err().is_not_found());
    }

    /// Story: A failure records its message and stop time
    #[tokio::test]
    async fn story_error_is_recorded() {
        let store = store();
        store.save(&recording_session("rec-1")).await.unwrap();
        assert!(store.set_error("rec-1", "deployment not ready").await.unwrap());

        let s = store.require("rec-1").await.unwrap();
        assert_eq!(s.status, SessionStatus::Error);
        assert_eq!(s.error_message.as_deref(), Some("deployment not ready"));
        assert!(s.stopped_at.is_some());

        // ERROR is final
        assert!(!store.update_status("rec-1", SessionStatus::Stopped).await.unwrap());
    }

    #[tokio::test]
    async fn list_active_filters_by_status() {
        let store = store();
        store.save(&recording_session("rec-1")).await.unwrap();
        let mut stopped = recording_session("rec-2");
        stopped.status = SessionStatus::Stopped;
        store.save(&stopped).await.unwrap();

        assert_eq!(store.list_all().await.unwrap().len(), 2);
        let active = store.list_active().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].session_id, "rec-1");

        let found = store.find_active_for_service("shop", "orders").await.unwrap();
        assert_eq!(found.map(|s| s.session_id).as_deref(), Some("rec-1"));
        assert!(store
            .find_active_for_service("shop", "payments")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn delete_removes_record_entries_and_markers() {
        let mut backend = MockStoreBackend::new();
        backend
            .expect_del()
            .times(1)
            .withf(|keys| {
                keys == &vec![
                    "rec:rec-1:state".to_string(),
                    "rec:rec-1:entries".to_string(),
                    "rec:rec-1:processed".to_string(),
                ]
            })
            .returning(|_| Ok(()));

        SessionStore::new(Arc::new(backend), Duration::from_secs(1))
            .delete("rec-1")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn save_refreshes_ttl() {
        let mut backend = MockStoreBackend::new();
        backend
            .expect_set_ex()
            .times(2)
            .withf(|key, _, ttl| key == "rec:rec-1:state" && *ttl == Duration::from_secs(42))
            .returning(|_, _, _| Ok(()));

        let store = SessionStore::new(Arc::new(backend), Duration::from_secs(42));
        let s = recording_session("rec-1");
        store.save(&s).await.unwrap();
        store.save(&s).await.unwrap();
    }

    #[tokio::test]
    async fn corrupt_record_is_a_serialization_error() {
        let backend = Arc::new(MemoryBackend::new());
        backend
            .set_ex("rec:bad:state", "{not json".to_string(), Duration::from_secs(5))
            .await
            .unwrap();
        let store = SessionStore::new(backend, Duration::from_secs(5));
        assert!(matches!(store.load("bad").await, Err(Error::Serialization(_))));
        // Listing tolerates it
        assert!(store.list_all().await.unwrap().is_empty());
    }
}

//! Session and entry persistence
//!
//! Everything is stored under per-session keys in a key/value backend:
//!
//! - `rec:{id}:state`: the session record as JSON, TTL refreshed on every write
//! - `rec:{id}:entries`: append-only list of captured entries as JSON
//! - `rec:{id}:processed`: set of capture files already harvested
//!
//! [`StoreBackend`] is the seam; the in-memory backend is the default and a
//! Redis backend is available behind the `redis` feature.

mod entries;
mod memory;
#[cfg(feature = "redis")]
mod redis_backend;
mod sessions;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

#[cfg(test)]
use mockall::automock;

use crate::config::{StoreBackendKind, StoreSettings};
use crate::Result;

pub use entries::EntryStore;
pub use memory::MemoryBackend;
#[cfg(feature = "redis")]
pub use redis_backend::RedisBackend;
pub use sessions::SessionStore;
#[cfg(test)]
pub(crate) use sessions::fixtures;

/// Prefix shared by every key
pub const KEY_PREFIX: &str = "rec:";

/// Key of a session record
pub fn state_key(session_id: &str) -> String {
    format!("{}{}:state", KEY_PREFIX, session_id)
}

/// Key of a session's entry list
pub fn entries_key(session_id: &str) -> String {
    format!("{}{}:entries", KEY_PREFIX, session_id)
}

/// Key of a session's processed-file set
pub fn processed_key(session_id: &str) -> String {
    format!("{}{}:processed", KEY_PREFIX, session_id)
}

/// Minimal key/value operations the stores need
///
/// Every write that takes a `ttl` (re)sets the key's expiry.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StoreBackend: Send + Sync {
    /// Read a string value
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write a string value with an expiry
    async fn set_ex(&self, key: &str, value: String, ttl: Duration) -> Result<()>;

    /// Delete keys; missing keys are ignored
    async fn del(&self, keys: Vec<String>) -> Result<()>;

    /// Append values to a list and refresh its expiry
    async fn push(&self, key: &str, values: Vec<String>, ttl: Duration) -> Result<()>;

    /// Read `limit` list items starting at `offset` (all remaining when None)
    async fn range(&self, key: &str, offset: usize, limit: Option<usize>) -> Result<Vec<String>>;

    /// Length of a list (0 when missing)
    async fn list_len(&self, key: &str) -> Result<usize>;

    /// Add a member to a set and refresh its expiry; true when newly added
    async fn set_add(&self, key: &str, member: &str, ttl: Duration) -> Result<bool>;

    /// Whether a set contains a member
    async fn set_contains(&self, key: &str, member: &str) -> Result<bool>;

    /// Remove a member from a set; true when it was present
    async fn set_remove(&self, key: &str, member: &str) -> Result<bool>;

    /// Every live key starting with `prefix`
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Build the configured backend
pub async fn connect(settings: &StoreSettings) -> Result<Arc<dyn StoreBackend>> {
    match settings.backend {
        StoreBackendKind::Memory => {
            info!("Using in-memory session store");
            Ok(Arc::new(MemoryBackend::new()))
        }
        #[cfg(feature = "redis")]
        StoreBackendKind::Redis => {
            let backend = crate::retry::retry_with_backoff(
                &crate::retry::RetryConfig::with_max_attempts(5),
                "redis_connect",
                || RedisBackend::connect(&settings.redis_url),
            )
            .await?;
            info!(url = %settings.redis_url, "Using Redis session store");
            Ok(Arc::new(backend))
        }
        #[cfg(not(feature = "redis"))]
        StoreBackendKind::Redis => Err(crate::Error::validation(
            "redis store requested but meshtap was built without the `redis` feature",
        )),
    }
}

/// Session and entry stores over one backend
#[derive(Clone)]
pub struct Stores {
    /// Session records
    pub sessions: SessionStore,
    /// Captured entries and processed-file markers
    pub entries: EntryStore,
}

impl Stores {
    /// Build both stores over a shared backend
    pub fn new(backend: Arc<dyn StoreBackend>, settings: &StoreSettings) -> Self {
        Self {
            sessions: SessionStore::new(backend.clone(), settings.session_ttl()),
            entries: EntryStore::new(backend, settings.entry_ttl()),
        }
    }

    /// In-memory stores with default TTLs
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()), &StoreSettings::default())
    }

    /// Delete a session record together with its entries and markers
    pub async fn purge(&self, session_id: &str) -> Result<()> {
        self.sessions.delete(session_id).await
    }
}

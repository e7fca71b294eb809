//! Process-local store backend
//!
//! Keys expire lazily: an expired slot is dropped the next time it is touched
//! or listed.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;

use super::StoreBackend;
use crate::{Error, Result};

#[derive(Debug)]
enum Value {
    Str(String),
    List(Vec<String>),
    Set(HashSet<String>),
}

#[derive(Debug)]
struct Slot {
    value: Value,
    expires_at: Instant,
}

impl Slot {
    fn live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// In-memory backend; contents are lost on restart
#[derive(Default)]
pub struct MemoryBackend {
    slots: DashMap<String, Slot>,
}

impl MemoryBackend {
    /// Create an empty backend
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `read` against a live value without copying it out of the map
    fn with_live<T>(&self, key: &str, read: impl FnOnce(&Value) -> T) -> Option<T> {
        let now = Instant::now();
        self.slots.remove_if(key, |_, slot| !slot.live(now));
        self.slots.get(key).map(|slot| read(&slot.value))
    }
}

fn wrong_type(key: &str) -> Error {
    Error::store(format!("key {} holds a value of another type", key))
}

#[async_trait]
impl StoreBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        match self.with_live(key, |value| match value {
            Value::Str(v) => Ok(v.clone()),
            _ => Err(wrong_type(key)),
        }) {
            None => Ok(None),
            Some(v) => v.map(Some),
        }
    }

    async fn set_ex(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        self.slots.insert(
            key.to_string(),
            Slot {
                value: Value::Str(value),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn del(&self, keys: Vec<String>) -> Result<()> {
        for key in keys {
            self.slots.remove(&key);
        }
        Ok(())
    }

    async fn push(&self, key: &str, values: Vec<String>, ttl: Duration) -> Result<()> {
        let now = Instant::now();
        let mut slot = self.slots.entry(key.to_string()).or_insert_with(|| Slot {
            value: Value::List(Vec::new()),
            expires_at: now,
        });
        if !slot.live(now) {
            slot.value = Value::List(Vec::new());
        }
        match &mut slot.value {
            Value::List(items) => items.extend(values),
            _ => return Err(wrong_type(key)),
        }
        slot.expires_at = now + ttl;
        Ok(())
    }

    async fn range(&self, key: &str, offset: usize, limit: Option<usize>) -> Result<Vec<String>> {
        self.with_live(key, |value| match value {
            Value::List(items) => {
                let it = items.iter().skip(offset).cloned();
                Ok(match limit {
                    Some(n) => it.take(n).collect(),
                    None => it.collect(),
                })
            }
            _ => Err(wrong_type(key)),
        })
        .unwrap_or_else(|| Ok(Vec::new()))
    }

    async fn list_len(&self, key: &str) -> Result<usize> {
        self.with_live(key, |value| match value {
            Value::List(items) => Ok(items.len()),
            _ => Err(wrong_type(key)),
        })
        .unwrap_or(Ok(0))
    }

    async fn set_add(&self, key: &str, member: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut slot = self.slots.entry(key.to_string()).or_insert_with(|| Slot {
            value: Value::Set(HashSet::new()),
            expires_at: now,
        });
        if !slot.live(now) {
            slot.value = Value::Set(HashSet::new());
        }
        let added = match &mut slot.value {
            Value::Set(members) => members.insert(member.to_string()),
            _ => return Err(wrong_type(key)),
        };
        slot.expires_at = now + ttl;
        Ok(added)
    }

    async fn set_contains(&self, key: &str, member: &str) -> Result<bool> {
        self.with_live(key, |value| match value {
            Value::Set(members) => Ok(members.contains(member)),
            _ => Err(wrong_type(key)),
        })
        .unwrap_or(Ok(false))
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<bool> {
        let now = Instant::now();
        self.slots.remove_if(key, |_, slot| !slot.live(now));
        let Some(mut slot) = self.slots.get_mut(key) else {
            return Ok(false);
        };
        match &mut slot.value {
            Value::Set(members) => Ok(members.remove(member)),
            _ => Err(wrong_type(key)),
        }
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let now = Instant::now();
        self.slots.retain(|_, slot| slot.live(now));
        let mut keys: Vec<String> = self
            .slots
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}

//! Redis store backend

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use tracing::debug;

use super::StoreBackend;
use crate::{Error, Result};

/// Keys fetched per SCAN round trip
const SCAN_COUNT: usize = 200;

/// Backend over a multiplexed Redis connection
pub struct RedisBackend {
    conn: MultiplexedConnection,
}

impl RedisBackend {
    /// Connect to `url` (e.g. `redis://127.0.0.1:6379`)
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(store_error)?;
        let conn = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(store_error)?;
        debug!(url = %url, "Connected to Redis");
        Ok(Self { conn })
    }
}

fn store_error(e: redis::RedisError) -> Error {
    Error::store(e.to_string())
}

fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

/// List index clamped into Redis' signed range
fn redis_index(index: usize) -> i64 {
    i64::try_from(index).unwrap_or(i64::MAX)
}

#[async_trait]
impl StoreBackend for RedisBackend {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        redis::cmd("GET")
            .arg(key)
            .query_async::<_, Option<String>>(&mut conn)
            .await
            .map_err(store_error)
    }

    async fn set_ex(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl_secs(ttl))
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(store_error)
    }

    async fn del(&self, keys: Vec<String>) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        redis::cmd("DEL")
            .arg(keys)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(store_error)
    }

    async fn push(&self, key: &str, values: Vec<String>, ttl: Duration) -> Result<()> {
        if values.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .cmd("RPUSH")
            .arg(key)
            .arg(values)
            .ignore()
            .cmd("EXPIRE")
            .arg(key)
            .arg(ttl_secs(ttl))
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(store_error)
    }

    async fn range(&self, key: &str, offset: usize, limit: Option<usize>) -> Result<Vec<String>> {
        let stop: i64 = match limit {
            Some(0) => return Ok(Vec::new()),
            Some(n) => redis_index(offset.saturating_add(n - 1)),
            None => -1,
        };
        let mut conn = self.conn.clone();
        redis::cmd("LRANGE")
            .arg(key)
            .arg(redis_index(offset))
            .arg(stop)
            .query_async::<_, Vec<String>>(&mut conn)
            .await
            .map_err(store_error)
    }

    async fn list_len(&self, key: &str) -> Result<usize> {
        let mut conn = self.conn.clone();
        redis::cmd("LLEN")
            .arg(key)
            .query_async::<_, usize>(&mut conn)
            .await
            .map_err(store_error)
    }

    async fn set_add(&self, key: &str, member: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let (added,): (i64,) = redis::pipe()
            .atomic()
            .cmd("SADD")
            .arg(key)
            .arg(member)
            .cmd("EXPIRE")
            .arg(key)
            .arg(ttl_secs(ttl))
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(store_error)?;
        Ok(added > 0)
    }

    async fn set_contains(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        redis::cmd("SISMEMBER")
            .arg(key)
            .arg(member)
            .query_async::<_, bool>(&mut conn)
            .await
            .map_err(store_error)
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = redis::cmd("SREM")
            .arg(key)
            .arg(member)
            .query_async(&mut conn)
            .await
            .map_err(store_error)?;
        Ok(removed > 0)
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let pattern = format!("{}*", prefix);
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await
                .map_err(store_error)?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }
}

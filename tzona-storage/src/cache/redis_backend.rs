//! Redis cache tier.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use super::traits::{CacheBackend, CacheError, CacheResult, CacheStats};

const BACKEND: &str = "redis";

#[derive(Clone)]
pub struct RedisCache {
    conn: ConnectionManager,
}

impl std::fmt::Debug for RedisCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCache").finish_non_exhaustive()
    }
}

impl RedisCache {
    /// Connect and keep a managed, auto-reconnecting connection.
    pub async fn connect(url: &str) -> CacheResult<Self> {
        let client = redis::Client::open(url).map_err(|e| CacheError::unavailable(BACKEND, e))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| CacheError::unavailable(BACKEND, e))?;
        Ok(Self { conn })
    }
}

fn command_error(e: redis::RedisError) -> CacheError {
    if e.is_io_error() || e.is_connection_dropped() || e.is_timeout() {
        CacheError::unavailable(BACKEND, e)
    } else {
        CacheError::command(BACKEND, e)
    }
}

#[async_trait]
impl CacheBackend for RedisCache {
    fn name(&self) -> &'static str {
        BACKEND
    }

    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        let mut conn = self.conn.clone();
        conn.get(key).await.map_err(command_error)
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> CacheResult<()> {
        let mut conn = self.conn.clone();
        let seconds = ttl.as_secs().max(1);
        conn.set_ex::<_, _, ()>(key, value, seconds)
            .await
            .map_err(command_error)
    }

    async fn delete(&self, key: &str) -> CacheResult<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key).await.map_err(command_error)
    }

    async fn stats(&self) -> CacheResult<CacheStats> {
        let mut conn = self.conn.clone();
        let entry_count: u64 = redis::cmd("DBSIZE")
            .query_async(&mut conn)
            .await
            .map_err(command_error)?;
        Ok(CacheStats {
            entry_count,
            ..CacheStats::default()
        })
    }
}

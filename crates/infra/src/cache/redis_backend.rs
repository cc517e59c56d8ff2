//! Redis-backed cache hashes (optional, `redis` feature).
//!
//! One Redis hash per record: `HSET` for writes, `HGETALL` for reads, `DEL`
//! for eviction. Keys never expire.

use std::collections::HashMap;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;

use super::{CacheBackend, CacheError};

#[derive(Clone)]
pub struct RedisCacheBackend {
    conn: MultiplexedConnection,
}

impl RedisCacheBackend {
    pub async fn connect(redis_url: impl AsRef<str>) -> Result<Self, CacheError> {
        let client = redis::Client::open(redis_url.as_ref()).map_err(redis_error)?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(redis_error)?;
        Ok(Self { conn })
    }
}

impl core::fmt::Debug for RedisCacheBackend {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RedisCacheBackend").finish_non_exhaustive()
    }
}

fn redis_error(err: redis::RedisError) -> CacheError {
    CacheError::Backend(err.to_string())
}

#[async_trait]
impl CacheBackend for RedisCacheBackend {
    async fn hash_set(&self, key: &str, field: &str, value: String) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.hset(key, field, value).await.map_err(redis_error)?;
        Ok(())
    }

    async fn hash_set_many(&self, key: &str, entries: Vec<(String, String)>) -> Result<(), CacheError> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let _: () = conn.hset_multiple(key, &entries).await.map_err(redis_error)?;
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, CacheError> {
        let mut conn = self.conn.clone();
        conn.hgetall(key).await.map_err(redis_error)
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.del(key).await.map_err(redis_error)?;
        Ok(())
    }
}

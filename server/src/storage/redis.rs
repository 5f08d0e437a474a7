//! Redis key-value store.
//!
//! Enable with the `redis` feature. Every call clones the shared
//! [`ConnectionManager`], which reconnects on its own after a dropped link.

use super::{KeyValueStore, Result, StoreError};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisError};

pub struct RedisStore {
    connection: ConnectionManager,
}

impl RedisStore {
    /// Opens a managed connection to `url` (`redis://host:port/db`).
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(|e| StoreError::Backend(e.to_string()))?;
        let connection = client
            .get_connection_manager()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        Ok(Self { connection })
    }
}

fn store_error(key: &str, error: RedisError) -> StoreError {
    if error.code() == Some("WRONGTYPE") {
        StoreError::WrongType(key.to_string())
    } else {
        StoreError::Backend(error.to_string())
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut connection = self.connection.clone();
        connection
            .get(key)
            .await
            .map_err(|e| store_error(key, e))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut connection = self.connection.clone();
        connection
            .set(key, value)
            .await
            .map_err(|e| store_error(key, e))
    }

    async fn hash_get(&self, hash: &str, field: &str) -> Result<Option<String>> {
        let mut connection = self.connection.clone();
        connection
            .hget(hash, field)
            .await
            .map_err(|e| store_error(hash, e))
    }

    async fn hash_set(&self, hash: &str, field: &str, value: &str) -> Result<()> {
        let mut connection = self.connection.clone();
        connection
            .hset(hash, field, value)
            .await
            .map_err(|e| store_error(hash, e))
    }

    async fn hash_incr_by(&self, hash: &str, field: &str, delta: i64) -> Result<i64> {
        let mut connection = self.connection.clone();
        connection
            .hincr(hash, field, delta)
            .await
            .map_err(|e| {
                if e.to_string().contains("not an integer") {
                    StoreError::NotAnInteger {
                        hash: hash.to_string(),
                        field: field.to_string(),
                    }
                } else {
                    store_error(hash, e)
                }
            })
    }

    async fn sorted_set_add(&self, key: &str, member: &str, score: f64) -> Result<()> {
        let mut connection = self.connection.clone();
        connection
            .zadd(key, member, score)
            .await
            .map_err(|e| store_error(key, e))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut connection = self.connection.clone();
        connection
            .exists(key)
            .await
            .map_err(|e| store_error(key, e))
    }

    async fn expire(&self, key: &str, seconds: u64) -> Result<bool> {
        let seconds = i64::try_from(seconds).unwrap_or(i64::MAX);
        let mut connection = self.connection.clone();
        connection
            .expire(key, seconds)
            .await
            .map_err(|e| store_error(key, e))
    }
}

//! External collaborators: a key-value cache and a relational database.
//!
//! Neither is on the tick path. The server loop only ever reaches the
//! key-value store from spawned tasks, so a slow or broken backend never
//! delays a tick.
//!
//! - [`MemoryStore`]: in-process key-value store (default)
//! - `RedisStore`: shared key-value store, enable with the `redis` feature
//! - `PostgresStore`: relational store, enable with the `postgres` feature

mod memory;

#[cfg(feature = "postgres")]
mod postgres;

#[cfg(feature = "redis")]
mod redis;

pub use memory::MemoryStore;

#[cfg(feature = "postgres")]
pub use postgres::PostgresStore;

#[cfg(feature = "redis")]
pub use self::redis::RedisStore;

use async_trait::async_trait;
use thiserror::Error;

/// Hash holding one JSON metadata record per server instance.
pub const SERVER_LIST_KEY: &str = "manage:server_list";
/// Hash holding the number of joined players per server instance.
pub const ONLINE_BY_SERVER_KEY: &str = "manage:user_online_by_server";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("key {0} holds a value of another type")]
    WrongType(String),

    #[error("field {field} of {hash} is not an integer")]
    NotAnInteger { hash: String, field: String },

    #[error("not connected")]
    NotConnected,

    #[error("backend error: {0}")]
    Backend(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Redis-shaped key-value operations.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> Result<()>;

    async fn hash_get(&self, hash: &str, field: &str) -> Result<Option<String>>;

    async fn hash_set(&self, hash: &str, field: &str, value: &str) -> Result<()>;

    /// Adds `delta` to an integer hash field (missing counts as 0) and
    /// returns the new value.
    async fn hash_incr_by(&self, hash: &str, field: &str, delta: i64) -> Result<i64>;

    async fn sorted_set_add(&self, key: &str, member: &str, score: f64) -> Result<()>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// Expires `key` after `seconds`. Returns `false` if the key is absent.
    async fn expire(&self, key: &str, seconds: u64) -> Result<bool>;
}

/// One result row: column names paired with their values, in column order.
pub type Row = Vec<(String, serde_json::Value)>;

/// Request/response access to a relational database.
#[async_trait]
pub trait RelationalStore: Send + Sync {
    async fn connect(&mut self) -> Result<()>;

    async fn execute(&self, query: &str) -> Result<Vec<Row>>;
}

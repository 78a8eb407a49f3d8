//! Fast read cache. Never the source of truth: every entry can be dropped at
//! any time and is rebuilt from the store on the next read.

pub mod coordinator;
pub mod keys;
pub mod memory;
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use coordinator::CacheCoordinator;
pub use keys::CacheKeys;
pub use memory::MemoryCache;
pub use redis::RedisCache;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend is not connected")]
    Unavailable,
    #[error("cache operation timed out")]
    Timeout,
    #[error(transparent)]
    Redis(#[from] ::redis::RedisError),
    #[error("cache entry carries no invalidation stamp")]
    Unstamped,
    #[error("cache payload could not be decoded: {0}")]
    Codec(#[from] serde_json::Error),
}

#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;
    /// One value per key, in the order given.
    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>, CacheError>;
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError>;
    async fn delete(&self, key: &str) -> Result<(), CacheError>;
    /// Removes every key beginning with `prefix`; returns how many were removed.
    async fn delete_prefix(&self, prefix: &str) -> Result<u64, CacheError>;
}

use std::time::Duration;

use async_trait::async_trait;

use crate::cache::{Cache, CacheError};
use crate::core::redis::RedisHandle;

/// [`Cache`] over the shared Redis connection; reports `Unavailable` while disconnected.
#[derive(Clone)]
pub struct RedisCache {
    handle: RedisHandle,
}

impl RedisCache {
    pub fn new(handle: RedisHandle) -> Self {
        Self { handle }
    }
}

#[async_trait]
impl Cache for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut manager = self.handle.connection().await.ok_or(CacheError::Unavailable)?;
        Ok(RedisHandle::get(&mut manager, key).await?)
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<String>>, CacheError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut manager = self.handle.connection().await.ok_or(CacheError::Unavailable)?;
        Ok(RedisHandle::mget(&mut manager, keys).await?)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), CacheError> {
        let mut manager = self.handle.connection().await.ok_or(CacheError::Unavailable)?;
        Ok(RedisHandle::set_ex(&mut manager, key, value, ttl.as_secs()).await?)
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut manager = self.handle.connection().await.ok_or(CacheError::Unavailable)?;
        Ok(RedisHandle::del(&mut manager, key).await?)
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, CacheError> {
        let mut manager = self.handle.connection().await.ok_or(CacheError::Unavailable)?;
        Ok(RedisHandle::del_prefix(&mut manager, prefix).await?)
    }
}

use std::sync::Arc;

use redis::aio::ConnectionManager;
use redis::{cmd, Client, RedisError};
use tokio::sync::RwLock;

const SCAN_BATCH: usize = 200;

#[derive(Clone)]
pub struct RedisHandle {
    url: String,
    manager: Arc<RwLock<Option<ConnectionManager>>>,
}

#[derive(Debug, Clone)]
pub enum RedisHealth {
    Healthy,
    Disconnected,
    Unhealthy(String),
}

impl RedisHandle {
    pub fn new(url: String) -> Self {
        Self { url, manager: Arc::new(RwLock::new(None)) }
    }

    pub async fn connect(&self) -> Result<(), RedisError> {
        let client = Client::open(self.url.clone())?;
        let manager = ConnectionManager::new(client).await?;
        let mut guard = self.manager.write().await;
        *guard = Some(manager);
        Ok(())
    }

    pub async fn disconnect(&self) {
        let mut guard = self.manager.write().await;
        *guard = None;
    }

    pub async fn health(&self) -> RedisHealth {
        let Some(mut manager) = self.connection().await else {
            return RedisHealth::Disconnected;
        };

        match cmd("PING").query_async::<_, String>(&mut manager).await {
            Ok(_) => RedisHealth::Healthy,
            Err(err) => RedisHealth::Unhealthy(err.to_string()),
        }
    }

    /// `None` when the handle was never connected or has been disconnected.
    pub(crate) async fn connection(&self) -> Option<ConnectionManager> {
        self.manager.read().await.clone()
    }

    pub(crate) async fn get(
        manager: &mut ConnectionManager,
        key: &str,
    ) -> Result<Option<String>, RedisError> {
        cmd("GET").arg(key).query_async::<_, Option<String>>(manager).await
    }

    pub(crate) async fn mget(
        manager: &mut ConnectionManager,
        keys: &[String],
    ) -> Result<Vec<Option<String>>, RedisError> {
        cmd("MGET").arg(keys).query_async::<_, Vec<Option<String>>>(manager).await
    }

    pub(crate) async fn set_ex(
        manager: &mut ConnectionManager,
        key: &str,
        value: &str,
        ttl_seconds: u64,
    ) -> Result<(), RedisError> {
        cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl_seconds.max(1))
            .query_async::<_, ()>(manager)
            .await
    }

    pub(crate) async fn del(manager: &mut ConnectionManager, key: &str) -> Result<(), RedisError> {
        cmd("DEL").arg(key).query_async::<_, i64>(manager).await?;
        Ok(())
    }

    /// Deletes every key starting with `prefix`, walking the keyspace with SCAN.
    pub(crate) async fn del_prefix(
        manager: &mut ConnectionManager,
        prefix: &str,
    ) -> Result<u64, RedisError> {
        let pattern = format!("{}*", escape_glob(prefix));
        let mut cursor: u64 = 0;
        let mut removed: u64 = 0;

        loop {
            let (next, keys): (u64, Vec<String>) = cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(manager)
                .await?;

            if !keys.is_empty() {
                let deleted: i64 = cmd("DEL").arg(&keys).query_async(manager).await?;
                removed += deleted.max(0) as u64;
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        Ok(removed)
    }
}

fn escape_glob(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        if matches!(ch, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

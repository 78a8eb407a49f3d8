use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use uuid::Uuid;

use crate::cache::{Cache, CacheError, CacheKeys};
use crate::core::config::CacheSettings;
use crate::core::context::RequestContext;
use crate::core::errors::DomainResult;

const STAMP_SEPARATOR: char = '|';

enum Lookup<T> {
    Hit(T),
    /// Carries the fence stamp to cache the loaded value under.
    Miss(Option<String>),
}

/// Cache-aside reads and write-then-invalidate for the attempt and answer services.
///
/// Cache failures, timeouts and cancellations are absorbed here: reads fall
/// through to the loader and writes are skipped. Invalidation must only be
/// called after the store commit it follows.
#[derive(Clone)]
pub struct CacheCoordinator {
    cache: Arc<dyn Cache>,
    keys: CacheKeys,
    settings: CacheSettings,
}

impl CacheCoordinator {
    pub fn new(cache: Arc<dyn Cache>, settings: CacheSettings) -> Self {
        let keys = CacheKeys::new(settings.key_prefix.clone());
        Self { cache, keys, settings }
    }

    pub fn keys(&self) -> &CacheKeys {
        &self.keys
    }

    pub fn entity_ttl(&self) -> Duration {
        self.settings.entity_ttl()
    }

    pub fn list_ttl(&self) -> Duration {
        self.settings.list_ttl()
    }

    pub fn exists_ttl(&self) -> Duration {
        self.settings.exists_ttl()
    }

    /// Returns the cached value for `key`, or loads it, caches it for `ttl` and returns it.
    ///
    /// Entries are stamped with the invalidation fences seen before the load, and
    /// a hit only counts while those fences are unchanged. A populate that lands
    /// after a concurrent invalidation is therefore never served.
    ///
    /// Loader errors are returned untouched and nothing is cached for them.
    pub async fn read_through<T, F, Fut>(
        &self,
        ctx: &RequestContext,
        key: &str,
        ttl: Duration,
        load: F,
    ) -> DomainResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = DomainResult<T>>,
    {
        let stamp = match self.lookup::<T>(ctx, key).await {
            Lookup::Hit(value) => {
                metrics::counter!("cache_hits_total").increment(1);
                return Ok(value);
            }
            Lookup::Miss(stamp) => stamp,
        };
        metrics::counter!("cache_misses_total").increment(1);

        let value = load().await?;
        if let Some(stamp) = stamp {
            self.put_json(ctx, key, &stamp, &value, ttl).await;
        }
        Ok(value)
    }

    /// Moves the fence of every key and prefix, then deletes them. Runs to
    /// completion even when the request has been cancelled, since the store
    /// write it follows has already committed.
    pub async fn invalidate<K, P>(&self, keys: K, prefixes: P)
    where
        K: IntoIterator<Item = String>,
        P: IntoIterator<Item = String>,
    {
        let keys: BTreeSet<String> = keys.into_iter().collect();
        let prefixes: BTreeSet<String> = prefixes.into_iter().collect();

        let fence_ttl = self.settings.fence_ttl();
        for target in keys.iter().chain(prefixes.iter()) {
            let fence = self.keys.fence(target);
            let token = Uuid::new_v4().simple().to_string();
            self.bounded("fence", &fence, self.cache.set(&fence, &token, fence_ttl)).await;
        }
        for key in &keys {
            self.bounded("delete", key, self.cache.delete(key)).await;
        }
        for prefix in &prefixes {
            self.bounded("delete_prefix", prefix, self.cache.delete_prefix(prefix)).await;
        }
    }

    /// Reads the entry and its fences in one round trip. Missing fences are
    /// planted with fresh tokens; `Miss(None)` means the result must not be cached.
    async fn lookup<T: DeserializeOwned>(&self, ctx: &RequestContext, key: &str) -> Lookup<T> {
        let fences = self.keys.fences_for(key);
        let mut request = Vec::with_capacity(fences.len() + 1);
        request.push(key.to_string());
        request.extend(fences.iter().cloned());

        let Some(mut values) = self.guarded(ctx, "get", key, self.cache.get_many(&request)).await
        else {
            return Lookup::Miss(None);
        };
        if values.len() != request.len() {
            return Lookup::Miss(None);
        }
        let raw = values.remove(0);

        let mut tokens = Vec::with_capacity(fences.len());
        for (fence, current) in fences.iter().zip(values) {
            match current {
                Some(token) => tokens.push(token),
                None => {
                    let token = Uuid::new_v4().simple().to_string();
                    let ttl = self.settings.fence_ttl();
                    let plant = self.cache.set(fence, &token, ttl);
                    if self.guarded(ctx, "fence", fence, plant).await.is_none() {
                        return Lookup::Miss(None);
                    }
                    tokens.push(token);
                }
            }
        }
        let stamp = tokens.join(",");

        let Some(raw) = raw else {
            return Lookup::Miss(Some(stamp));
        };
        let Some((entry_stamp, payload)) = raw.split_once(STAMP_SEPARATOR) else {
            self.report("decode", key, &CacheError::Unstamped);
            return Lookup::Miss(Some(stamp));
        };
        if entry_stamp != stamp {
            tracing::debug!(key, "Cache entry predates an invalidation; reloading");
            return Lookup::Miss(Some(stamp));
        }
        match serde_json::from_str::<T>(payload) {
            Ok(value) => Lookup::Hit(value),
            Err(err) => {
                self.report("decode", key, &CacheError::Codec(err));
                Lookup::Miss(Some(stamp))
            }
        }
    }

    async fn put_json<T: Serialize>(
        &self,
        ctx: &RequestContext,
        key: &str,
        stamp: &str,
        value: &T,
        ttl: Duration,
    ) {
        let payload = match serde_json::to_string(value) {
            Ok(payload) => payload,
            Err(err) => {
                self.report("encode", key, &CacheError::Codec(err));
                return;
            }
        };
        let raw = format!("{stamp}{STAMP_SEPARATOR}{payload}");
        self.guarded(ctx, "set", key, self.cache.set(key, &raw, ttl)).await;
    }

    /// Bounded by the cache timeout and the request's cancellation scope.
    async fn guarded<T, F>(
        &self,
        ctx: &RequestContext,
        op: &'static str,
        key: &str,
        fut: F,
    ) -> Option<T>
    where
        F: Future<Output = Result<T, CacheError>>,
    {
        match ctx.race(self.bounded(op, key, fut)).await {
            Some(value) => value,
            None => {
                tracing::debug!(op, key, request_id = %ctx.request_id(), "Cache call abandoned by cancelled request");
                None
            }
        }
    }

    /// Bounded by the cache timeout only.
    async fn bounded<T, F>(&self, op: &'static str, key: &str, fut: F) -> Option<T>
    where
        F: Future<Output = Result<T, CacheError>>,
    {
        match tokio::time::timeout(self.settings.op_timeout(), fut).await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(err)) => {
                self.report(op, key, &err);
                None
            }
            Err(_) => {
                self.report(op, key, &CacheError::Timeout);
                None
            }
        }
    }

    fn report(&self, op: &'static str, key: &str, err: &CacheError) {
        metrics::counter!("cache_errors_total", "op" => op).increment(1);
        tracing::warn!(op, key, error = %err, "Cache operation failed; falling back to store");
    }
}

//! Two-tier `Cache`: L1 in-process LRU+TTL, L2 shared (Redis) with
//! broadcast invalidation.

use lru::LruCache;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

/// Cross-process invalidation message published on the well-known channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvalidationMessage {
    pub source_id: String,
    pub action: InvalidationAction,
    pub key: Option<String>,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvalidationAction {
    Set,
    Delete,
    Clear,
}

/// Cache key formula: `"prompt:{name}:v{version_or_'latest'}"`.
pub fn cache_key(name: &str, version_or_latest: &str) -> String {
    format!("prompt:{name}:v{version_or_latest}")
}

struct L1Entry {
    value: Vec<u8>,
    inserted: Instant,
}

struct L1 {
    inner: RwLock<LruCache<String, L1Entry>>,
    ttl: Duration,
}

impl L1 {
    fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            inner: RwLock::new(LruCache::new(NonZeroUsize::new(capacity.max(1)).unwrap())),
            ttl,
        }
    }

    fn get(&self, key: &str) -> Option<Vec<u8>> {
        let mut cache = self.inner.write().unwrap();
        if let Some(entry) = cache.get(key) {
            if entry.inserted.elapsed() < self.ttl {
                return Some(entry.value.clone());
            }
        }
        cache.pop(key);
        None
    }

    fn put(&self, key: String, value: Vec<u8>) {
        self.inner.write().unwrap().put(
            key,
            L1Entry {
                value,
                inserted: Instant::now(),
            },
        );
    }

    fn invalidate(&self, key: &str) {
        self.inner.write().unwrap().pop(key);
    }

    fn invalidate_pattern(&self, prefix: &str) {
        let mut cache = self.inner.write().unwrap();
        let matching: Vec<String> = cache
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for k in matching {
            cache.pop(&k);
        }
    }

    fn clear(&self) {
        self.inner.write().unwrap().clear();
    }
}

/// Two-tier read cache with broadcast invalidation across processes. L2 is
/// optional: when Redis is unavailable at startup and degradation is
/// allowed, the cache runs L1-only and never starts the subscriber.
pub struct Cache {
    l1: L1,
    l2: Option<redis::aio::ConnectionManager>,
    source_id: String,
    invalidation_channel: String,
    l2_ttl_seconds: u64,
}

impl Cache {
    pub async fn connect(
        redis_url: &str,
        l1_capacity: usize,
        l1_ttl: Duration,
        l2_ttl_seconds: u64,
        invalidation_channel: String,
        allow_degraded: bool,
    ) -> Self {
        let source_id = Uuid::new_v4().to_string();
        let l2 = match redis::Client::open(redis_url) {
            Ok(client) => match client.get_connection_manager().await {
                Ok(conn) => Some(conn),
                Err(e) => {
                    warn!(error = %e, "redis L2 unavailable, running L1-only");
                    if !allow_degraded {
                        panic!("redis L2 required but unavailable: {e}");
                    }
                    None
                }
            },
            Err(e) => {
                warn!(error = %e, "invalid redis url, running L1-only");
                None
            }
        };

        Cache {
            l1: L1::new(l1_capacity, l1_ttl),
            l2,
            source_id,
            invalidation_channel,
            l2_ttl_seconds,
        }
    }

    pub fn l1_only(l1_capacity: usize, l1_ttl: Duration) -> Self {
        Cache {
            l1: L1::new(l1_capacity, l1_ttl),
            l2: None,
            source_id: Uuid::new_v4().to_string(),
            invalidation_channel: "prompt-cache-invalidation".to_string(),
            l2_ttl_seconds: 3600,
        }
    }

    /// Spawns the background subscriber that invalidates L1 on messages
    /// from other processes. No-op if L2 is not configured.
    pub fn spawn_invalidation_listener(self: &Arc<Self>, redis_url: &str) -> Option<tokio::task::JoinHandle<()>> {
        if self.l2.is_none() {
            return None;
        }
        let url = redis_url.to_string();
        let channel = self.invalidation_channel.clone();
        let this = Arc::clone(self);
        Some(tokio::spawn(async move {
            loop {
                match redis::Client::open(url.as_str()) {
                    Ok(client) => match client.get_async_pubsub().await {
                        Ok(mut pubsub) => {
                            if pubsub.subscribe(&channel).await.is_err() {
                                tokio::time::sleep(Duration::from_secs(2)).await;
                                continue;
                            }
                            let mut stream = pubsub.on_message();
                            while let Some(msg) = futures_util::StreamExt::next(&mut stream).await
                            {
                                let payload: String = match msg.get_payload() {
                                    Ok(p) => p,
                                    Err(_) => continue,
                                };
                                let Ok(parsed) =
                                    serde_json::from_str::<InvalidationMessage>(&payload)
                                else {
                                    continue;
                                };
                                if parsed.source_id == this.source_id {
                                    continue; // ignore self-broadcast
                                }
                                match parsed.action {
                                    InvalidationAction::Clear => this.l1.clear(),
                                    InvalidationAction::Set | InvalidationAction::Delete => {
                                        if let Some(key) = parsed.key {
                                            this.l1.invalidate(&key);
                                        }
                                    }
                                }
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "failed to open redis pubsub, retrying");
                        }
                    },
                    Err(e) => warn!(error = %e, "failed to open redis client for pubsub"),
                }
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        }))
    }

    pub async fn get(&self, key: &str) -> Option<Vec<u8>> {
        if let Some(v) = self.l1.get(key) {
            return Some(v);
        }
        let Some(l2) = &self.l2 else {
            return None;
        };
        let mut conn = l2.clone();
        match conn.get::<_, Option<Vec<u8>>>(key).await {
            Ok(Some(value)) => {
                self.l1.put(key.to_string(), value.clone());
                Some(value)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "L2 read failed, degraded mode");
                None
            }
        }
    }

    pub async fn insert(&self, key: &str, value: Vec<u8>) {
        if let Some(l2) = &self.l2 {
            let mut conn = l2.clone();
            let result: redis::RedisResult<()> = conn
                .set_ex(key, value.as_slice(), self.l2_ttl_seconds)
                .await;
            if let Err(e) = result {
                warn!(error = %e, "L2 write failed, proceeding L1-only (degraded)");
            } else {
                self.publish(InvalidationAction::Set, Some(key.to_string()))
                    .await;
            }
        }
        self.l1.put(key.to_string(), value);
    }

    pub async fn invalidate(&self, key: &str) {
        self.l1.invalidate(key);
        if let Some(l2) = &self.l2 {
            let mut conn = l2.clone();
            let _: redis::RedisResult<()> = conn.del(key).await;
            self.publish(InvalidationAction::Delete, Some(key.to_string()))
                .await;
        }
    }

    /// Removes all keys with prefix `"prompt:{name}:"` from L1, and attempts
    /// a best-effort scan-and-delete against L2. Gaps left by a truncated
    /// scan are accepted and closed by TTL rather than retried.
    pub async fn invalidate_pattern(&self, name: &str) {
        let prefix = format!("prompt:{name}:");
        self.l1.invalidate_pattern(&prefix);
        if let Some(l2) = &self.l2 {
            let mut conn = l2.clone();
            let pattern = format!("{prefix}*");
            let keys: redis::RedisResult<Vec<String>> = conn.keys(&pattern).await;
            if let Ok(keys) = keys {
                for key in keys.into_iter().take(10_000) {
                    let _: redis::RedisResult<()> = conn.del(&key).await;
                }
            }
        }
        self.publish(InvalidationAction::Clear, None).await;
    }

    async fn publish(&self, action: InvalidationAction, key: Option<String>) {
        let Some(l2) = &self.l2 else {
            return;
        };
        let message = InvalidationMessage {
            source_id: self.source_id.clone(),
            action,
            key,
            timestamp: chrono::Utc::now().timestamp_millis(),
        };
        let Ok(payload) = serde_json::to_string(&message) else {
            return;
        };
        let mut conn = l2.clone();
        let result: redis::RedisResult<i64> =
            conn.publish(&self.invalidation_channel, payload).await;
        if let Err(e) = result {
            debug!(error = %e, "invalidation publish failed (degraded)");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_key_formula_matches_spec() {
        assert_eq!(cache_key("greet", "latest"), "prompt:greet:vlatest");
        assert_eq!(cache_key("greet", "1.1"), "prompt:greet:v1.1");
    }

    #[tokio::test]
    async fn l1_only_cache_round_trips() {
        let cache = Cache::l1_only(16, Duration::from_secs(60));
        let key = cache_key("greet", "latest");
        assert!(cache.get(&key).await.is_none());
        cache.insert(&key, b"hello".to_vec()).await;
        assert_eq!(cache.get(&key).await, Some(b"hello".to_vec()));
        cache.invalidate(&key).await;
        assert!(cache.get(&key).await.is_none());
    }

    #[tokio::test]
    async fn l1_ttl_expires_entries() {
        let cache = Cache::l1_only(16, Duration::from_millis(10));
        let key = cache_key("greet", "latest");
        cache.insert(&key, b"hello".to_vec()).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(cache.get(&key).await.is_none());
    }

    #[tokio::test]
    async fn pattern_invalidation_clears_matching_l1_keys() {
        let cache = Cache::l1_only(16, Duration::from_secs(60));
        cache
            .insert(&cache_key("greet", "1.0"), b"a".to_vec())
            .await;
        cache
            .insert(&cache_key("greet", "latest"), b"b".to_vec())
            .await;
        cache
            .insert(&cache_key("other", "latest"), b"c".to_vec())
            .await;
        cache.invalidate_pattern("greet").await;
        assert!(cache.get(&cache_key("greet", "1.0")).await.is_none());
        assert!(cache.get(&cache_key("greet", "latest")).await.is_none());
        assert!(cache.get(&cache_key("other", "latest")).await.is_some());
    }
}

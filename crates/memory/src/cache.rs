//! Two-tier cache: a bounded in-process TTL map in front of an external
//! key-value store.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::store::StoreError;

/// Bounded map whose entries expire. At capacity the entry closest to expiry
/// is evicted first.
pub struct TtlCache {
    capacity: usize,
    ttl: Duration,
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl TtlCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let mut entries = self.entries.lock();
        let now = Instant::now();
        let expired = match entries.get(key) {
            Some((value, expires_at)) if *expires_at > now => return Some(value.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.remove(key);
        }
        None
    }

    pub fn insert(&self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let now = Instant::now();
        let mut entries = self.entries.lock();
        entries.retain(|_, (_, expires_at)| *expires_at > now);

        if entries.len() >= self.capacity && !entries.contains_key(&key) {
            let oldest = entries
                .iter()
                .min_by_key(|(_, (_, expires_at))| *expires_at)
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                entries.remove(&oldest);
            }
        }
        entries.insert(key, (value.into(), now + self.ttl));
    }

    pub fn remove(&self, key: &str) {
        self.entries.lock().remove(key);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// External tier, typically a shared key-value service.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// Process-local stand-in for the external tier.
pub struct InMemoryKeyValueStore {
    inner: TtlCache,
}

impl InMemoryKeyValueStore {
    pub fn new() -> Self {
        Self {
            inner: TtlCache::new(usize::MAX, Duration::from_secs(u32::MAX as u64)),
        }
    }
}

impl Default for InMemoryKeyValueStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyValueStore for InMemoryKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.inner.get(key))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let now = Instant::now();
        self.inner
            .entries
            .lock()
            .insert(key.to_string(), (value.to_string(), now + ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.inner.remove(key);
        Ok(())
    }
}

/// Reads check the local tier, then fall through to the external tier and
/// back-fill locally. External failures degrade to a miss.
pub struct TwoTierCache {
    local: TtlCache,
    remote: Option<Box<dyn KeyValueStore>>,
    ttl: Duration,
}

impl TwoTierCache {
    pub fn new(capacity: usize, ttl: Duration, remote: Option<Box<dyn KeyValueStore>>) -> Self {
        Self {
            local: TtlCache::new(capacity, ttl),
            remote,
            ttl,
        }
    }

    pub fn local_only(capacity: usize, ttl: Duration) -> Self {
        Self::new(capacity, ttl, None)
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        if let Some(value) = self.local.get(key) {
            return Some(value);
        }
        let remote = self.remote.as_ref()?;
        match remote.get(key).await {
            Ok(Some(value)) => {
                debug!("Cache back-fill for {}", key);
                self.local.insert(key, value.clone());
                Some(value)
            }
            Ok(None) => None,
            Err(e) => {
                warn!("External cache read failed for {}: {}", key, e);
                None
            }
        }
    }

    pub async fn set(&self, key: &str, value: &str) {
        self.local.insert(key, value);
        if let Some(remote) = &self.remote {
            if let Err(e) = remote.set(key, value, self.ttl).await {
                warn!("External cache write failed for {}: {}", key, e);
            }
        }
    }

    pub async fn invalidate(&self, key: &str) {
        self.local.remove(key);
        if let Some(remote) = &self.remote {
            if let Err(e) = remote.delete(key).await {
                warn!("External cache delete failed for {}: {}", key, e);
            }
        }
    }

    pub async fn get_json<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.get(key).await?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Discarding undecodable cache entry {}: {}", key, e);
                None
            }
        }
    }

    pub async fn set_json<T: serde::Serialize>(&self, key: &str, value: &T) {
        match serde_json::to_string(value) {
            Ok(raw) => self.set(key, &raw).await,
            Err(e) => warn!("Could not encode cache entry {}: {}", key, e),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_ttl_cache_evicts_at_capacity() {
        let cache = TtlCache::new(2, Duration::from_secs(60));
        cache.insert("a", "1");
        std::thread::sleep(Duration::from_millis(2));
        cache.insert("b", "2");
        cache.insert("c", "3");
        assert_eq!(cache.len(), 2);
        assert!(cache.get("a").is_none());
        assert_eq!(cache.get("c").as_deref(), Some("3"));
    }

    #[test]
    fn test_ttl_cache_expiry() {
        let cache = TtlCache::new(4, Duration::from_millis(5));
        cache.insert("a", "1");
        std::thread::sleep(Duration::from_millis(20));
        assert!(cache.get("a").is_none());
        assert!(cache.is_empty());
    }

    struct SharedStore(Arc<InMemoryKeyValueStore>);

    #[async_trait]
    impl KeyValueStore for SharedStore {
        async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
            self.0.get(key).await
        }
        async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
            self.0.set(key, value, ttl).await
        }
        async fn delete(&self, key: &str) -> Result<(), StoreError> {
            self.0.delete(key).await
        }
    }

    #[tokio::test]
    async fn test_two_tier_falls_through_and_backfills() {
        let external = Arc::new(InMemoryKeyValueStore::new());
        external
            .set("tools:github", "[]", Duration::from_secs(60))
            .await
            .unwrap();

        let cache = TwoTierCache::new(
            8,
            Duration::from_secs(60),
            Some(Box::new(SharedStore(external.clone()))),
        );
        assert_eq!(cache.get("tools:github").await.as_deref(), Some("[]"));

        external.delete("tools:github").await.unwrap();
        assert_eq!(cache.get("tools:github").await.as_deref(), Some("[]"));

        cache.invalidate("tools:github").await;
        assert!(cache.get("tools:github").await.is_none());
    }

    #[tokio::test]
    async fn test_json_helpers() {
        let cache = TwoTierCache::local_only(4, Duration::from_secs(60));
        cache.set_json("k", &vec![1, 2, 3]).await;
        let back: Vec<i32> = cache.get_json("k").await.unwrap();
        assert_eq!(back, vec![1, 2, 3]);
    }
}

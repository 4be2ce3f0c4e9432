// src/cache/memory.rs
use super::{CacheEntry, CacheError, CacheMetrics, CacheStore, CachedResponse};
use crate::metrics::MetricsSink;
use async_trait::async_trait;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

/// Bounded in-process cache with strict LRU eviction.
///
/// A `get` refreshes recency, so does a `set` on an existing key. The LRU
/// list orders entries by last access, which also breaks ties between
/// entries inserted back to back.
pub struct MemoryCache {
    entries: Mutex<LruCache<String, CacheEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
    items: AtomicU64,
    metrics: Arc<dyn MetricsSink>,
}

impl MemoryCache {
    pub fn new(capacity: usize, metrics: Arc<dyn MetricsSink>) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            items: AtomicU64::new(0),
            metrics,
        }
    }

    pub async fn capacity(&self) -> usize {
        self.entries.lock().await.cap().get()
    }

    fn publish_len(&self, len: usize) {
        self.items.store(len as u64, Ordering::Relaxed);
        self.metrics.set_cache_items(len as u64);
    }

    fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        self.metrics.record_cache_miss();
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        let mut entries = self.entries.lock().await;

        let lookup = entries
            .get(key)
            .map(|entry| entry.is_valid().then(|| entry.clone()));

        match lookup {
            None => {
                drop(entries);
                self.miss();
                debug!("Cache MISS for key: {}", key);
                Ok(None)
            }
            Some(Some(entry)) => {
                drop(entries);
                self.hits.fetch_add(1, Ordering::Relaxed);
                self.metrics.record_cache_hit();
                debug!("Cache HIT for key: {}", key);
                Ok(Some(entry))
            }
            Some(None) => {
                entries.pop(key);
                self.publish_len(entries.len());
                drop(entries);
                self.miss();
                debug!("Cache MISS (expired) for key: {}", key);
                Ok(None)
            }
        }
    }

    async fn set(
        &self,
        key: &str,
        value: CachedResponse,
        headers: Vec<(String, String)>,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let entry = CacheEntry::new(value, headers, ttl);
        let mut entries = self.entries.lock().await;

        // `push` hands back either the replaced value for `key` or the
        // evicted least-recently-used pair.
        if let Some((evicted, _)) = entries.push(key.to_string(), entry) {
            if evicted != key {
                debug!("Evicted LRU cache entry: {}", evicted);
            }
        }
        self.publish_len(entries.len());

        debug!("Cache SET for key: {}, TTL: {:?}", key, ttl);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut entries = self.entries.lock().await;
        if entries.pop(key).is_some() {
            self.publish_len(entries.len());
            debug!("Removed cache entry: {}", key);
        }
        Ok(())
    }

    async fn clear(&self) -> Result<(), CacheError> {
        let mut entries = self.entries.lock().await;
        entries.clear();
        self.publish_len(0);
        Ok(())
    }

    fn metrics(&self) -> CacheMetrics {
        CacheMetrics {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            items: self.items.load(Ordering::Relaxed),
        }
    }

    fn kind(&self) -> &'static str {
        "memory"
    }
}

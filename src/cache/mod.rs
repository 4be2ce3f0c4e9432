// src/cache/mod.rs
//! Response cache shared by the dispatch pipeline.
//!
//! Two stores implement [`CacheStore`]: [`MemoryCache`], a bounded in-process
//! LRU, and [`RedisCache`], which lets several edge nodes share one cache.

mod memory;
mod remote;

pub use memory::MemoryCache;
pub use remote::RedisCache;

use crate::config::{CacheConfig, CacheKind};
use crate::metrics::MetricsSink;
use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// The cached part of an upstream response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedResponse {
    pub status: u16,
    pub body: Bytes,
}

impl CachedResponse {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub value: CachedResponse,
    /// Response headers in upstream order.
    pub headers: Vec<(String, String)>,
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(value: CachedResponse, headers: Vec<(String, String)>, ttl: Duration) -> Self {
        Self {
            value,
            headers,
            expires_at: expiry_after(ttl),
        }
    }

    /// An entry is usable strictly before its expiration.
    pub fn is_valid(&self) -> bool {
        Utc::now() < self.expires_at
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

fn expiry_after(ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| Utc::now().checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Point-in-time counters. `hits` and `misses` only grow; `items` follows
/// the live size.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub items: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache backend error: {0}")]
    Backend(#[from] redis::RedisError),

    #[error("corrupt cache record for key {key}: {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode cache record: {0}")]
    Encode(#[source] serde_json::Error),
}

#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Live entry for `key`, or `None`. Expired entries are dropped here.
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError>;

    /// Insert or replace `key`, expiring `ttl` from now.
    async fn set(
        &self,
        key: &str,
        value: CachedResponse,
        headers: Vec<(String, String)>,
        ttl: Duration,
    ) -> Result<(), CacheError>;

    /// Remove `key`; removing an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    /// Drop every entry and reset the item count.
    async fn clear(&self) -> Result<(), CacheError>;

    fn metrics(&self) -> CacheMetrics;

    fn kind(&self) -> &'static str;
}

pub async fn create_cache(
    config: &CacheConfig,
    metrics: Arc<dyn MetricsSink>,
) -> Result<Arc<dyn CacheStore>> {
    match config.kind {
        CacheKind::Memory => Ok(Arc::new(MemoryCache::new(config.capacity, metrics))),
        CacheKind::Redis => {
            let cache = RedisCache::connect(
                &config.redis_url,
                config.redis_db,
                config.key_prefix.clone(),
                metrics,
            )
            .await
            .with_context(|| format!("Failed to connect to redis at {}", config.redis_url))?;
            Ok(Arc::new(cache))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_validity() {
        let live = CacheEntry::new(CachedResponse::new(200, "x"), vec![], Duration::from_secs(60));
        assert!(live.is_valid());

        let mut stale = live.clone();
        stale.expires_at = Utc::now() - chrono::Duration::seconds(1);
        assert!(!stale.is_valid());
    }

    #[test]
    fn test_huge_ttl_saturates() {
        let entry = CacheEntry::new(CachedResponse::new(200, "x"), vec![], Duration::MAX);
        assert_eq!(entry.expires_at, DateTime::<Utc>::MAX_UTC);
    }

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let entry = CacheEntry::new(
            CachedResponse::new(200, "x"),
            vec![("Content-Type".into(), "text/plain".into())],
            Duration::from_secs(1),
        );
        assert_eq!(entry.header("content-type"), Some("text/plain"));
        assert_eq!(entry.header("etag"), None);
    }
}

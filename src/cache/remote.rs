// src/cache/remote.rs
use super::{CacheEntry, CacheError, CacheMetrics, CacheStore, CachedResponse};
use crate::metrics::MetricsSink;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::IntoConnectionInfo;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Cache shared between edge nodes through a Redis database.
///
/// Each entry is one JSON record written with Redis' own expiry, so stale
/// keys disappear without help. The embedded expiration is still checked on
/// read. A record that does not decode is reported as an error, never as a
/// miss. `items` is this process's view only: keys expired by Redis itself
/// are not subtracted.
pub struct RedisCache {
    conn: ConnectionManager,
    prefix: String,
    hits: AtomicU64,
    misses: AtomicU64,
    items: AtomicU64,
    metrics: Arc<dyn MetricsSink>,
}

impl RedisCache {
    pub async fn connect(
        url: &str,
        db: i64,
        prefix: String,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self, CacheError> {
        let mut info = url.into_connection_info()?;
        info.redis.db = db;

        let client = redis::Client::open(info)?;
        let mut conn = ConnectionManager::new(client).await?;

        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        info!("Connected to redis cache at {} (db {})", url, db);

        Ok(Self {
            conn,
            prefix,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            items: AtomicU64::new(0),
            metrics,
        })
    }

    fn namespaced(&self, key: &str) -> String {
        namespaced_key(&self.prefix, key)
    }

    fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
        self.metrics.record_cache_miss();
    }

    fn decrement_items(&self) {
        let _ = self
            .items
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
        self.metrics.set_cache_items(self.items.load(Ordering::Relaxed));
    }
}

fn encode_entry(entry: &CacheEntry) -> Result<Vec<u8>, CacheError> {
    serde_json::to_vec(entry).map_err(CacheError::Encode)
}

fn decode_entry(key: &str, data: &[u8]) -> Result<CacheEntry, CacheError> {
    serde_json::from_slice(data).map_err(|source| CacheError::Decode {
        key: key.to_string(),
        source,
    })
}

/// What a `GET` reply means for the store.
#[derive(Debug, PartialEq)]
enum Record {
    Missing,
    /// Still in Redis but past its embedded expiration; must be deleted.
    Expired,
    Live(CacheEntry),
}

fn read_record(key: &str, data: Option<&[u8]>) -> Result<Record, CacheError> {
    let Some(data) = data else {
        return Ok(Record::Missing);
    };
    let entry = decode_entry(key, data)?;
    if entry.is_valid() {
        Ok(Record::Live(entry))
    } else {
        Ok(Record::Expired)
    }
}

fn namespaced_key(prefix: &str, key: &str) -> String {
    format!("{}{}", prefix, key)
}

// Redis rejects a zero expiry.
fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl CacheStore for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        let redis_key = self.namespaced(key);
        let mut conn = self.conn.clone();

        let data: Option<Vec<u8>> = redis::cmd("GET")
            .arg(&redis_key)
            .query_async(&mut conn)
            .await?;

        let entry = match read_record(key, data.as_deref())? {
            Record::Live(entry) => entry,
            Record::Missing => {
                self.miss();
                debug!("Cache MISS for key: {}", key);
                return Ok(None);
            }
            Record::Expired => {
                let removed: i64 = redis::cmd("DEL")
                    .arg(&redis_key)
                    .query_async(&mut conn)
                    .await?;
                if removed > 0 {
                    self.decrement_items();
                }
                self.miss();
                debug!("Cache MISS (expired) for key: {}", key);
                return Ok(None);
            }
        };

        self.hits.fetch_add(1, Ordering::Relaxed);
        self.metrics.record_cache_hit();
        debug!("Cache HIT for key: {}", key);
        Ok(Some(entry))
    }

    async fn set(
        &self,
        key: &str,
        value: CachedResponse,
        headers: Vec<(String, String)>,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let entry = CacheEntry::new(value, headers, ttl);
        let data = encode_entry(&entry)?;
        let redis_key = self.namespaced(key);
        let mut conn = self.conn.clone();

        let (existed,): (bool,) = redis::pipe()
            .cmd("EXISTS")
            .arg(&redis_key)
            .cmd("SET")
            .arg(&redis_key)
            .arg(data)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .ignore()
            .query_async(&mut conn)
            .await?;

        if !existed {
            let items = self.items.fetch_add(1, Ordering::Relaxed) + 1;
            self.metrics.set_cache_items(items);
        }
        debug!("Cache SET for key: {}, TTL: {:?}", key, ttl);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let removed: i64 = redis::cmd("DEL")
            .arg(self.namespaced(key))
            .query_async(&mut conn)
            .await?;
        if removed > 0 {
            self.decrement_items();
        }
        Ok(())
    }

    async fn clear(&self) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("FLUSHDB").query_async(&mut conn).await?;
        self.items.store(0, Ordering::Relaxed);
        self.metrics.set_cache_items(0);
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
        "redis"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_survives_encoding() {
        let entry = CacheEntry::new(
            CachedResponse::new(203, "cached body"),
            vec![("X-Server".into(), "origin".into())],
            Duration::from_secs(30),
        );
        let data = encode_entry(&entry).unwrap();
        let decoded = decode_entry("/k", &data).unwrap();
        assert_eq!(decoded, entry);
        assert!(decoded.is_valid());
    }

    #[test]
    fn test_corrupt_record_is_an_error() {
        let err = decode_entry("/broken", b"{not json").unwrap_err();
        match err {
            CacheError::Decode { key, .. } => assert_eq!(key, "/broken"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_read_record_classifies_replies() {
        assert_eq!(read_record("/k", None).unwrap(), Record::Missing);

        let live = CacheEntry::new(CachedResponse::new(200, "ok"), vec![], Duration::from_secs(30));
        let data = encode_entry(&live).unwrap();
        assert_eq!(read_record("/k", Some(data.as_slice())).unwrap(), Record::Live(live));

        let mut stale = CacheEntry::new(CachedResponse::new(200, "old"), vec![], Duration::from_secs(30));
        stale.expires_at = chrono::Utc::now() - chrono::Duration::seconds(1);
        let data = encode_entry(&stale).unwrap();
        assert_eq!(read_record("/k", Some(data.as_slice())).unwrap(), Record::Expired);
    }

    #[test]
    fn test_corrupt_reply_is_an_error_not_a_miss() {
        let result = read_record("/broken", Some(&b"\x00garbage"[..]));
        assert!(matches!(result, Err(CacheError::Decode { .. })));
    }

    #[test]
    fn test_keys_are_namespaced() {
        assert_eq!(namespaced_key("cdn:", "/img/a.png"), "cdn:/img/a.png");
        assert_eq!(namespaced_key("", "/a"), "/a");
    }

    #[test]
    fn test_ttl_millis_never_zero() {
        assert_eq!(ttl_millis(Duration::ZERO), 1);
        assert_eq!(ttl_millis(Duration::from_secs(2)), 2000);
        assert_eq!(ttl_millis(Duration::MAX), u64::MAX);
    }
}

// tests/redis_cache_tests.rs
//
// Needs a disposable redis server; database 15 is flushed by these tests.
// Run with: REDIS_URL=redis://127.0.0.1:6379 cargo test -- --ignored
use edge_cdn::cache::{CacheError, CacheStore, CachedResponse, RedisCache};
use edge_cdn::metrics::NoopMetrics;
use std::sync::Arc;
use std::time::Duration;

const TEST_DB: i64 = 15;

fn redis_url() -> String {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
}

async fn cache(prefix: &str) -> RedisCache {
    let cache = RedisCache::connect(
        &redis_url(),
        TEST_DB,
        prefix.to_string(),
        Arc::new(NoopMetrics),
    )
    .await
    .unwrap();
    cache.clear().await.unwrap();
    cache
}

async fn raw_connection() -> redis::aio::ConnectionManager {
    let mut info = redis::IntoConnectionInfo::into_connection_info(redis_url().as_str()).unwrap();
    info.redis.db = TEST_DB;
    let client = redis::Client::open(info).unwrap();
    redis::aio::ConnectionManager::new(client).await.unwrap()
}

fn body(text: &'static str) -> CachedResponse {
    CachedResponse::new(200, text)
}

#[tokio::test]
#[ignore]
async fn test_set_get_and_namespacing() {
    let cache = cache("edge-test:").await;
    let headers = vec![("content-type".to_string(), "text/plain".to_string())];
    cache
        .set("/a", body("hello"), headers, Duration::from_secs(60))
        .await
        .unwrap();

    let entry = cache.get("/a").await.unwrap().unwrap();
    assert_eq!(entry.value.body, "hello");
    assert_eq!(entry.header("content-type"), Some("text/plain"));

    let mut conn = raw_connection().await;
    let exists: bool = redis::cmd("EXISTS")
        .arg("edge-test:/a")
        .query_async(&mut conn)
        .await
        .unwrap();
    assert!(exists);
    let ttl_ms: i64 = redis::cmd("PTTL")
        .arg("edge-test:/a")
        .query_async(&mut conn)
        .await
        .unwrap();
    assert!(ttl_ms > 0 && ttl_ms <= 60_000);

    let metrics = cache.metrics();
    assert_eq!((metrics.hits, metrics.items), (1, 1));
}

#[tokio::test]
#[ignore]
async fn test_item_count_follows_writes_and_deletes() {
    let cache = cache("edge-test:").await;
    cache.set("/a", body("1"), vec![], Duration::from_secs(60)).await.unwrap();
    cache.set("/b", body("2"), vec![], Duration::from_secs(60)).await.unwrap();
    cache.set("/a", body("3"), vec![], Duration::from_secs(60)).await.unwrap();
    assert_eq!(cache.metrics().items, 2);

    cache.delete("/a").await.unwrap();
    cache.delete("/never-set").await.unwrap();
    assert_eq!(cache.metrics().items, 1);
    assert!(cache.get("/a").await.unwrap().is_none());

    cache.clear().await.unwrap();
    assert_eq!(cache.metrics().items, 0);
    assert!(cache.get("/b").await.unwrap().is_none());
}

#[tokio::test]
#[ignore]
async fn test_expired_record_is_deleted_on_read() {
    let cache = cache("edge-test:").await;
    cache.set("/old", body("stale"), vec![], Duration::from_secs(60)).await.unwrap();

    // Rewrite the record with a past expiration while redis still holds it.
    let mut entry = cache.get("/old").await.unwrap().unwrap();
    entry.expires_at = chrono::Utc::now() - chrono::Duration::seconds(5);
    let mut conn = raw_connection().await;
    let _: () = redis::cmd("SET")
        .arg("edge-test:/old")
        .arg(serde_json::to_vec(&entry).unwrap())
        .arg("PX")
        .arg(60_000)
        .query_async(&mut conn)
        .await
        .unwrap();

    assert!(cache.get("/old").await.unwrap().is_none());
    let exists: bool = redis::cmd("EXISTS")
        .arg("edge-test:/old")
        .query_async(&mut conn)
        .await
        .unwrap();
    assert!(!exists);
    assert_eq!(cache.metrics().items, 0);
}

#[tokio::test]
#[ignore]
async fn test_corrupt_record_is_an_error() {
    let cache = cache("edge-test:").await;
    let mut conn = raw_connection().await;
    let _: () = redis::cmd("SET")
        .arg("edge-test:/broken")
        .arg("{not json")
        .query_async(&mut conn)
        .await
        .unwrap();

    let result = cache.get("/broken").await;
    assert!(matches!(result, Err(CacheError::Decode { .. })));
    assert_eq!(cache.metrics().misses, 0);
}

#[tokio::test]
#[ignore]
async fn test_redis_expiry_removes_entry() {
    let cache = cache("edge-test:").await;
    cache.set("/short", body("x"), vec![], Duration::from_millis(20)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(cache.get("/short").await.unwrap().is_none());
}

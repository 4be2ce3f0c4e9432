// src/proxy/backend.rs
use chrono::{DateTime, Utc};
use hyper::http::uri::{InvalidUri, PathAndQuery};
use hyper::Uri;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use tokio::sync::RwLock;
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Alive,
    Dead,
}

/// Outcome of folding one probe result into a backend's health.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthTransition {
    pub before: HealthStatus,
    pub after: HealthStatus,
}

impl HealthTransition {
    pub fn changed(&self) -> bool {
        self.before != self.after
    }
}

#[derive(Debug)]
pub struct Backend {
    pub id: String,
    pub url: Url,
    pub weight: u32,

    // Selection state, owned by the load balancer
    active_connections: AtomicUsize,
    total_requests: AtomicU64,

    // Health state, owned by the health checker
    alive: AtomicBool,
    consecutive_failures: AtomicU32,
    last_health_check: RwLock<Option<DateTime<Utc>>>,
}

impl Backend {
    pub fn new(url: Url, weight: u32) -> Self {
        let id = format!(
            "{}:{}",
            url.host_str().unwrap_or("unknown"),
            url.port_or_known_default().unwrap_or(80)
        );
        Self::with_id(id, url, weight)
    }

    pub(crate) fn with_id(id: String, url: Url, weight: u32) -> Self {
        Self {
            id,
            url,
            weight,
            active_connections: AtomicUsize::new(0),
            total_requests: AtomicU64::new(0),
            alive: AtomicBool::new(true),
            consecutive_failures: AtomicU32::new(0),
            last_health_check: RwLock::new(None),
        }
    }

    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    pub(crate) fn increment_connections(&self) -> usize {
        self.active_connections.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn decrement_connections(&self) -> usize {
        match self
            .active_connections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        {
            Ok(previous) => previous - 1,
            Err(_) => 0,
        }
    }

    /// Times this backend was handed out by the load balancer.
    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub(crate) fn record_selection(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn status(&self) -> HealthStatus {
        if self.is_alive() {
            HealthStatus::Alive
        } else {
            HealthStatus::Dead
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    pub async fn last_health_check(&self) -> Option<DateTime<Utc>> {
        *self.last_health_check.read().await
    }

    /// Fold one probe outcome into the health state.
    ///
    /// A success revives the backend and clears the failure streak. A
    /// failure extends the streak and marks the backend dead once the streak
    /// reaches `max_failures`.
    pub async fn record_probe(&self, healthy: bool, max_failures: u32) -> HealthTransition {
        // Holding the timestamp lock serialises concurrent probes of this backend.
        let mut last_check = self.last_health_check.write().await;
        let before = self.status();

        if healthy {
            self.consecutive_failures.store(0, Ordering::Relaxed);
            self.alive.store(true, Ordering::Release);
        } else {
            let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
            if failures >= max_failures.max(1) {
                self.alive.store(false, Ordering::Release);
            }
        }

        *last_check = Some(Utc::now());
        HealthTransition {
            before,
            after: self.status(),
        }
    }

    pub fn mark_alive(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.alive.store(true, Ordering::Release);
    }

    pub fn mark_dead(&self) {
        self.alive.store(false, Ordering::Release);
    }

    pub(crate) fn reset_selection_state(&self) {
        self.active_connections.store(0, Ordering::SeqCst);
    }

    /// Upstream URI for a client request target.
    pub fn upstream_uri(&self, path_and_query: Option<&PathAndQuery>) -> Result<Uri, InvalidUri> {
        let base = self.url.as_str().trim_end_matches('/');
        let target = path_and_query.map(|pq| pq.as_str()).unwrap_or("/");
        format!("{}{}", base, target).parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(url: &str) -> Backend {
        Backend::new(Url::parse(url).unwrap(), 1)
    }

    #[test]
    fn test_id_uses_known_default_port() {
        assert_eq!(backend("http://origin.local").id, "origin.local:80");
        assert_eq!(backend("https://origin.local").id, "origin.local:443");
        assert_eq!(backend("http://10.0.0.1:9000").id, "10.0.0.1:9000");
    }

    #[tokio::test]
    async fn test_single_failure_kills_then_success_revives() {
        let b = backend("http://10.0.0.1:9000");
        assert!(b.is_alive());

        let t = b.record_probe(false, 1).await;
        assert!(t.changed());
        assert_eq!(t.after, HealthStatus::Dead);
        assert_eq!(b.consecutive_failures(), 1);
        assert!(b.last_health_check().await.is_some());

        let t = b.record_probe(true, 1).await;
        assert_eq!(t.after, HealthStatus::Alive);
        assert_eq!(b.consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn test_failure_threshold() {
        let b = backend("http://10.0.0.1:9000");
        assert!(!b.record_probe(false, 3).await.changed());
        assert!(!b.record_probe(false, 3).await.changed());
        assert!(b.is_alive());
        assert_eq!(b.record_probe(false, 3).await.after, HealthStatus::Dead);
    }

    #[test]
    fn test_connection_counter_never_underflows() {
        let b = backend("http://10.0.0.1:9000");
        assert_eq!(b.increment_connections(), 1);
        assert_eq!(b.decrement_connections(), 0);
        assert_eq!(b.decrement_connections(), 0);
        assert_eq!(b.active_connections(), 0);
    }

    #[test]
    fn test_upstream_uri_keeps_path_and_query() {
        let b = backend("http://10.0.0.1:9000/");
        let pq: PathAndQuery = "/files/a.png?size=small".parse().unwrap();
        let uri = b.upstream_uri(Some(&pq)).unwrap();
        assert_eq!(uri.to_string(), "http://10.0.0.1:9000/files/a.png?size=small");

        let uri = b.upstream_uri(None).unwrap();
        assert_eq!(uri.to_string(), "http://10.0.0.1:9000/");
    }
}

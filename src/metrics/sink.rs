// src/metrics/sink.rs
use std::time::Duration;

/// Observer for everything the edge node counts.
///
/// Built once at startup and handed to the cache, the balancer, the health
/// checker and the dispatch pipeline. Every method defaults to a no-op so
/// partial sinks (and test doubles) only implement what they care about.
pub trait MetricsSink: Send + Sync {
    /// One client-facing response, whatever produced it.
    fn record_request(
        &self,
        _method: &str,
        _status_code: u16,
        _backend: &str,
        _duration: Duration,
        _response_bytes: usize,
    ) {
    }

    fn record_request_size(&self, _method: &str, _bytes: usize) {}

    /// One upstream exchange that produced a response.
    fn record_backend_request(&self, _backend: &str, _success: bool, _duration: Duration) {}

    /// An upstream exchange that produced no response at all.
    fn record_backend_error(&self, _backend: &str, _error_type: &str) {}

    fn record_cache_hit(&self) {}

    fn record_cache_miss(&self) {}

    fn record_cache_error(&self, _operation: &str) {}

    fn set_cache_items(&self, _items: u64) {}

    fn record_selection(&self, _strategy: &str, _backend: Option<&str>) {}

    fn set_backend_connections(&self, _backend: &str, _count: usize) {}

    fn set_backend_health(&self, _backend: &str, _alive: bool) {}

    fn set_active_backends(&self, _alive: usize, _total: usize) {}

    fn record_rate_limited(&self) {}
}

/// Sink that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {}

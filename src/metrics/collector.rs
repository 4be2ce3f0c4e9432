// src/metrics/collector.rs
use super::MetricsSink;
use anyhow::Result;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub struct MetricsRegistry {
    registry: Registry,
    collector: Arc<MetricsCollector>,
}

impl MetricsRegistry {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let collector = Arc::new(MetricsCollector::new(&registry)?);

        Ok(Self {
            registry,
            collector,
        })
    }

    pub fn collector(&self) -> Arc<MetricsCollector> {
        self.collector.clone()
    }

    /// Render every registered family in the Prometheus text format.
    pub fn gather(&self) -> Result<Vec<u8>> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(buffer)
    }

    pub fn content_type(&self) -> String {
        TextEncoder::new().format_type().to_string()
    }
}

pub struct MetricsCollector {
    // Request metrics
    pub requests_total: IntCounterVec,
    pub request_duration_seconds: HistogramVec,
    pub request_size_bytes: HistogramVec,
    pub response_size_bytes: HistogramVec,
    pub rate_limited_total: IntCounter,

    // Cache metrics
    pub cache_hits_total: IntCounter,
    pub cache_misses_total: IntCounter,
    pub cache_errors_total: IntCounterVec,
    pub cache_items: IntGauge,

    // Backend metrics
    pub backend_requests_total: IntCounterVec,
    pub backend_latency_seconds: HistogramVec,
    pub backend_errors_total: IntCounterVec,
    pub backend_selections_total: IntCounterVec,
    pub backend_connections_active: IntGaugeVec,
    pub backend_health_status: IntGaugeVec,

    // Pool metrics
    pub active_backends: IntGauge,
    pub total_backends: IntGauge,
}

impl MetricsCollector {
    pub fn new(registry: &Registry) -> Result<Self> {
        // Request metrics
        let requests_total = IntCounterVec::new(
            Opts::new("cdn_http_requests_total", "Total number of HTTP requests"),
            &["method", "status_code", "backend"],
        )?;
        registry.register(Box::new(requests_total.clone()))?;

        let request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "cdn_http_request_duration_seconds",
                "HTTP request duration in seconds",
            ),
            &["method", "status_code"],
        )?;
        registry.register(Box::new(request_duration_seconds.clone()))?;

        let request_size_bytes = HistogramVec::new(
            HistogramOpts::new("cdn_http_request_size_bytes", "Request body size in bytes")
                .buckets(vec![100.0, 1_000.0, 10_000.0, 100_000.0, 1_000_000.0]),
            &["method"],
        )?;
        registry.register(Box::new(request_size_bytes.clone()))?;

        let response_size_bytes = HistogramVec::new(
            HistogramOpts::new("cdn_http_response_size_bytes", "Response body size in bytes")
                .buckets(vec![100.0, 1_000.0, 10_000.0, 100_000.0, 1_000_000.0]),
            &["method", "status_code"],
        )?;
        registry.register(Box::new(response_size_bytes.clone()))?;

        let rate_limited_total = IntCounter::new(
            "cdn_rate_limit_exceeded_total",
            "Requests rejected by the per-client rate limiter",
        )?;
        registry.register(Box::new(rate_limited_total.clone()))?;

        // Cache metrics
        let cache_hits_total = IntCounter::new("cdn_cache_hits_total", "Cache hits")?;
        registry.register(Box::new(cache_hits_total.clone()))?;

        let cache_misses_total = IntCounter::new("cdn_cache_misses_total", "Cache misses")?;
        registry.register(Box::new(cache_misses_total.clone()))?;

        let cache_errors_total = IntCounterVec::new(
            Opts::new("cdn_cache_errors_total", "Cache operations that failed"),
            &["operation"],
        )?;
        registry.register(Box::new(cache_errors_total.clone()))?;

        let cache_items = IntGauge::new("cdn_cache_items", "Entries currently cached")?;
        registry.register(Box::new(cache_items.clone()))?;

        // Backend metrics
        let backend_requests_total = IntCounterVec::new(
            Opts::new("cdn_backend_requests_total", "Total backend requests"),
            &["backend", "status"],
        )?;
        registry.register(Box::new(backend_requests_total.clone()))?;

        let backend_latency_seconds = HistogramVec::new(
            HistogramOpts::new("cdn_backend_latency_seconds", "Backend request latency")
                .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.0, 5.0]),
            &["backend"],
        )?;
        registry.register(Box::new(backend_latency_seconds.clone()))?;

        let backend_errors_total = IntCounterVec::new(
            Opts::new("cdn_backend_errors_total", "Backend requests that got no response"),
            &["backend", "error_type"],
        )?;
        registry.register(Box::new(backend_errors_total.clone()))?;

        let backend_selections_total = IntCounterVec::new(
            Opts::new(
                "cdn_lb_selections_total",
                "Load balancer selections (backend=\"none\" when nothing was alive)",
            ),
            &["strategy", "backend"],
        )?;
        registry.register(Box::new(backend_selections_total.clone()))?;

        let backend_connections_active = IntGaugeVec::new(
            Opts::new(
                "cdn_backend_connections_active",
                "In-flight requests per backend",
            ),
            &["backend"],
        )?;
        registry.register(Box::new(backend_connections_active.clone()))?;

        let backend_health_status = IntGaugeVec::new(
            Opts::new(
                "cdn_backend_health_status",
                "Backend health status (1=alive, 0=dead)",
            ),
            &["backend"],
        )?;
        registry.register(Box::new(backend_health_status.clone()))?;

        // Pool metrics
        let active_backends = IntGauge::new("cdn_active_backends", "Number of alive backends")?;
        registry.register(Box::new(active_backends.clone()))?;

        let total_backends = IntGauge::new("cdn_total_backends", "Total number of backends")?;
        registry.register(Box::new(total_backends.clone()))?;

        Ok(Self {
            requests_total,
            request_duration_seconds,
            request_size_bytes,
            response_size_bytes,
            rate_limited_total,
            cache_hits_total,
            cache_misses_total,
            cache_errors_total,
            cache_items,
            backend_requests_total,
            backend_latency_seconds,
            backend_errors_total,
            backend_selections_total,
            backend_connections_active,
            backend_health_status,
            active_backends,
            total_backends,
        })
    }
}

impl MetricsSink for MetricsCollector {
    fn record_request(
        &self,
        method: &str,
        status_code: u16,
        backend: &str,
        duration: Duration,
        response_bytes: usize,
    ) {
        let status = status_code.to_string();
        self.requests_total
            .with_label_values(&[method, &status, backend])
            .inc();

        self.request_duration_seconds
            .with_label_values(&[method, &status])
            .observe(duration.as_secs_f64());

        self.response_size_bytes
            .with_label_values(&[method, &status])
            .observe(response_bytes as f64);
    }

    fn record_request_size(&self, method: &str, bytes: usize) {
        self.request_size_bytes
            .with_label_values(&[method])
            .observe(bytes as f64);
    }

    fn record_backend_request(&self, backend: &str, success: bool, duration: Duration) {
        let status = if success { "success" } else { "failure" };
        self.backend_requests_total
            .with_label_values(&[backend, status])
            .inc();

        self.backend_latency_seconds
            .with_label_values(&[backend])
            .observe(duration.as_secs_f64());
    }

    fn record_backend_error(&self, backend: &str, error_type: &str) {
        self.backend_errors_total
            .with_label_values(&[backend, error_type])
            .inc();
    }

    fn record_cache_hit(&self) {
        self.cache_hits_total.inc();
    }

    fn record_cache_miss(&self) {
        self.cache_misses_total.inc();
    }

    fn record_cache_error(&self, operation: &str) {
        self.cache_errors_total.with_label_values(&[operation]).inc();
    }

    fn set_cache_items(&self, items: u64) {
        self.cache_items.set(items as i64);
    }

    fn record_selection(&self, strategy: &str, backend: Option<&str>) {
        self.backend_selections_total
            .with_label_values(&[strategy, backend.unwrap_or("none")])
            .inc();
    }

    fn set_backend_connections(&self, backend: &str, count: usize) {
        self.backend_connections_active
            .with_label_values(&[backend])
            .set(count as i64);
    }

    fn set_backend_health(&self, backend: &str, alive: bool) {
        let value = if alive { 1 } else { 0 };
        self.backend_health_status
            .with_label_values(&[backend])
            .set(value);
    }

    fn set_active_backends(&self, alive: usize, total: usize) {
        self.active_backends.set(alive as i64);
        self.total_backends.set(total as i64);
    }

    fn record_rate_limited(&self) {
        self.rate_limited_total.inc();
    }
}

// Helper for timing operations
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

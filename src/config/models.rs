// src/config/models.rs
use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    pub load_balancer: LoadBalancerConfig,
    #[serde(default)]
    pub health_check: HealthCheckConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.load_balancer.backends.is_empty(),
            "load_balancer.backends must list at least one backend"
        );
        for backend in &self.load_balancer.backends {
            ensure!(
                matches!(backend.url.scheme(), "http" | "https"),
                "backend {} must use http or https",
                backend.url
            );
            ensure!(
                backend.url.host_str().is_some(),
                "backend {} has no host",
                backend.url
            );
            ensure!(backend.weight >= 1, "backend {} weight must be >= 1", backend.url);
        }

        ensure!(
            self.server.read_timeout_secs > 0,
            "server.read_timeout_secs must be positive"
        );
        ensure!(
            self.server.write_timeout_secs > 0,
            "server.write_timeout_secs must be positive"
        );
        ensure!(
            self.load_balancer.upstream_timeout_secs > 0,
            "load_balancer.upstream_timeout_secs must be positive"
        );

        ensure!(self.cache.capacity > 0, "cache.capacity must be positive");
        ensure!(self.cache.ttl_secs > 0, "cache.ttl_secs must be positive");

        ensure!(
            self.rate_limit.requests_per_second > 0.0
                && self.rate_limit.requests_per_second.is_finite(),
            "rate_limit.requests_per_second must be a positive number"
        );
        ensure!(
            Duration::try_from_secs_f64(1.0 / self.rate_limit.requests_per_second)
                .map(|period| !period.is_zero())
                .unwrap_or(false),
            "rate_limit.requests_per_second {} is out of range",
            self.rate_limit.requests_per_second
        );
        ensure!(self.rate_limit.burst > 0, "rate_limit.burst must be positive");

        ensure!(self.health_check.interval_ms > 0, "health_check.interval_ms must be positive");
        ensure!(self.health_check.timeout_ms > 0, "health_check.timeout_ms must be positive");
        ensure!(
            self.health_check.max_failures >= 1,
            "health_check.max_failures must be >= 1"
        );
        ensure!(
            self.health_check.path.starts_with('/'),
            "health_check.path must start with '/'"
        );

        ensure!(
            self.server.tls_cert_file.is_some() == self.server.tls_key_file.is_some(),
            "server.tls_cert_file and server.tls_key_file must be set together"
        );

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_io_timeout_secs")]
    pub read_timeout_secs: u64,
    #[serde(default = "default_io_timeout_secs")]
    pub write_timeout_secs: u64,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    // TLS is terminated in front of the node; the paths are carried for the
    // deployment tooling that owns the certificates.
    #[serde(default)]
    pub tls_cert_file: Option<PathBuf>,
    #[serde(default)]
    pub tls_key_file: Option<PathBuf>,
}

impl ServerConfig {
    pub fn addr(&self) -> SocketAddr {
        ([0, 0, 0, 0], self.port).into()
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            read_timeout_secs: default_io_timeout_secs(),
            write_timeout_secs: default_io_timeout_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            tls_cert_file: None,
            tls_key_file: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheKind {
    Memory,
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_kind")]
    pub kind: CacheKind,
    /// Maximum number of entries held by the in-process cache.
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    #[serde(default)]
    pub redis_db: i64,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// Key on path and query instead of the path alone.
    #[serde(default)]
    pub key_includes_query: bool,
    /// Append a fingerprint of the caller's `Authorization` header to cache
    /// keys so per-user content is never shared between callers.
    #[serde(default)]
    pub vary_by_credential: bool,
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            kind: default_cache_kind(),
            capacity: default_cache_capacity(),
            ttl_secs: default_cache_ttl_secs(),
            redis_url: default_redis_url(),
            redis_db: 0,
            key_prefix: default_key_prefix(),
            key_includes_query: false,
            vary_by_credential: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancerAlgorithm {
    RoundRobin,
    WeightedRoundRobin,
    LeastConnections,
}

impl Default for LoadBalancerAlgorithm {
    fn default() -> Self {
        Self::RoundRobin
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadBalancerConfig {
    #[serde(default)]
    pub algorithm: LoadBalancerAlgorithm,
    #[serde(default = "default_upstream_timeout_secs")]
    pub upstream_timeout_secs: u64,
    pub backends: Vec<BackendConfig>,
}

impl LoadBalancerConfig {
    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub url: Url,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

impl BackendConfig {
    pub fn new(url: Url, weight: u32) -> Self {
        Self { url, weight }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    #[serde(default = "default_health_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_health_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_health_path")]
    pub path: String,
    /// Consecutive failed probes before a backend is marked dead.
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,
    /// Cooldown before a dead backend is probed again; 0 probes every tick.
    #[serde(default)]
    pub retry_timeout_ms: u64,
}

impl HealthCheckConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retry_timeout(&self) -> Duration {
        Duration::from_millis(self.retry_timeout_ms)
    }
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_health_interval_ms(),
            timeout_ms: default_health_timeout_ms(),
            path: default_health_path(),
            max_failures: default_max_failures(),
            retry_timeout_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: f64,
    #[serde(default = "default_burst")]
    pub burst: u32,
    /// Visitors not seen for this long are dropped by the cleanup sweep.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

impl RateLimitConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: default_requests_per_second(),
            burst: default_burst(),
            idle_timeout_secs: default_idle_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_metrics_path")]
    pub path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: default_metrics_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_port() -> u16 {
    8080
}

fn default_io_timeout_secs() -> u64 {
    15
}

fn default_shutdown_grace_secs() -> u64 {
    30
}

fn default_cache_kind() -> CacheKind {
    CacheKind::Memory
}

fn default_cache_capacity() -> usize {
    1000
}

fn default_cache_ttl_secs() -> u64 {
    3600
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_key_prefix() -> String {
    "cdn:".to_string()
}

fn default_upstream_timeout_secs() -> u64 {
    10
}

fn default_weight() -> u32 {
    1
}

fn default_health_interval_ms() -> u64 {
    1000
}

fn default_health_timeout_ms() -> u64 {
    1000
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_max_failures() -> u32 {
    1
}

// 100 requests per minute per client.
fn default_requests_per_second() -> f64 {
    100.0 / 60.0
}

fn default_burst() -> u32 {
    100
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_true() -> bool {
    true
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

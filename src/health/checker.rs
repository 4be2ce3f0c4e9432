// src/health/checker.rs
use crate::config::HealthCheckConfig;
use crate::metrics::MetricsSink;
use crate::proxy::{Backend, BackendPool, HealthStatus};
use anyhow::Result;
use reqwest::Client;
use std::sync::Arc;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

pub struct HealthChecker {
    config: HealthCheckConfig,
    pool: Arc<BackendPool>,
    client: Client,
    metrics: Arc<dyn MetricsSink>,
    shutdown_tx: tokio::sync::watch::Sender<bool>,
    shutdown_rx: tokio::sync::watch::Receiver<bool>,
}

#[derive(Debug)]
pub struct HealthCheckResult {
    pub backend_id: String,
    pub status: HealthStatus,
    /// False when the probe was skipped because the backend is cooling down.
    pub probed: bool,
    pub response_time_ms: u64,
    pub error: Option<String>,
}

impl HealthChecker {
    pub fn new(
        config: HealthCheckConfig,
        pool: Arc<BackendPool>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self> {
        let client = Client::builder().timeout(config.timeout()).build()?;

        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

        Ok(Self {
            config,
            pool,
            client,
            metrics,
            shutdown_tx,
            shutdown_rx,
        })
    }

    pub fn pool(&self) -> &Arc<BackendPool> {
        &self.pool
    }

    /// Probe every backend each interval until [`shutdown`](Self::shutdown).
    pub async fn start(self: Arc<Self>) {
        let mut interval = interval(self.config.interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut shutdown_rx = self.shutdown_rx.clone();

        info!(
            "Starting health checker with interval: {:?}",
            self.config.interval()
        );

        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            tokio::select! {
                _ = interval.tick() => {
                    self.clone().check_all_backends().await;
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Health checker shutting down");
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn is_shut_down(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    /// Probe all backends concurrently and wait for every probe before
    /// publishing the pool gauges. Returns the number of alive backends.
    pub async fn check_all_backends(self: Arc<Self>) -> usize {
        let backends = self.pool.all_backends();
        let mut tasks = Vec::with_capacity(backends.len());

        for backend in backends {
            let checker = self.clone();
            tasks.push(tokio::spawn(async move {
                checker.check_backend(backend).await
            }));
        }

        let results = futures::future::join_all(tasks).await;

        let mut healthy_count = 0;
        let mut unhealthy_count = 0;

        for result in results {
            match result {
                Ok(check_result) => match check_result.status {
                    HealthStatus::Alive => {
                        healthy_count += 1;
                        debug!("Backend {} is alive", check_result.backend_id);
                    }
                    HealthStatus::Dead => {
                        unhealthy_count += 1;
                        if check_result.probed {
                            debug!(
                                "Backend {} failed its probe: {:?}",
                                check_result.backend_id, check_result.error
                            );
                        }
                    }
                },
                Err(e) => {
                    error!("Health probe task failed: {}", e);
                    unhealthy_count += 1;
                }
            }
        }

        // Count from the pool: a panicked probe leaves the backend's state as it was.
        let alive = self.pool.alive_count();
        self.metrics.set_active_backends(alive, self.pool.len());

        debug!(
            "Health check complete: {} healthy, {} unhealthy",
            healthy_count, unhealthy_count
        );
        alive
    }

    async fn check_backend(&self, backend: Arc<Backend>) -> HealthCheckResult {
        if self.cooling_down(&backend).await {
            return HealthCheckResult {
                backend_id: backend.id.clone(),
                status: backend.status(),
                probed: false,
                response_time_ms: 0,
                error: None,
            };
        }

        let start = std::time::Instant::now();
        let (healthy, error) = self.probe(&backend).await;
        let response_time_ms = start.elapsed().as_millis() as u64;

        let transition = backend
            .record_probe(healthy, self.config.max_failures)
            .await;

        self.metrics
            .set_backend_health(&backend.id, transition.after == HealthStatus::Alive);

        if transition.changed() {
            match transition.after {
                HealthStatus::Alive => info!("Backend {} is alive again", backend.id),
                HealthStatus::Dead => warn!(
                    "Backend {} marked dead after {} consecutive failures: {}",
                    backend.id,
                    backend.consecutive_failures(),
                    error.as_deref().unwrap_or("unknown error")
                ),
            }
        }

        HealthCheckResult {
            backend_id: backend.id.clone(),
            status: transition.after,
            probed: true,
            response_time_ms,
            error,
        }
    }

    async fn probe(&self, backend: &Backend) -> (bool, Option<String>) {
        let url = match backend.url.join(&self.config.path) {
            Ok(url) => url,
            Err(e) => return (false, Some(format!("invalid probe url: {}", e))),
        };

        match timeout(self.config.timeout(), self.client.get(url.as_str()).send()).await {
            Ok(Ok(response)) => {
                let status = response.status();
                if status.is_success() {
                    (true, None)
                } else {
                    (false, Some(format!("HTTP {}", status)))
                }
            }
            Ok(Err(e)) => (false, Some(e.to_string())),
            Err(_) => (false, Some("Request timeout".to_string())),
        }
    }

    // A dead backend is left alone until `retry_timeout` has passed since
    // its last probe.
    async fn cooling_down(&self, backend: &Backend) -> bool {
        let retry_timeout = self.config.retry_timeout();
        if retry_timeout.is_zero() || backend.is_alive() {
            return false;
        }
        match backend.last_health_check().await {
            Some(last) => {
                let elapsed = chrono::Utc::now().signed_duration_since(last);
                elapsed
                    .to_std()
                    .map(|elapsed| elapsed < retry_timeout)
                    .unwrap_or(false)
            }
            None => false,
        }
    }
}

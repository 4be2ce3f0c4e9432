// src/load_balancer/mod.rs
mod algorithm;
mod least_connections;
mod round_robin;
mod weighted;

pub use algorithm::{acquire, InFlight, LoadBalancer};
pub use least_connections::LeastConnectionsBalancer;
pub use round_robin::RoundRobinBalancer;
pub use weighted::WeightedRoundRobinBalancer;
pub use crate::config::LoadBalancerAlgorithm;

use crate::health::HealthChecker;
use crate::metrics::MetricsSink;
use crate::proxy::{Backend, BackendPool};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum BalancerError {
    #[error("no available backends")]
    NoAvailableBackends,

    #[error("load balancer is closed")]
    Closed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BalancerMetrics {
    pub total_requests: u64,
    pub failed_requests: u64,
    pub active_backends: usize,
    /// Successful selections per backend id, in pool order.
    pub per_backend: Vec<(String, u64)>,
}

/// State shared by every selection strategy: the pool, its health checker
/// and the request counters.
pub struct BalancerCore {
    pool: Arc<BackendPool>,
    checker: Arc<HealthChecker>,
    metrics: Arc<dyn MetricsSink>,
    total_requests: AtomicU64,
    failed_requests: AtomicU64,
    closed: AtomicBool,
    checker_task: Mutex<Option<JoinHandle<()>>>,
}

impl BalancerCore {
    pub fn new(checker: Arc<HealthChecker>, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            pool: checker.pool().clone(),
            checker,
            metrics,
            total_requests: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            checker_task: Mutex::new(None),
        }
    }

    pub fn pool(&self) -> &Arc<BackendPool> {
        &self.pool
    }

    pub fn checker(&self) -> &Arc<HealthChecker> {
        &self.checker
    }

    pub fn metrics(&self) -> &Arc<dyn MetricsSink> {
        &self.metrics
    }

    /// Spawn the background health checker. Calling it again is a no-op.
    pub fn start_health_checker(&self) {
        let mut task = self
            .checker_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if task.is_none() && !self.is_closed() {
            *task = Some(tokio::spawn(self.checker.clone().start()));
            info!("Health checker started for {} backends", self.pool.len());
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn record_outcome(&self, strategy: &str, selected: Option<&Backend>) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        match selected {
            Some(backend) => {
                backend.record_selection();
                debug!("{} selected backend {}", strategy, backend.id);
            }
            None => {
                self.failed_requests.fetch_add(1, Ordering::Relaxed);
                debug!("{} found no alive backend", strategy);
            }
        }
        self.metrics
            .record_selection(strategy, selected.map(|b| b.id.as_str()));
    }

    fn snapshot(&self) -> BalancerMetrics {
        BalancerMetrics {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            active_backends: self.pool.alive_count(),
            per_backend: self
                .pool
                .backends()
                .iter()
                .map(|b| (b.id.clone(), b.total_requests()))
                .collect(),
        }
    }

    fn stop(&self) {
        self.closed.store(true, Ordering::Release);
        self.checker.shutdown();
        let task = self
            .checker_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }
}

pub fn create_load_balancer(
    algorithm: LoadBalancerAlgorithm,
    core: BalancerCore,
) -> Arc<dyn LoadBalancer> {
    let balancer: Arc<dyn LoadBalancer> = match algorithm {
        LoadBalancerAlgorithm::RoundRobin => Arc::new(RoundRobinBalancer::new(core)),
        LoadBalancerAlgorithm::WeightedRoundRobin => {
            Arc::new(WeightedRoundRobinBalancer::new(core))
        }
        LoadBalancerAlgorithm::LeastConnections => Arc::new(LeastConnectionsBalancer::new(core)),
    };
    info!("Using {} load balancing", balancer.name());
    balancer
}

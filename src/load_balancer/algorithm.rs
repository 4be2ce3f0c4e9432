// src/load_balancer/algorithm.rs
use super::{BalancerCore, BalancerError, BalancerMetrics};
use crate::proxy::Backend;
use async_trait::async_trait;
use std::sync::Arc;

/// A backend selection strategy over the shared [`BalancerCore`].
///
/// Strategies only implement [`select`](LoadBalancer::select); the request
/// accounting, health checks and shutdown live in the provided methods so
/// every strategy reports the same way.
#[async_trait]
pub trait LoadBalancer: Send + Sync {
    fn core(&self) -> &BalancerCore;

    /// Pick one alive backend, or `None` when the whole pool is dead.
    fn select(&self) -> Option<Arc<Backend>>;

    fn name(&self) -> &'static str;

    /// Called once the request sent to `backend` has completed.
    fn release(&self, _backend: &Backend) {}

    /// Drop strategy state built up by earlier selections.
    fn reset(&self) {}

    fn next_backend(&self) -> Result<Arc<Backend>, BalancerError> {
        let core = self.core();
        if core.is_closed() {
            return Err(BalancerError::Closed);
        }

        let selected = self.select();
        core.record_outcome(self.name(), selected.as_deref());
        selected.ok_or(BalancerError::NoAvailableBackends)
    }

    /// Run one probe pass over the pool right now.
    async fn health_check(&self) -> Result<(), BalancerError> {
        let core = self.core();
        if core.is_closed() {
            return Err(BalancerError::Closed);
        }
        core.checker().clone().check_all_backends().await;
        Ok(())
    }

    fn metrics(&self) -> BalancerMetrics {
        self.core().snapshot()
    }

    /// Stop the health checker and forget selection state.
    fn close(&self) {
        self.core().stop();
        self.reset();
        tracing::info!("{} load balancer closed", self.name());
    }
}

/// A selected backend, released back to its balancer when dropped.
pub struct InFlight {
    balancer: Arc<dyn LoadBalancer>,
    backend: Arc<Backend>,
}

impl InFlight {
    pub fn backend(&self) -> &Arc<Backend> {
        &self.backend
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.balancer.release(&self.backend);
    }
}

/// Select a backend and hold it for the lifetime of the returned guard.
pub fn acquire(balancer: &Arc<dyn LoadBalancer>) -> Result<InFlight, BalancerError> {
    let backend = balancer.next_backend()?;
    Ok(InFlight {
        balancer: balancer.clone(),
        backend,
    })
}

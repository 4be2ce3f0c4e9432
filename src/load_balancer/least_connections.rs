// src/load_balancer/least_connections.rs
use super::{BalancerCore, LoadBalancer};
use crate::proxy::Backend;
use std::sync::{Arc, Mutex, PoisonError};

pub struct LeastConnectionsBalancer {
    core: BalancerCore,
    // Scan and increment happen under one lock so two concurrent picks
    // cannot both see the same minimum.
    selection: Mutex<()>,
}

impl LeastConnectionsBalancer {
    pub fn new(core: BalancerCore) -> Self {
        Self {
            core,
            selection: Mutex::new(()),
        }
    }
}

impl LoadBalancer for LeastConnectionsBalancer {
    fn core(&self) -> &BalancerCore {
        &self.core
    }

    fn select(&self) -> Option<Arc<Backend>> {
        let _guard = self.selection.lock().unwrap_or_else(PoisonError::into_inner);

        let mut best: Option<&Arc<Backend>> = None;
        for backend in self.core.pool().backends() {
            if !backend.is_alive() {
                continue;
            }
            match best {
                Some(b) if b.active_connections() <= backend.active_connections() => {}
                _ => best = Some(backend),
            }
        }

        let backend = best?.clone();
        let active = backend.increment_connections();
        self.core
            .metrics()
            .set_backend_connections(&backend.id, active);
        Some(backend)
    }

    fn name(&self) -> &'static str {
        "least_connections"
    }

    fn release(&self, backend: &Backend) {
        let active = backend.decrement_connections();
        self.core
            .metrics()
            .set_backend_connections(&backend.id, active);
    }

    fn reset(&self) {
        let _guard = self.selection.lock().unwrap_or_else(PoisonError::into_inner);
        self.core.pool().reset_selection_state();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_balancer::testing::core;
    use crate::load_balancer::{acquire, BalancerError};

    fn with_connections(lb: &LeastConnectionsBalancer, counts: &[usize]) {
        for (backend, count) in lb.core().pool().backends().iter().zip(counts) {
            for _ in 0..*count {
                backend.increment_connections();
            }
        }
    }

    #[test]
    fn test_picks_least_loaded_backend() {
        let lb = LeastConnectionsBalancer::new(core(&[1, 1, 1]));
        with_connections(&lb, &[5, 2, 8]);

        let picked = lb.next_backend().unwrap();
        assert_eq!(picked.id, lb.core().pool().backends()[1].id);
        assert_eq!(picked.active_connections(), 3);
    }

    #[test]
    fn test_ties_go_to_pool_order() {
        let lb = LeastConnectionsBalancer::new(core(&[1, 1, 1]));
        let backends = lb.core().pool().all_backends();

        assert_eq!(lb.next_backend().unwrap().id, backends[0].id);
        assert_eq!(lb.next_backend().unwrap().id, backends[1].id);
        assert_eq!(lb.next_backend().unwrap().id, backends[2].id);
        assert_eq!(lb.next_backend().unwrap().id, backends[0].id);
    }

    #[test]
    fn test_dead_backend_is_skipped_even_when_idle() {
        let lb = LeastConnectionsBalancer::new(core(&[1, 1]));
        with_connections(&lb, &[0, 4]);
        lb.core().pool().backends()[0].mark_dead();

        let picked = lb.next_backend().unwrap();
        assert_eq!(picked.id, lb.core().pool().backends()[1].id);
    }

    #[test]
    fn test_guard_releases_connection() {
        let lb: Arc<dyn LoadBalancer> = Arc::new(LeastConnectionsBalancer::new(core(&[1])));

        let in_flight = acquire(&lb).unwrap();
        assert_eq!(in_flight.backend().active_connections(), 1);
        let backend = in_flight.backend().clone();

        drop(in_flight);
        assert_eq!(backend.active_connections(), 0);
    }

    #[test]
    fn test_all_dead_fails() {
        let lb = LeastConnectionsBalancer::new(core(&[1, 1]));
        for backend in lb.core().pool().backends() {
            backend.mark_dead();
        }
        assert!(matches!(
            lb.next_backend(),
            Err(BalancerError::NoAvailableBackends)
        ));
        assert_eq!(lb.metrics().failed_requests, 1);
    }

    #[test]
    fn test_close_resets_connection_counts() {
        let lb = LeastConnectionsBalancer::new(core(&[1, 1]));
        with_connections(&lb, &[3, 1]);

        lb.close();
        for backend in lb.core().pool().backends() {
            assert_eq!(backend.active_connections(), 0);
        }
        assert!(matches!(lb.next_backend(), Err(BalancerError::Closed)));
    }
}

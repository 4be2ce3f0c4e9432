// src/load_balancer/round_robin.rs
use super::{BalancerCore, LoadBalancer};
use crate::proxy::Backend;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub struct RoundRobinBalancer {
    core: BalancerCore,
    counter: AtomicUsize,
}

impl RoundRobinBalancer {
    pub fn new(core: BalancerCore) -> Self {
        Self {
            core,
            counter: AtomicUsize::new(0),
        }
    }
}

impl LoadBalancer for RoundRobinBalancer {
    fn core(&self) -> &BalancerCore {
        &self.core
    }

    fn select(&self) -> Option<Arc<Backend>> {
        let backends = self.core.pool().backends();
        if backends.is_empty() {
            return None;
        }

        // Every attempt advances the cursor, so a dead backend's turn goes
        // to the next alive one instead of doubling up on a single backend.
        for _ in 0..backends.len() {
            let index = self.counter.fetch_add(1, Ordering::Relaxed) % backends.len();
            let backend = &backends[index];
            if backend.is_alive() {
                return Some(backend.clone());
            }
        }
        None
    }

    fn name(&self) -> &'static str {
        "round_robin"
    }

    fn reset(&self) {
        self.counter.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_balancer::testing::core;
    use crate::load_balancer::BalancerError;
    use std::collections::HashMap;

    #[test]
    fn test_even_distribution_across_alive_backends() {
        let lb = RoundRobinBalancer::new(core(&[1, 1, 1]));
        let mut counts: HashMap<String, u32> = HashMap::new();

        for _ in 0..3000 {
            let backend = lb.next_backend().unwrap();
            *counts.entry(backend.id.clone()).or_default() += 1;
        }

        assert_eq!(counts.len(), 3);
        for count in counts.values() {
            assert!((900..=1100).contains(count), "unbalanced: {:?}", counts);
        }
    }

    #[test]
    fn test_dead_backend_is_never_selected() {
        let lb = RoundRobinBalancer::new(core(&[1, 1, 1]));
        let dead = lb.core().pool().backends()[1].clone();
        dead.mark_dead();

        let mut counts: HashMap<String, u32> = HashMap::new();
        for _ in 0..3000 {
            let backend = lb.next_backend().unwrap();
            assert_ne!(backend.id, dead.id);
            *counts.entry(backend.id.clone()).or_default() += 1;
        }
        for count in counts.values() {
            assert!((1350..=1650).contains(count), "unbalanced: {:?}", counts);
        }
    }

    #[test]
    fn test_all_dead_fails_until_restored() {
        let lb = RoundRobinBalancer::new(core(&[1, 1]));
        for backend in lb.core().pool().backends() {
            backend.mark_dead();
        }

        for _ in 0..5 {
            assert!(matches!(
                lb.next_backend(),
                Err(BalancerError::NoAvailableBackends)
            ));
        }

        let revived = lb.core().pool().backends()[1].clone();
        revived.mark_alive();
        assert_eq!(lb.next_backend().unwrap().id, revived.id);
    }
}

// src/load_balancer/weighted.rs
use super::{BalancerCore, LoadBalancer};
use crate::proxy::Backend;
use std::sync::{Arc, Mutex, PoisonError};

/// Smooth weighted round-robin.
///
/// Each call adds every alive backend's weight to its current weight, picks
/// the largest and subtracts the alive total from the winner. Picks are
/// spread out instead of bunched, and over `Σweight` calls each backend is
/// chosen exactly `weight` times.
pub struct WeightedRoundRobinBalancer {
    core: BalancerCore,
    // Indexed like the pool.
    current_weights: Mutex<Vec<i64>>,
}

impl WeightedRoundRobinBalancer {
    pub fn new(core: BalancerCore) -> Self {
        let current_weights = Mutex::new(vec![0; core.pool().len()]);
        Self {
            core,
            current_weights,
        }
    }

    pub fn current_weights(&self) -> Vec<i64> {
        self.current_weights
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl LoadBalancer for WeightedRoundRobinBalancer {
    fn core(&self) -> &BalancerCore {
        &self.core
    }

    fn select(&self) -> Option<Arc<Backend>> {
        let backends = self.core.pool().backends();
        let mut current = self
            .current_weights
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let mut total = 0i64;
        let mut best: Option<usize> = None;

        for (index, backend) in backends.iter().enumerate() {
            if !backend.is_alive() {
                continue;
            }
            let weight = i64::from(backend.weight);
            current[index] += weight;
            total += weight;

            // Strictly greater, so ties go to the earlier backend.
            match best {
                Some(b) if current[b] >= current[index] => {}
                _ => best = Some(index),
            }
        }

        let winner = best?;
        current[winner] -= total;
        Some(backends[winner].clone())
    }

    fn name(&self) -> &'static str {
        "weighted_round_robin"
    }

    fn reset(&self) {
        self.current_weights
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter_mut()
            .for_each(|w| *w = 0);
    }
}

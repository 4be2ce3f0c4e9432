// src/rate_limit/limiter.rs
use crate::config::RateLimitConfig;
use dashmap::DashMap;
use governor::{DefaultDirectRateLimiter, Quota};
use std::num::NonZeroU32;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    #[error("requests_per_second must be a positive finite number in range, got {0}")]
    InvalidRate(f64),

    #[error("burst must be at least 1")]
    InvalidBurst,
}

struct Visitor {
    limiter: DefaultDirectRateLimiter,
    last_seen: Instant,
}

/// Per-client token buckets sharing one `(rate, burst)` quota.
///
/// Buckets are created on a client's first request and dropped by
/// [`evict_idle`](RateLimiter::evict_idle) once the client has been quiet
/// for `idle_timeout`.
pub struct RateLimiter {
    quota: Quota,
    idle_timeout: Duration,
    visitors: DashMap<String, Visitor>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Result<Self, RateLimitError> {
        let rate = config.requests_per_second;
        if !(rate.is_finite() && rate > 0.0) {
            return Err(RateLimitError::InvalidRate(rate));
        }
        let burst = NonZeroU32::new(config.burst).ok_or(RateLimitError::InvalidBurst)?;

        // One token every 1/rate seconds. A rate so low that the period
        // overflows, or so high that it rounds to zero, is rejected.
        let period = Duration::try_from_secs_f64(1.0 / rate)
            .map_err(|_| RateLimitError::InvalidRate(rate))?;
        let quota = Quota::with_period(period)
            .ok_or(RateLimitError::InvalidRate(rate))?
            .allow_burst(burst);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Self {
            quota,
            idle_timeout: config.idle_timeout(),
            visitors: DashMap::new(),
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// Take one token from `client_id`'s bucket. `false` means the request
    /// must be rejected.
    pub fn allow(&self, client_id: &str) -> bool {
        let now = Instant::now();
        let allowed = match self.visitors.get_mut(client_id) {
            Some(mut visitor) => {
                visitor.last_seen = now;
                visitor.limiter.check().is_ok()
            }
            None => {
                let mut visitor = self
                    .visitors
                    .entry(client_id.to_string())
                    .or_insert_with(|| Visitor {
                        limiter: DefaultDirectRateLimiter::direct(self.quota),
                        last_seen: now,
                    });
                visitor.last_seen = now;
                visitor.limiter.check().is_ok()
            }
        };

        if !allowed {
            debug!("Rate limit exceeded for client {}", client_id);
        }
        allowed
    }

    pub fn visitor_count(&self) -> usize {
        self.visitors.len()
    }

    /// Drop every visitor not seen for `idle_timeout`. Returns how many were
    /// removed.
    pub fn evict_idle(&self) -> usize {
        let before = self.visitors.len();
        let idle_timeout = self.idle_timeout;
        self.visitors
            .retain(|_, visitor| visitor.last_seen.elapsed() < idle_timeout);
        let removed = before.saturating_sub(self.visitors.len());
        if removed > 0 {
            debug!(
                "Evicted {} idle rate limit visitors, {} remain",
                removed,
                self.visitors.len()
            );
        }
        removed
    }

    /// Sweep idle visitors periodically until [`shutdown`](Self::shutdown).
    pub async fn run_cleanup(&self) {
        let period = (self.idle_timeout / 2).max(Duration::from_secs(1));
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut shutdown_rx = self.shutdown_rx.clone();

        info!("Rate limiter cleanup running every {:?}", period);
        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    self.evict_idle();
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("Rate limiter cleanup stopped");
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn limiter(rps: f64, burst: u32, idle_timeout_secs: u64) -> RateLimiter {
        RateLimiter::new(&RateLimitConfig {
            requests_per_second: rps,
            burst,
            idle_timeout_secs,
        })
        .unwrap()
    }

    #[test]
    fn test_burst_then_reject() {
        let limiter = limiter(1.0, 1, 600);
        assert!(limiter.allow("10.0.0.1"));
        assert!(!limiter.allow("10.0.0.1"));
    }

    #[test]
    fn test_burst_size_is_honoured() {
        let limiter = limiter(1.0, 5, 600);
        let admitted = (0..10).filter(|_| limiter.allow("client")).count();
        assert_eq!(admitted, 5);
    }

    #[test]
    fn test_clients_are_independent() {
        let limiter = limiter(1.0, 1, 600);
        assert!(limiter.allow("a"));
        assert!(!limiter.allow("a"));
        assert!(limiter.allow("b"));
        assert_eq!(limiter.visitor_count(), 2);
    }

    #[tokio::test]
    async fn test_tokens_refill_over_time() {
        let limiter = limiter(20.0, 1, 600);
        assert!(limiter.allow("c"));
        assert!(!limiter.allow("c"));
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(limiter.allow("c"));
    }

    #[test]
    fn test_idle_visitors_are_evicted() {
        let limiter = limiter(1.0, 1, 0);
        limiter.allow("a");
        limiter.allow("b");
        assert_eq!(limiter.evict_idle(), 2);
        assert_eq!(limiter.visitor_count(), 0);

        // A fresh bucket after eviction.
        assert!(limiter.allow("a"));
    }

    #[test]
    fn test_active_visitors_survive_sweep() {
        let limiter = limiter(1.0, 1, 600);
        limiter.allow("a");
        assert_eq!(limiter.evict_idle(), 0);
        assert_eq!(limiter.visitor_count(), 1);
    }

    #[test]
    fn test_invalid_quota_is_rejected() {
        let bad_rate = RateLimiter::new(&RateLimitConfig {
            requests_per_second: 0.0,
            burst: 1,
            idle_timeout_secs: 1,
        });
        assert!(matches!(bad_rate, Err(RateLimitError::InvalidRate(_))));

        let bad_burst = RateLimiter::new(&RateLimitConfig {
            requests_per_second: 1.0,
            burst: 0,
            idle_timeout_secs: 1,
        });
        assert!(matches!(bad_burst, Err(RateLimitError::InvalidBurst)));
    }

    #[test]
    fn test_unrepresentable_rates_are_rejected() {
        for rate in [1e-20, 1e300] {
            let limiter = RateLimiter::new(&RateLimitConfig {
                requests_per_second: rate,
                burst: 1,
                idle_timeout_secs: 1,
            });
            assert!(
                matches!(limiter, Err(RateLimitError::InvalidRate(r)) if r == rate),
                "rate {rate} was accepted"
            );
        }
    }

    #[tokio::test]
    async fn test_cleanup_stops_on_shutdown() {
        let limiter = Arc::new(limiter(1.0, 1, 600));
        let task = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.run_cleanup().await })
        };
        limiter.shutdown();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("cleanup did not stop")
            .unwrap();
    }
}

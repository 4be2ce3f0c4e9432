// src/rate_limit/mod.rs
mod limiter;

pub use limiter::{RateLimitError, RateLimiter};

//
// src/proxy/mod.rs
//
mod backend;
mod pool;
mod proxy;

pub use backend::{Backend, HealthStatus, HealthTransition};
pub use pool::BackendPool;
pub use proxy::{cache_key, Proxy, ProxyError, ProxySettings};

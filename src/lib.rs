// src/lib.rs
pub mod cache;
pub mod config;
pub mod health;
pub mod load_balancer;
pub mod metrics;
pub mod proxy;
pub mod rate_limit;
pub mod server;

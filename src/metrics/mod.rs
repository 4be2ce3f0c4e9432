// src/metrics/mod.rs
mod collector;
mod sink;

pub use collector::{MetricsCollector, MetricsRegistry, Timer};
pub use sink::{MetricsSink, NoopMetrics};

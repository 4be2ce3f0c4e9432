// src/main.rs
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use edge_cdn::{
    cache::create_cache,
    config::{self, Config, LoggingConfig},
    health::HealthChecker,
    load_balancer::{create_load_balancer, BalancerCore},
    metrics::{MetricsRegistry, MetricsSink},
    proxy::{BackendPool, Proxy, ProxySettings},
    rate_limit::RateLimiter,
    server::{EdgeHandler, ServerBuilder},
};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.yaml".to_string());
    let config = config::load_config(&config_path).await?;

    init_tracing(&config.logging)?;
    info!("Loaded configuration from: {}", config_path);

    if config.server.tls_cert_file.is_some() {
        warn!("TLS certificate configured but TLS is terminated upstream; serving plain HTTP");
    }

    // Initialize metrics
    let metrics_registry = Arc::new(MetricsRegistry::new()?);
    let metrics: Arc<dyn MetricsSink> = metrics_registry.collector();

    let cache = create_cache(&config.cache, metrics.clone()).await?;
    info!("Using {} cache", cache.kind());

    // Backend pool, health checker and load balancer
    let pool = Arc::new(BackendPool::new(&config.load_balancer.backends));
    let checker = Arc::new(HealthChecker::new(
        config.health_check.clone(),
        pool,
        metrics.clone(),
    )?);
    let balancer = create_load_balancer(
        config.load_balancer.algorithm,
        BalancerCore::new(checker, metrics.clone()),
    );
    balancer.core().start_health_checker();

    let limiter = Arc::new(
        RateLimiter::new(&config.rate_limit).context("Invalid rate limit configuration")?,
    );
    let cleanup = {
        let limiter = limiter.clone();
        tokio::spawn(async move { limiter.run_cleanup().await })
    };

    let proxy = Arc::new(Proxy::new(
        ProxySettings::from_config(&config),
        balancer.clone(),
        cache,
        metrics.clone(),
    ));

    let handler = build_handler(&config, proxy, limiter.clone(), metrics, metrics_registry);

    // Start main server
    info!(
        address = %config.server.addr(),
        pid = std::process::id(),
        "Starting CDN edge node"
    );
    ServerBuilder::new(config.server.addr())
        .with_handler(move |peer| handler.for_peer(peer))
        .with_grace_period(config.server.shutdown_grace())
        .serve_with_shutdown(shutdown_signal())
        .await?;

    balancer.close();
    limiter.shutdown();
    let _ = cleanup.await;

    info!("Server stopped");
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) -> Result<()> {
    // RUST_LOG wins over the configured level.
    let filter = match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(directives) if !directives.is_empty() => EnvFilter::try_new(directives),
        _ => EnvFilter::try_new(format!("{},hyper=info", logging.level)),
    }
    .context("Invalid log filter")?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

fn build_handler(
    config: &Config,
    proxy: Arc<Proxy>,
    limiter: Arc<RateLimiter>,
    metrics: Arc<dyn MetricsSink>,
    registry: Arc<MetricsRegistry>,
) -> EdgeHandler {
    let handler = EdgeHandler::new(proxy, limiter, metrics, config.server.write_timeout());
    if config.metrics.enabled {
        info!("Metrics exposed at {}", config.metrics.path);
        handler.with_metrics_endpoint(registry, &config.metrics.path)
    } else {
        handler
    }
}

// Graceful shutdown handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}

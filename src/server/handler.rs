// src/server/handler.rs
use hyper::header::{self, HeaderValue};
use hyper::{Body, Method, Request, Response, StatusCode};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower::Service;
use tracing::{error, info};

use crate::metrics::{MetricsRegistry, MetricsSink};
use crate::proxy::Proxy;
use crate::rate_limit::RateLimiter;

const HEALTH_PATH: &str = "/health";
const READY_PATH: &str = "/ready";
const PURGE_PATH: &str = "/cache/purge";

const SECURITY_HEADERS: [(&str, &str); 5] = [
    ("x-xss-protection", "1; mode=block"),
    ("x-frame-options", "DENY"),
    ("x-content-type-options", "nosniff"),
    (
        "strict-transport-security",
        "max-age=31536000; includeSubDomains",
    ),
    ("content-security-policy", "default-src 'self'"),
];

/// Routes one connection's requests: the operational endpoints first, then
/// everything else through admission control and the dispatch pipeline.
#[derive(Clone)]
pub struct EdgeHandler {
    proxy: Arc<Proxy>,
    limiter: Arc<RateLimiter>,
    metrics: Arc<dyn MetricsSink>,
    exposition: Option<(Arc<MetricsRegistry>, Arc<str>)>,
    write_timeout: Duration,
    peer: SocketAddr,
}

impl EdgeHandler {
    pub fn new(
        proxy: Arc<Proxy>,
        limiter: Arc<RateLimiter>,
        metrics: Arc<dyn MetricsSink>,
        write_timeout: Duration,
    ) -> Self {
        Self {
            proxy,
            limiter,
            metrics,
            exposition: None,
            write_timeout,
            peer: ([0, 0, 0, 0], 0).into(),
        }
    }

    /// Serve the registry's text exposition at `path`.
    pub fn with_metrics_endpoint(mut self, registry: Arc<MetricsRegistry>, path: &str) -> Self {
        self.exposition = Some((registry, Arc::from(path)));
        self
    }

    /// A handler bound to the remote address of one connection.
    pub fn for_peer(&self, peer: SocketAddr) -> Self {
        Self {
            peer,
            ..self.clone()
        }
    }

    pub async fn handle(&self, req: Request<Body>) -> Response<Body> {
        let path = req.uri().path();

        if path == HEALTH_PATH {
            return text(StatusCode::OK, "healthy");
        }
        if path == READY_PATH {
            return text(StatusCode::OK, "ready");
        }
        if path == PURGE_PATH {
            return self.purge(req.method()).await;
        }
        if let Some((registry, metrics_path)) = &self.exposition {
            if path == &**metrics_path {
                return exposition(registry);
            }
        }

        let mut response = self.dispatch(req).await;
        apply_security_headers(&mut response);
        response
    }

    async fn dispatch(&self, req: Request<Body>) -> Response<Body> {
        let client_id = self.peer.ip().to_string();
        if !self.limiter.allow(&client_id) {
            self.metrics.record_rate_limited();
            return text(StatusCode::TOO_MANY_REQUESTS, "Too many requests");
        }

        let proxied = self.proxy.handle(req, self.peer);
        match tokio::time::timeout(self.write_timeout, proxied).await {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => err.into(),
            Err(_) => {
                error!(client_ip = %client_id, "Response not ready within write timeout");
                text(StatusCode::GATEWAY_TIMEOUT, "Gateway timeout")
            }
        }
    }

    async fn purge(&self, method: &Method) -> Response<Body> {
        if method != Method::POST {
            let mut response = text(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed");
            response
                .headers_mut()
                .insert(header::ALLOW, HeaderValue::from_static("POST"));
            return response;
        }

        match self.proxy.cache().clear().await {
            Ok(()) => {
                info!("Cache purged");
                text(StatusCode::OK, "Cache purged")
            }
            Err(e) => {
                self.metrics.record_cache_error("clear");
                error!("Cache purge failed: {}", e);
                text(StatusCode::INTERNAL_SERVER_ERROR, "Cache purge failed")
            }
        }
    }
}

fn exposition(registry: &MetricsRegistry) -> Response<Body> {
    match registry.gather() {
        Ok(body) => {
            let mut response = Response::new(Body::from(body));
            if let Ok(content_type) = HeaderValue::from_str(&registry.content_type()) {
                response
                    .headers_mut()
                    .insert(header::CONTENT_TYPE, content_type);
            }
            response
        }
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            text(StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics")
        }
    }
}

fn text(status: StatusCode, body: &'static str) -> Response<Body> {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

pub fn apply_security_headers(response: &mut Response<Body>) {
    let headers = response.headers_mut();
    for (name, value) in SECURITY_HEADERS {
        headers.insert(name, HeaderValue::from_static(value));
    }
}

impl Service<Request<Body>> for EdgeHandler {
    type Response = Response<Body>;
    type Error = Infallible;
    type Future = futures::future::BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let handler = self.clone();
        Box::pin(async move { Ok(handler.handle(req).await) })
    }
}

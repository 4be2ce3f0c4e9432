// ────────────────────────────────
// src/proxy/proxy.rs
// Dispatch pipeline: cache lookup, backend selection, forwarding
// ────────────────────────────────

use crate::cache::{CacheEntry, CacheStore, CachedResponse};
use crate::config::Config;
use crate::load_balancer::{self, BalancerError, LoadBalancer};
use crate::metrics::{MetricsSink, Timer};
use hyper::client::HttpConnector;
use hyper::header::{self, HeaderMap, HeaderName, HeaderValue};
use hyper::http::uri::InvalidUri;
use hyper::{Body, Client, Method, Request, Response, StatusCode};
use hyper_tls::HttpsConnector;
use sha2::{Digest, Sha256};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

const X_CACHE: &str = "x-cache";
const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_REQUEST_ID: &str = "x-request-id";

/// Label used for responses that never reached a backend.
const NO_BACKEND: &str = "none";
const CACHE_BACKEND: &str = "cache";

#[derive(Debug, Clone)]
pub struct ProxySettings {
    pub cache_ttl: Duration,
    pub key_includes_query: bool,
    pub vary_by_credential: bool,
    pub upstream_timeout: Duration,
    /// Bound on receiving the client's request body.
    pub read_timeout: Duration,
}

impl ProxySettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            cache_ttl: config.cache.ttl(),
            key_includes_query: config.cache.key_includes_query,
            vary_by_credential: config.cache.vary_by_credential,
            upstream_timeout: config.load_balancer.upstream_timeout(),
            read_timeout: config.server.read_timeout(),
        }
    }
}

pub struct Proxy {
    client: Client<HttpsConnector<HttpConnector>, Body>,
    balancer: Arc<dyn LoadBalancer>,
    cache: Arc<dyn CacheStore>,
    metrics: Arc<dyn MetricsSink>,
    settings: ProxySettings,
}

/// What the pipeline produced, plus the backend label it is reported under.
struct Dispatched {
    response: Response<Body>,
    backend: String,
    bytes: usize,
}

impl Proxy {
    pub fn new(
        settings: ProxySettings,
        balancer: Arc<dyn LoadBalancer>,
        cache: Arc<dyn CacheStore>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        let client = Client::builder().build::<_, Body>(HttpsConnector::new());
        Self {
            client,
            balancer,
            cache,
            metrics,
            settings,
        }
    }

    pub fn cache(&self) -> &Arc<dyn CacheStore> {
        &self.cache
    }

    pub async fn handle(
        &self,
        req: Request<Body>,
        client_addr: SocketAddr,
    ) -> Result<Response<Body>, ProxyError> {
        let request_id = Uuid::new_v4().to_string();
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let span = info_span!(
            "request",
            request_id = %request_id,
            method = %method,
            path = %path,
        );

        async move {
            let timer = Timer::new();
            info!(client_ip = %client_addr.ip(), "Incoming request");

            let outcome = self.dispatch(req, client_addr, &request_id).await;
            let elapsed = timer.elapsed();

            match outcome {
                Ok(dispatched) => {
                    let status = dispatched.response.status();
                    self.metrics.record_request(
                        method.as_str(),
                        status.as_u16(),
                        &dispatched.backend,
                        elapsed,
                        dispatched.bytes,
                    );
                    info!(
                        status_code = status.as_u16(),
                        backend = %dispatched.backend,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "Request completed"
                    );
                    Ok(dispatched.response)
                }
                Err(err) => {
                    let status = err.status_code();
                    let backend = err.backend().unwrap_or(NO_BACKEND);
                    self.metrics
                        .record_request(method.as_str(), status.as_u16(), backend, elapsed, 0);
                    error!(
                        status_code = status.as_u16(),
                        backend = %backend,
                        error = %err,
                        "Request failed"
                    );
                    Err(err)
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn dispatch(
        &self,
        req: Request<Body>,
        client_addr: SocketAddr,
        request_id: &str,
    ) -> Result<Dispatched, ProxyError> {
        let cacheable_method = matches!(*req.method(), Method::GET | Method::HEAD);
        let key = cache_key(
            req.uri(),
            req.headers(),
            self.settings.key_includes_query,
            self.settings.vary_by_credential,
        );

        if cacheable_method {
            match self.cache.get(&key).await {
                Ok(Some(entry)) => {
                    debug!("Serving {} from cache", key);
                    let head_only = req.method() == Method::HEAD;
                    return Ok(cached_response(entry, head_only));
                }
                Ok(None) => {}
                // The cache must never fail a request; fall through to the origin.
                Err(e) => {
                    self.metrics.record_cache_error("get");
                    error!("Cache lookup failed for {}: {}", key, e);
                }
            }
        }

        let in_flight = load_balancer::acquire(&self.balancer)?;
        let backend = in_flight.backend().clone();

        let (parts, body) = req.into_parts();
        let store = parts.method == Method::GET;

        let body = match timeout(self.settings.read_timeout, hyper::body::to_bytes(body)).await {
            Ok(Ok(body)) => body,
            Ok(Err(e)) => return Err(ProxyError::ClientBody(e)),
            Err(_) => return Err(ProxyError::ClientTimeout),
        };
        self.metrics
            .record_request_size(parts.method.as_str(), body.len());

        let uri = backend
            .upstream_uri(parts.uri.path_and_query())
            .map_err(|source| ProxyError::InvalidUpstreamUri {
                backend: backend.id.clone(),
                source,
            })?;

        let mut upstream_req = Request::new(Body::from(body));
        *upstream_req.method_mut() = parts.method.clone();
        *upstream_req.uri_mut() = uri;
        *upstream_req.headers_mut() = forwarded_headers(&parts.headers, client_addr, request_id);

        debug!("Forwarding to backend {}", backend.id);
        let upstream_timer = Timer::new();
        let deadline = Instant::now() + self.settings.upstream_timeout;

        let response = match timeout_at(deadline, self.client.request(upstream_req)).await {
            Ok(Ok(response)) => response,
            Ok(Err(source)) => {
                self.metrics.record_backend_error(&backend.id, "connection");
                return Err(ProxyError::Upstream {
                    backend: backend.id.clone(),
                    source,
                });
            }
            Err(_) => {
                self.metrics.record_backend_error(&backend.id, "timeout");
                return Err(ProxyError::UpstreamTimeout {
                    backend: backend.id.clone(),
                });
            }
        };

        let (resp_parts, resp_body) = response.into_parts();
        let resp_body = match timeout_at(deadline, hyper::body::to_bytes(resp_body)).await {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(source)) => {
                self.metrics.record_backend_error(&backend.id, "read_body");
                return Err(ProxyError::UpstreamBody {
                    backend: backend.id.clone(),
                    source,
                });
            }
            Err(_) => {
                self.metrics.record_backend_error(&backend.id, "timeout");
                return Err(ProxyError::UpstreamTimeout {
                    backend: backend.id.clone(),
                });
            }
        };

        let status = resp_parts.status;
        self.metrics.record_backend_request(
            &backend.id,
            !status.is_server_error(),
            upstream_timer.elapsed(),
        );
        // Release the backend before touching the cache.
        drop(in_flight);

        if store && status.is_success() && may_store(&resp_parts.headers) {
            let headers = storable_headers(&resp_parts.headers);
            let value = CachedResponse::new(status.as_u16(), resp_body.clone());
            if let Err(e) = self
                .cache
                .set(&key, value, headers, self.settings.cache_ttl)
                .await
            {
                self.metrics.record_cache_error("set");
                warn!("Failed to cache response for {}: {}", key, e);
            }
        }

        let bytes = resp_body.len();
        let mut response = Response::new(Body::from(resp_body));
        *response.status_mut() = status;
        copy_end_to_end(&resp_parts.headers, response.headers_mut());
        response
            .headers_mut()
            .insert(X_CACHE, HeaderValue::from_static("MISS"));

        Ok(Dispatched {
            response,
            backend: backend.id.clone(),
            bytes,
        })
    }
}

/// Cache key for a request: the path, optionally the query, and a
/// fingerprint of the caller's credential when responses vary by user.
pub fn cache_key(
    uri: &hyper::Uri,
    headers: &HeaderMap,
    include_query: bool,
    vary_by_credential: bool,
) -> String {
    let mut key = uri.path().to_string();
    if include_query {
        if let Some(query) = uri.query() {
            key.push('?');
            key.push_str(query);
        }
    }

    if vary_by_credential {
        if let Some(credential) = headers.get(header::AUTHORIZATION) {
            let digest = Sha256::digest(credential.as_bytes());
            key.push('#');
            key.push_str(&format!("{:x}", digest));
        }
    }
    key
}

fn cached_response(entry: CacheEntry, head_only: bool) -> Dispatched {
    let CacheEntry { value, headers, .. } = entry;
    let bytes = if head_only { 0 } else { value.body.len() };
    let body = if head_only {
        Body::empty()
    } else {
        Body::from(value.body)
    };

    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::from_u16(value.status).unwrap_or(StatusCode::OK);
    for (name, value) in headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            response.headers_mut().append(name, value);
        }
    }
    response
        .headers_mut()
        .insert(X_CACHE, HeaderValue::from_static("HIT"));

    Dispatched {
        response,
        backend: CACHE_BACKEND.to_string(),
        bytes,
    }
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

fn copy_end_to_end(from: &HeaderMap, to: &mut HeaderMap) {
    for (name, value) in from {
        if !is_hop_by_hop(name) {
            to.append(name.clone(), value.clone());
        }
    }
}

// `Host` is dropped so the client derives it from the backend URI.
fn forwarded_headers(incoming: &HeaderMap, client_addr: SocketAddr, request_id: &str) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(incoming.len() + 2);
    for (name, value) in incoming {
        if !is_hop_by_hop(name) && name != header::HOST {
            headers.append(name.clone(), value.clone());
        }
    }

    let client_ip = client_addr.ip().to_string();
    let forwarded_for = match incoming
        .get(X_FORWARDED_FOR)
        .and_then(|v| v.to_str().ok())
    {
        Some(prior) if !prior.is_empty() => format!("{}, {}", prior, client_ip),
        _ => client_ip,
    };
    if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    headers
}

// A response that sets a cookie belongs to one client and is never shared.
fn may_store(headers: &HeaderMap) -> bool {
    if headers.contains_key(header::SET_COOKIE) || headers.contains_key("set-cookie2") {
        return false;
    }
    !headers
        .get_all(header::CACHE_CONTROL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|directive| directive.trim().to_ascii_lowercase())
        .any(|directive| directive == "no-store" || directive.starts_with("private"))
}

fn storable_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter(|(name, _)| !is_hop_by_hop(name))
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("{0}")]
    Balancer(#[from] BalancerError),

    #[error("timed out reading request body")]
    ClientTimeout,

    #[error("failed to read request body: {0}")]
    ClientBody(#[source] hyper::Error),

    #[error("invalid upstream uri for backend {backend}: {source}")]
    InvalidUpstreamUri {
        backend: String,
        #[source]
        source: InvalidUri,
    },

    #[error("backend {backend} request failed: {source}")]
    Upstream {
        backend: String,
        #[source]
        source: hyper::Error,
    },

    #[error("backend {backend} timed out")]
    UpstreamTimeout { backend: String },

    #[error("failed to read response from backend {backend}: {source}")]
    UpstreamBody {
        backend: String,
        #[source]
        source: hyper::Error,
    },
}

impl ProxyError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::Balancer(_) => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::ClientTimeout => StatusCode::REQUEST_TIMEOUT,
            ProxyError::ClientBody(_) => StatusCode::BAD_REQUEST,
            ProxyError::InvalidUpstreamUri { .. } | ProxyError::Upstream { .. } => {
                StatusCode::BAD_GATEWAY
            }
            ProxyError::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::UpstreamBody { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The backend the failure is attributed to, if one was selected.
    pub fn backend(&self) -> Option<&str> {
        match self {
            ProxyError::InvalidUpstreamUri { backend, .. }
            | ProxyError::Upstream { backend, .. }
            | ProxyError::UpstreamTimeout { backend }
            | ProxyError::UpstreamBody { backend, .. } => Some(backend),
            _ => None,
        }
    }

    fn public_message(&self) -> &'static str {
        match self {
            ProxyError::Balancer(_) => "No backend available",
            ProxyError::ClientTimeout => "Request timeout",
            ProxyError::ClientBody(_) => "Bad request",
            ProxyError::InvalidUpstreamUri { .. } | ProxyError::Upstream { .. } => "Backend error",
            ProxyError::UpstreamTimeout { .. } => "Gateway timeout",
            ProxyError::UpstreamBody { .. } => "Error reading response",
        }
    }
}

// Convert ProxyError to Hyper Response for error handling
impl From<ProxyError> for Response<Body> {
    fn from(err: ProxyError) -> Self {
        let mut response = Response::new(Body::from(err.public_message()));
        *response.status_mut() = err.status_code();
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        response
    }
}

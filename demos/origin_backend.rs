//! demos/origin_backend.rs
//! Origin server for trying the edge node by hand.
//! Run: cargo run --example origin_backend -- <port> [name]
//!
//! Env: BASE_DELAY_MS, JITTER_MS, FAIL_PCT, HEALTH_FLIP_SECS (0 = never flip).

use hyper::{
    header,
    service::{make_service_fn, service_fn},
    Body, Method, Request, Response, Server, StatusCode,
};
use rand::Rng;
use std::{
    convert::Infallible,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::time::sleep;
use tracing::info;

#[derive(Clone)]
struct OriginState {
    name: String,
    served: Arc<AtomicU64>,
    healthy: Arc<AtomicBool>,
    base_delay_ms: u64,
    jitter_ms: u64,
    fail_pct: f64,
}

fn respond(status: StatusCode, cache_control: &'static str, body: String) -> Response<Body> {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/json"),
    );
    headers.insert(
        header::CACHE_CONTROL,
        header::HeaderValue::from_static(cache_control),
    );
    response
}

async fn handle(req: Request<Body>, state: OriginState) -> Result<Response<Body>, Infallible> {
    let path = req.uri().path().to_owned();

    if path == "/health" {
        return Ok(if state.healthy.load(Ordering::SeqCst) {
            respond(StatusCode::OK, "no-store", r#"{"status":"ok"}"#.into())
        } else {
            respond(
                StatusCode::SERVICE_UNAVAILABLE,
                "no-store",
                r#"{"status":"unhealthy"}"#.into(),
            )
        });
    }

    let n = state.served.fetch_add(1, Ordering::SeqCst) + 1;

    let delay = state.base_delay_ms + rand::thread_rng().gen_range(0..=state.jitter_ms);
    if delay > 0 {
        sleep(Duration::from_millis(delay)).await;
    }

    if state.fail_pct > 0.0 && rand::thread_rng().gen_bool((state.fail_pct / 100.0).min(1.0)) {
        return Ok(respond(
            StatusCode::INTERNAL_SERVER_ERROR,
            "no-store",
            r#"{"error":"injected failure"}"#.into(),
        ));
    }

    // Per-user content must never be shared by the edge cache.
    let cache_control = if path.starts_with("/private") {
        "private"
    } else {
        "public, max-age=3600"
    };

    let body = format!(
        r#"{{"origin":"{}","served":{},"method":"{}","path":"{}","delay_ms":{}}}"#,
        state.name,
        n,
        req.method(),
        path,
        delay
    );
    let status = if req.method() == Method::POST {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok(respond(status, cache_control, body))
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let port: u16 = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "8001".into())
        .parse()?;
    let name = std::env::args()
        .nth(2)
        .unwrap_or_else(|| format!("origin-{port}"));

    let state = OriginState {
        name: name.clone(),
        served: Arc::new(AtomicU64::new(0)),
        healthy: Arc::new(AtomicBool::new(true)),
        base_delay_ms: env_or("BASE_DELAY_MS", 0),
        jitter_ms: env_or("JITTER_MS", 0),
        fail_pct: env_or("FAIL_PCT", 0.0),
    };

    let flip_secs: u64 = env_or("HEALTH_FLIP_SECS", 0);
    if flip_secs > 0 {
        let state = state.clone();
        tokio::spawn(async move {
            loop {
                sleep(Duration::from_secs(flip_secs)).await;
                let was_healthy = state.healthy.fetch_xor(true, Ordering::SeqCst);
                info!(origin = %state.name, healthy = !was_healthy, "Health flipped");
            }
        });
    }

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let make_svc = make_service_fn(move |_conn| {
        let state = state.clone();
        async move { Ok::<_, Infallible>(service_fn(move |req| handle(req, state.clone()))) }
    });

    info!(origin = %name, %addr, "Origin listening");
    Server::bind(&addr).serve(make_svc).await?;
    Ok(())
}

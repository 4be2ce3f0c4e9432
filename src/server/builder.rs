// ────────────────────────────────
// src/server/builder.rs
// ────────────────────────────────
use crate::server::listener::bind_tcp;
use anyhow::{anyhow, Result};
use hyper::{server::conn::Http, Body, Request, Response};
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tower::Service;

/// Builder pattern so `main.rs` can inject its handler.
///
/// The handler is produced per connection from the peer address, so rate
/// limiting and forwarding headers see the real client.
pub struct ServerBuilder<F> {
    addr: SocketAddr,
    listener: Option<TcpListener>,
    make_handler: Option<F>,
    grace: Duration,
}

impl<F, H> ServerBuilder<F>
where
    F: Fn(SocketAddr) -> H + Send + 'static,
    H: Service<Request<Body>, Response = Response<Body>> + Send + 'static,
    H::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    H::Future: Send + 'static,
{
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            listener: None,
            make_handler: None,
            grace: Duration::from_secs(30),
        }
    }

    /// Serve on an already bound listener instead of binding `addr`.
    pub fn with_listener(mut self, listener: TcpListener) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn with_handler(mut self, make_handler: F) -> Self {
        self.make_handler = Some(make_handler);
        self
    }

    /// How long in-flight connections may run after shutdown starts.
    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Accept connections until `signal` resolves, then stop accepting and
    /// drain open connections for up to the grace period.
    pub async fn serve_with_shutdown<S>(self, signal: S) -> Result<()>
    where
        S: Future<Output = ()>,
    {
        let make_handler = self
            .make_handler
            .ok_or_else(|| anyhow!("handler must be set via with_handler()"))?;

        let listener = match self.listener {
            Some(listener) => listener,
            None => bind_tcp(self.addr).await?,
        };
        let local_addr = listener.local_addr()?;
        tracing::info!("HTTP server listening on {}", local_addr);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut connections = JoinSet::new();

        tokio::pin!(signal);
        loop {
            let (stream, peer) = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        tracing::warn!(%err, "failed to accept connection");
                        continue;
                    }
                },
                // Reap finished connection tasks.
                Some(_) = connections.join_next(), if !connections.is_empty() => continue,
                _ = &mut signal => break,
            };

            let svc = make_handler(peer);
            let mut shutdown_rx = shutdown_rx.clone();

            // One Tokio task per connection.
            connections.spawn(async move {
                let conn = Http::new().serve_connection(stream, svc);
                tokio::pin!(conn);

                let mut draining = false;
                let result = loop {
                    tokio::select! {
                        res = conn.as_mut() => break res,
                        _ = shutdown_rx.changed(), if !draining => {
                            draining = true;
                            conn.as_mut().graceful_shutdown();
                        }
                    }
                };
                if let Err(err) = result {
                    tracing::warn!(%peer, %err, "connection error");
                }
            });
        }

        tracing::info!(
            "Stopped accepting connections, draining {}",
            connections.len()
        );
        drop(listener);
        let _ = shutdown_tx.send(true);

        let drained = tokio::time::timeout(self.grace, async {
            while connections.join_next().await.is_some() {}
        })
        .await;

        match drained {
            Ok(()) => tracing::info!("All connections drained"),
            Err(_) => {
                tracing::warn!(
                    "{} connections still open after {:?}, closing them",
                    connections.len(),
                    self.grace
                );
                connections.abort_all();
                while connections.join_next().await.is_some() {}
            }
        }
        Ok(())
    }
}

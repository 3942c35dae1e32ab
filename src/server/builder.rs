// ────────────────────────────────
// src/server/builder.rs
// ────────────────────────────────
use super::handler::RequestHandler;
use super::listener::bind_tcp;
use anyhow::Result;
use hyper::server::conn::Http;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{info, warn};

/// Builder so `main.rs` can inject the gateway handler, a shutdown signal,
/// and the drain grace period.
pub struct ServerBuilder {
    addr: SocketAddr,
    handler: Option<RequestHandler>,
    shutdown: Option<watch::Receiver<bool>>,
    grace: Duration,
}

impl ServerBuilder {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            handler: None,
            shutdown: None,
            grace: Duration::from_secs(10),
        }
    }

    pub fn with_handler(mut self, handler: RequestHandler) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Receives `true` when the server should stop accepting connections.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Bind the listener without starting the accept loop, so the caller can
    /// learn the bound address (port 0 binds pick an ephemeral port).
    pub async fn bind(self) -> Result<BoundServer> {
        let handler = self.handler.expect("handler must be set via with_handler()");
        let listener = bind_tcp(self.addr).await?;
        Ok(BoundServer {
            listener,
            handler,
            shutdown: self.shutdown,
            grace: self.grace,
        })
    }

    pub async fn serve(self) -> Result<()> {
        self.bind().await?.serve().await
    }
}

pub struct BoundServer {
    listener: TcpListener,
    handler: RequestHandler,
    shutdown: Option<watch::Receiver<bool>>,
    grace: Duration,
}

impl BoundServer {
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept loop: one Tokio task per connection, served by Hyper. On
    /// shutdown the listener closes first, then in-flight connections get
    /// the grace period to finish.
    pub async fn serve(self) -> Result<()> {
        let BoundServer {
            listener,
            handler,
            mut shutdown,
            grace,
        } = self;

        info!("HTTP server listening on {}", listener.local_addr()?);
        let active = Arc::new(AtomicUsize::new(0));

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!(error = %e, "Accept failed");
                            continue;
                        }
                    };

                    let svc = handler.for_connection(peer);
                    let active = Arc::clone(&active);
                    active.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(async move {
                        let http = Http::new();
                        if let Err(err) = http.serve_connection(stream, svc).await {
                            tracing::debug!(%peer, %err, "Connection ended with error");
                        }
                        active.fetch_sub(1, Ordering::SeqCst);
                    });
                }
                _ = shutdown_signalled(&mut shutdown) => {
                    info!("Shutdown requested, no longer accepting connections");
                    break;
                }
            }
        }

        drop(listener);

        let deadline = Instant::now() + grace;
        while active.load(Ordering::SeqCst) > 0 && Instant::now() < deadline {
            sleep(Duration::from_millis(50)).await;
        }
        let remaining = active.load(Ordering::SeqCst);
        if remaining > 0 {
            warn!(remaining, "Grace period expired with connections still open");
        } else {
            info!("All connections drained");
        }

        Ok(())
    }
}

async fn shutdown_signalled(rx: &mut Option<watch::Receiver<bool>>) {
    match rx {
        Some(rx) => loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                // Sender gone without signalling; keep serving.
                std::future::pending::<()>().await;
            }
        },
        None => std::future::pending().await,
    }
}

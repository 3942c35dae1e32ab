// src/main.rs
use anyhow::Result;
use hyper::{Body, Request, Response, Server, StatusCode};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

use ntonix::health::BackendState;
use ntonix::metrics::MetricsRegistry;
use ntonix::proxy::Proxy;
use ntonix::server::{RequestHandler, ServerBuilder};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("ntonix=info".parse()?)
                .add_directive("hyper=warn".parse()?),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.yaml".to_string());

    info!("Loading configuration from: {}", config_path);
    let config = ntonix::config::load_config(&config_path).await?;

    if config.backends.is_empty() {
        tracing::warn!("No backends configured; forwarding requests will return 503");
    } else {
        for backend in &config.backends {
            info!(
                "Backend {}:{} (weight={})",
                backend.host, backend.port, backend.weight
            );
        }
    }

    // Initialize metrics
    let metrics_registry = MetricsRegistry::new()?;
    let metrics = metrics_registry.collector();

    // Build the gateway
    let proxy = Arc::new(Proxy::new(config.clone(), metrics.clone()));

    // Log health transitions and mirror them into the metrics gauges. The
    // listener holds a weak handle so checker and listener don't keep each
    // other alive.
    {
        let metrics = metrics.clone();
        let health = Arc::downgrade(proxy.health());
        proxy.health().on_state_change(Arc::new(move |backend, old, new| {
            info!(%backend, %old, %new, "Backend health transition");
            metrics.update_backend_health(&backend.key(), new == BackendState::Healthy);
            if let Some(health) = health.upgrade() {
                metrics.update_backend_counts(health.healthy_backends().len(), health.all().len());
            }
        }));
    }

    proxy.start_health_checker();
    proxy.start_pool_cleanup();

    // Metrics scrape endpoint if enabled
    if config.metrics.enabled {
        let metrics_addr: SocketAddr = ([0, 0, 0, 0], config.metrics.port).into();
        start_metrics_server(metrics_addr, metrics_registry, config.metrics.path.clone()).await?;
    }

    // Orderly shutdown: stop accepting, drain with a deadline, then close
    // pools and timers.
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    {
        let shutdown_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            let _ = shutdown_tx.send(true);
        });
    }

    // SIGHUP reloads the backend list through the registry cascade
    #[cfg(unix)]
    {
        let proxy = Arc::clone(&proxy);
        let config_path = config_path.clone();
        tokio::spawn(async move {
            let mut hangup = match signal::unix::signal(signal::unix::SignalKind::hangup()) {
                Ok(stream) => stream,
                Err(e) => {
                    error!(error = %e, "Failed to install SIGHUP handler");
                    return;
                }
            };
            while hangup.recv().await.is_some() {
                info!("SIGHUP received, reloading backends");
                match ntonix::config::load_config(&config_path).await {
                    Ok(new_config) => proxy.set_backends(&new_config.backends),
                    Err(e) => {
                        error!(error = %e, "Config reload failed, keeping previous backends")
                    }
                }
            }
        });
    }

    let addr: SocketAddr = format!("{}:{}", config.server.bind_address, config.server.port)
        .parse()?;
    info!("Starting NTONIX gateway on {}", addr);

    ServerBuilder::new(addr)
        .with_handler(RequestHandler::new(Arc::clone(&proxy)))
        .with_shutdown(shutdown_rx)
        .with_grace(config.server.shutdown_grace())
        .serve()
        .await?;

    proxy.shutdown();
    info!("Server stopped gracefully");
    Ok(())
}

async fn start_metrics_server(
    addr: SocketAddr,
    registry: MetricsRegistry,
    path: String,
) -> Result<()> {
    let registry = Arc::new(registry);
    let service_path = Arc::new(path);
    let log_path = Arc::clone(&service_path);

    let make_service = hyper::service::make_service_fn(move |_| {
        let registry = Arc::clone(&registry);
        let path = Arc::clone(&service_path);

        async move {
            Ok::<_, Infallible>(hyper::service::service_fn(move |req: Request<Body>| {
                let registry = Arc::clone(&registry);
                let path = Arc::clone(&path);

                async move {
                    if req.uri().path() == path.as_str() {
                        Ok::<_, Infallible>(
                            Response::builder()
                                .status(StatusCode::OK)
                                .header("Content-Type", "text/plain; version=0.0.4")
                                .body(Body::from(registry.gather()))
                                .unwrap(),
                        )
                    } else {
                        Ok::<_, Infallible>(
                            Response::builder()
                                .status(StatusCode::NOT_FOUND)
                                .body(Body::from("Not Found"))
                                .unwrap(),
                        )
                    }
                }
            }))
        }
    });

    let server = Server::bind(&addr).serve(make_service);
    info!("Metrics server listening on http://{}{}", addr, log_path);

    tokio::spawn(async move {
        if let Err(e) = server.await {
            error!("Metrics server error: {}", e);
        }
    });

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}

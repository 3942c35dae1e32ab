// src/proxy/proxy.rs
use super::forwarder::{
    generate_request_id, is_streaming_request, ClientRequest, ForwardReply, Forwarder,
};
use super::pool::{PoolError, PoolManager};
use crate::backend::Registry;
use crate::cache::{should_bypass_cache, CacheKey, LruCache};
use crate::config::{BackendConfig, Config};
use crate::error::ProxyError;
use crate::health::HealthChecker;
use crate::load_balancer::{create_selector, Selector};
use crate::metrics::MetricsCollector;
use hyper::header::{HeaderValue, CACHE_CONTROL, CONNECTION, CONTENT_TYPE, SERVER};
use hyper::{Body, Method, Request, Response, StatusCode, Version};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

const X_CACHE: &str = "x-cache";
const X_REQUEST_ID: &str = "x-request-id";

/// The request pipeline: classify, consult the cache, select a backend,
/// forward, store, respond. Owns every data-plane subsystem.
pub struct Proxy {
    config: Config,
    registry: Registry,
    health: Arc<HealthChecker>,
    selector: Arc<dyn Selector>,
    pools: Arc<PoolManager>,
    forwarder: Forwarder,
    cache: LruCache,
    metrics: Arc<MetricsCollector>,
}

impl Proxy {
    pub fn new(config: Config, metrics: Arc<MetricsCollector>) -> Self {
        let registry = Registry::new(&config.backends);
        let health = Arc::new(HealthChecker::new(config.health_check.clone()));
        health.set_backends(&config.backends);

        let pools = Arc::new(PoolManager::new(config.pool.clone()));
        pools.set_backends(&config.backends);

        let selector = create_selector(config.load_balancer.algorithm);
        let forwarder = Forwarder::new(config.forwarder.clone(), config.stream.clone());
        let cache = LruCache::new(
            config.cache.max_size_bytes(),
            config.cache.ttl(),
            config.cache.enabled,
        );

        metrics.update_backend_counts(config.backends.len(), config.backends.len());

        Self {
            config,
            registry,
            health,
            selector,
            pools,
            forwarder,
            cache,
            metrics,
        }
    }

    pub fn health(&self) -> &Arc<HealthChecker> {
        &self.health
    }

    pub fn pools(&self) -> &Arc<PoolManager> {
        &self.pools
    }

    pub fn cache(&self) -> &LruCache {
        &self.cache
    }

    pub fn start_health_checker(&self) {
        let health = Arc::clone(&self.health);
        tokio::spawn(health.start());
    }

    pub fn start_pool_cleanup(&self) {
        let pools = Arc::clone(&self.pools);
        tokio::spawn(pools.run_cleanup());
    }

    /// Reload entry point: atomically replace the backend set and let the
    /// health monitor and pools reconcile against it.
    pub fn set_backends(&self, configs: &[BackendConfig]) {
        info!(count = configs.len(), "Applying backend configuration");
        self.registry.set_backends(configs);
        self.health.set_backends(configs);
        self.pools.set_backends(configs);
        self.metrics
            .update_backend_counts(self.health.healthy_backends().len(), configs.len());
    }

    pub fn shutdown(&self) {
        self.health.shutdown();
        self.pools.shutdown();
    }

    pub async fn handle(
        &self,
        req: Request<Body>,
        client_addr: Option<SocketAddr>,
    ) -> Response<Body> {
        let start = Instant::now();
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        let mut response = match self.route(req, client_addr).await {
            Ok(response) => response,
            Err(err) => {
                match &err {
                    ProxyError::NotFound => debug!(%method, %path, "Unknown path"),
                    err => warn!(%method, %path, error = %err, "Request failed"),
                }
                Response::from(err)
            }
        };

        response
            .headers_mut()
            .insert(SERVER, server_header_value());
        self.metrics
            .record_request(method.as_str(), response.status().as_u16(), start.elapsed());
        response
    }

    async fn route(
        &self,
        req: Request<Body>,
        client_addr: Option<SocketAddr>,
    ) -> Result<Response<Body>, ProxyError> {
        if !matches!(req.version(), Version::HTTP_10 | Version::HTTP_11) {
            return Err(ProxyError::UnsupportedVersion);
        }

        let method = req.method().clone();
        let path = req.uri().path().to_string();

        match (&method, path.as_str()) {
            (&Method::GET, "/") => Ok(json_response(StatusCode::OK, banner_body())),
            (&Method::GET, "/health") => Ok(json_response(
                StatusCode::OK,
                r#"{"status":"healthy"}"#.to_string(),
            )),
            (&Method::GET, "/cache/stats") => {
                let body = serde_json::to_string(&self.cache.stats())
                    .map_err(|e| ProxyError::Internal(e.to_string()))?;
                Ok(json_response(StatusCode::OK, body))
            }
            (&Method::POST, "/v1/chat/completions") => {
                self.handle_chat_completions(req, client_addr).await
            }
            _ => Err(ProxyError::NotFound),
        }
    }

    async fn handle_chat_completions(
        &self,
        req: Request<Body>,
        client_addr: Option<SocketAddr>,
    ) -> Result<Response<Body>, ProxyError> {
        let (parts, body) = req.into_parts();

        let is_json = parts
            .headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.contains("application/json"))
            .unwrap_or(false);
        if !is_json {
            return Err(ProxyError::UnsupportedMedia);
        }

        let body = hyper::body::to_bytes(body)
            .await
            .map_err(|e| ProxyError::BadRequest(e.to_string()))?;

        let target = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| parts.uri.path().to_string());

        let expect_stream =
            self.config.stream.forward_chunked && is_streaming_request(&body, &parts.headers);
        let bypass = parts
            .headers
            .get(CACHE_CONTROL)
            .and_then(|v| v.to_str().ok())
            .map(should_bypass_cache)
            .unwrap_or(false);
        let cacheable = !expect_stream && !bypass;

        let key = CacheKey::from_request(parts.method.as_str(), &target, &body);

        if cacheable {
            if let Some(entry) = self.cache.get(&key) {
                debug!(%key, "Cache hit");
                let request_id = parts
                    .headers
                    .get(X_REQUEST_ID)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string)
                    .or_else(|| {
                        self.config
                            .forwarder
                            .generate_request_id
                            .then(generate_request_id)
                    });
                return Ok(cached_response(entry.body, &entry.content_type, request_id));
            }
        }

        let client_req = ClientRequest {
            method: parts.method.clone(),
            target,
            headers: parts.headers.clone(),
            body,
            client_ip: client_addr.map(|a| a.ip()),
        };

        let snapshot = self.registry.snapshot();
        let entry = self
            .selector
            .select(&snapshot, &self.health)
            .await
            .ok_or(ProxyError::NoBackends)?;
        let backend = entry.backend.clone();

        let guard = match self.pools.checkout(&backend).await {
            Ok(guard) => guard,
            Err(PoolError::Exhausted) => {
                self.metrics.record_backend_request(&backend.key(), false);
                return Err(ProxyError::PoolExhausted {
                    backend: backend.key(),
                });
            }
            Err(PoolError::Connect(source)) => {
                self.metrics.record_backend_request(&backend.key(), false);
                return Err(ProxyError::ConnectFailed {
                    backend: backend.key(),
                    source,
                });
            }
        };

        let result = match self.forwarder.forward(&client_req, &backend, guard).await {
            Ok(result) => result,
            Err(err) => {
                self.metrics.record_backend_request(&backend.key(), false);
                return Err(err);
            }
        };
        self.metrics.record_backend_request(&backend.key(), true);

        let request_id = result.request_id.clone();
        let mut response = match result.reply {
            ForwardReply::Buffered {
                status,
                headers,
                body: response_body,
            } => {
                if cacheable && status.is_success() {
                    let content_type = headers
                        .get(CONTENT_TYPE)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("application/json")
                        .to_string();
                    self.cache.put(key, response_body.clone(), content_type);
                }
                let mut response = Response::new(Body::from(response_body));
                *response.status_mut() = status;
                *response.headers_mut() = headers;
                response
            }
            ForwardReply::Streaming {
                status,
                headers,
                body,
            } => {
                self.metrics.record_stream(&backend.key());
                let mut response = Response::new(body);
                *response.status_mut() = status;
                *response.headers_mut() = headers;
                response
                    .headers_mut()
                    .insert(CONNECTION, HeaderValue::from_static("keep-alive"));
                response
            }
        };

        response
            .headers_mut()
            .insert(X_CACHE, HeaderValue::from_static("MISS"));
        if let Some(id) = request_id {
            if let Ok(value) = HeaderValue::from_str(&id) {
                response.headers_mut().insert(X_REQUEST_ID, value);
            }
        }

        Ok(response)
    }
}

fn cached_response(
    body: bytes::Bytes,
    content_type: &str,
    request_id: Option<String>,
) -> Response<Body> {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = StatusCode::OK;
    if let Ok(value) = HeaderValue::from_str(content_type) {
        response.headers_mut().insert(CONTENT_TYPE, value);
    }
    response
        .headers_mut()
        .insert(X_CACHE, HeaderValue::from_static("HIT"));
    if let Some(id) = request_id {
        if let Ok(value) = HeaderValue::from_str(&id) {
            response.headers_mut().insert(X_REQUEST_ID, value);
        }
    }
    response
}

fn json_response(status: StatusCode, body: String) -> Response<Body> {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

fn banner_body() -> String {
    serde_json::json!({
        "name": "NTONIX",
        "version": env!("CARGO_PKG_VERSION"),
        "description": "Reverse-proxy gateway for LLM inference backends",
        "endpoints": {
            "health": "/health",
            "cache_stats": "/cache/stats",
            "chat_completions": "/v1/chat/completions",
        },
    })
    .to_string()
}

fn server_header_value() -> HeaderValue {
    HeaderValue::from_static(concat!("NTONIX/", env!("CARGO_PKG_VERSION")))
}

// src/server/handler.rs
use hyper::{Body, Request, Response};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tower::Service;

use crate::proxy::Proxy;

/// Per-connection request handler delegating to the gateway pipeline.
///
/// The accept loop stamps each clone with the peer address so the forwarder
/// can build `X-Forwarded-For` / `X-Real-IP`.
#[derive(Clone)]
pub struct RequestHandler {
    proxy: Arc<Proxy>,
    remote_addr: Option<SocketAddr>,
}

impl RequestHandler {
    pub fn new(proxy: Arc<Proxy>) -> Self {
        Self {
            proxy,
            remote_addr: None,
        }
    }

    pub fn for_connection(&self, remote_addr: SocketAddr) -> Self {
        Self {
            proxy: Arc::clone(&self.proxy),
            remote_addr: Some(remote_addr),
        }
    }
}

impl Service<Request<Body>> for RequestHandler {
    type Response = Response<Body>;
    // The pipeline converts every failure into an error response itself.
    type Error = Infallible;
    type Future = futures::future::BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let proxy = Arc::clone(&self.proxy);
        let remote_addr = self.remote_addr;
        Box::pin(async move { Ok(proxy.handle(req, remote_addr).await) })
    }
}

// src/proxy/forwarder.rs
use super::connection::ConnectionGuard;
use super::http1::{self, BackendRequest, ResponseHead};
use super::stream::StreamRelay;
use crate::backend::Backend;
use crate::config::{ForwarderConfig, StreamConfig};
use crate::error::ProxyError;
use bytes::Bytes;
use hyper::header::{
    HeaderMap, HeaderName, ACCEPT, ACCEPT_ENCODING, AUTHORIZATION, CONNECTION, CONTENT_LENGTH,
    CONTENT_TYPE, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION, SERVER, TE, TRAILER,
    TRANSFER_ENCODING, UPGRADE, USER_AGENT,
};
use hyper::{Body, Method, StatusCode};
use std::net::IpAddr;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::time::timeout;
use tracing::{debug, info};

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_REAL_IP: &str = "x-real-ip";
const X_REQUEST_ID: &str = "x-request-id";

/// Client request pieces the forwarder needs; parsing already happened in
/// the server layer.
#[derive(Debug, Clone)]
pub struct ClientRequest {
    pub method: Method,
    pub target: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub client_ip: Option<IpAddr>,
}

/// What came back from the backend.
pub enum ForwardReply {
    Buffered {
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
    },
    /// The response header plus a live body channel; a background task pumps
    /// the backend socket into it.
    Streaming {
        status: StatusCode,
        headers: HeaderMap,
        body: Body,
    },
}

pub struct ForwardResult {
    pub reply: ForwardReply,
    pub latency: Duration,
    pub request_id: Option<String>,
    pub streamed: bool,
}

/// Forwards one client request over a pooled backend connection.
///
/// The response header is read before any body so the streaming decision can
/// be made without buffering. Streaming exchanges always poison the pooled
/// connection: the socket is abandoned mid-message, so HTTP/1.1 reuse is off
/// the table.
pub struct Forwarder {
    config: ForwarderConfig,
    stream_config: StreamConfig,
}

impl Forwarder {
    pub fn new(config: ForwarderConfig, stream_config: StreamConfig) -> Self {
        Self {
            config,
            stream_config,
        }
    }

    pub async fn forward(
        &self,
        req: &ClientRequest,
        backend: &Backend,
        mut guard: ConnectionGuard,
    ) -> Result<ForwardResult, ProxyError> {
        let start = Instant::now();
        let key = backend.key();
        let request_id = self.request_id_for(req);
        let backend_request = self.build_backend_request(req, backend, request_id.as_deref());
        let expect_stream =
            self.stream_config.forward_chunked && is_streaming_request(&req.body, &req.headers);

        debug!(
            method = %req.method,
            target = %req.target,
            backend = %backend,
            expect_stream,
            "Forwarding request"
        );

        // Write the request and read the response header under the request
        // deadline; the body phase gets whatever time is left.
        let head_phase = timeout(self.config.request_timeout(), async {
            let wire = backend_request.to_bytes();
            guard
                .stream_mut()
                .write_all(&wire)
                .await
                .map_err(|e| ProxyError::WriteFailed {
                    backend: key.clone(),
                    source: e,
                })?;
            http1::read_response_head(guard.stream_mut())
                .await
                .map_err(|e| ProxyError::ReadFailed {
                    backend: key.clone(),
                    reason: e.to_string(),
                })
        })
        .await;

        let (head, leftover) = match head_phase {
            Err(_) => {
                guard.mark_failed();
                return Err(ProxyError::Timeout);
            }
            Ok(Err(e)) => {
                guard.mark_failed();
                return Err(e);
            }
            Ok(Ok(parsed)) => parsed,
        };

        if expect_stream && is_streaming_response(&head) {
            return Ok(self.start_streaming(guard, head, leftover, request_id, start));
        }

        // Buffered path; an expected-stream request with a non-streaming
        // response lands here too.
        let remaining = self
            .config
            .request_timeout()
            .saturating_sub(start.elapsed());
        let body = match timeout(
            remaining,
            http1::read_body(guard.stream_mut(), &head, leftover),
        )
        .await
        {
            Err(_) => {
                guard.mark_failed();
                return Err(ProxyError::Timeout);
            }
            Ok(Err(e)) => {
                guard.mark_failed();
                return Err(ProxyError::ReadFailed {
                    backend: key,
                    reason: e.to_string(),
                });
            }
            Ok(Ok(body)) => body,
        };

        if backend_wants_close(&head.headers)
            || (!head.is_chunked() && head.content_length().is_none())
        {
            // Close-delimited or explicitly closed responses leave the
            // socket unusable for another exchange.
            guard.mark_failed();
        }

        let mut headers = head.headers.clone();
        sanitize_response_headers(&mut headers);

        let latency = start.elapsed();
        debug!(
            backend = %key,
            status = head.status.as_u16(),
            latency_ms = latency.as_millis() as u64,
            "Received backend response"
        );

        Ok(ForwardResult {
            reply: ForwardReply::Buffered {
                status: head.status,
                headers,
                body,
            },
            latency,
            request_id,
            streamed: false,
        })
    }

    fn start_streaming(
        &self,
        mut guard: ConnectionGuard,
        head: ResponseHead,
        leftover: Bytes,
        request_id: Option<String>,
        start: Instant,
    ) -> ForwardResult {
        info!(backend = %guard.backend(), "Streaming response detected");

        // HTTP/1.1 reuse is impossible after we stop mid-message.
        guard.mark_failed();

        let mut headers = head.headers.clone();
        sanitize_response_headers(&mut headers);

        let backend_chunked = head.is_chunked();
        let status = head.status;
        let relay = StreamRelay::new(self.stream_config.clone());
        let (sender, body) = Body::channel();

        tokio::spawn(async move {
            let outcome = relay
                .run(guard.stream_mut(), leftover, backend_chunked, sender)
                .await;
            debug!(
                bytes = outcome.bytes_forwarded,
                clean = outcome.is_clean(),
                "Stream relay finished"
            );
            // Guard drops here and the poisoned connection is discarded.
        });

        ForwardResult {
            reply: ForwardReply::Streaming {
                status,
                headers,
                body,
            },
            latency: start.elapsed(),
            request_id,
            streamed: true,
        }
    }

    fn request_id_for(&self, req: &ClientRequest) -> Option<String> {
        if let Some(existing) = req
            .headers
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
        {
            return Some(existing.to_string());
        }
        self.config.generate_request_id.then(generate_request_id)
    }

    fn build_backend_request(
        &self,
        req: &ClientRequest,
        backend: &Backend,
        request_id: Option<&str>,
    ) -> BackendRequest {
        let mut headers: Vec<(String, String)> = Vec::with_capacity(12);
        headers.push(("Host".to_string(), backend.addr()));

        for name in [
            CONTENT_TYPE,
            AUTHORIZATION,
            ACCEPT,
            ACCEPT_ENCODING,
            USER_AGENT,
        ] {
            if let Some(value) = req.headers.get(&name).and_then(|v| v.to_str().ok()) {
                headers.push((name.as_str().to_string(), value.to_string()));
            }
        }

        headers.push(("Connection".to_string(), "keep-alive".to_string()));

        if self.config.add_forwarded_headers {
            if let Some(ip) = req.client_ip {
                let forwarded = match req
                    .headers
                    .get(X_FORWARDED_FOR)
                    .and_then(|v| v.to_str().ok())
                {
                    Some(prior) => format!("{prior}, {ip}"),
                    None => ip.to_string(),
                };
                headers.push(("X-Forwarded-For".to_string(), forwarded));

                match req.headers.get(X_REAL_IP).and_then(|v| v.to_str().ok()) {
                    Some(existing) => {
                        headers.push(("X-Real-IP".to_string(), existing.to_string()))
                    }
                    None => headers.push(("X-Real-IP".to_string(), ip.to_string())),
                }
            }
        }

        if let Some(id) = request_id {
            headers.push(("X-Request-ID".to_string(), id.to_string()));
        }

        BackendRequest {
            method: req.method.clone(),
            target: req.target.clone(),
            headers,
            body: req.body.clone(),
        }
    }
}

/// A request asks for streaming when its JSON body sets `"stream": true`
/// (any whitespace around the colon) or its Accept header names
/// `text/event-stream`.
pub fn is_streaming_request(body: &[u8], headers: &HeaderMap) -> bool {
    if body_requests_stream(body) {
        return true;
    }
    headers
        .get(ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("text/event-stream"))
        .unwrap_or(false)
}

/// A response streams when it is a 200 whose Content-Type is SSE, or a
/// chunked response that is not plain JSON.
pub fn is_streaming_response(head: &ResponseHead) -> bool {
    if head.status != StatusCode::OK {
        return false;
    }
    let content_type = head.content_type();
    if content_type.contains("text/event-stream") {
        return true;
    }
    head.is_chunked() && !content_type.contains("application/json")
}

fn body_requests_stream(body: &[u8]) -> bool {
    const NEEDLE: &[u8] = b"\"stream\"";
    let mut from = 0;
    while let Some(pos) = find(&body[from..], NEEDLE) {
        let mut i = from + pos + NEEDLE.len();
        while i < body.len() && body[i].is_ascii_whitespace() {
            i += 1;
        }
        if i < body.len() && body[i] == b':' {
            i += 1;
            while i < body.len() && body[i].is_ascii_whitespace() {
                i += 1;
            }
            if body[i..].starts_with(b"true") {
                return true;
            }
        }
        from = from + pos + NEEDLE.len();
    }
    false
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn backend_wants_close(headers: &HeaderMap) -> bool {
    headers
        .get(CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase().contains("close"))
        .unwrap_or(false)
}

/// Strip hop-by-hop headers plus `Server` (the gateway sets its own) and
/// `Content-Length` (hyper re-frames the body it is handed).
fn sanitize_response_headers(headers: &mut HeaderMap) {
    let keep_alive = HeaderName::from_static("keep-alive");
    for name in [
        CONNECTION,
        keep_alive,
        PROXY_AUTHENTICATE,
        PROXY_AUTHORIZATION,
        TE,
        TRAILER,
        TRANSFER_ENCODING,
        UPGRADE,
        SERVER,
        CONTENT_LENGTH,
    ] {
        headers.remove(name);
    }
}

/// 128 random bits rendered as `8-4-4-4-12` lowercase hex.
pub fn generate_request_id() -> String {
    let a: u64 = rand::random();
    let b: u64 = rand::random();
    format!(
        "{:08x}-{:04x}-{:04x}-{:04x}-{:012x}",
        (a >> 32) & 0xffff_ffff,
        (a >> 16) & 0xffff,
        a & 0xffff,
        (b >> 48) & 0xffff,
        b & 0xffff_ffff_ffff
    )
}

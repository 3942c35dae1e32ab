// tests/support/mod.rs
//
// In-process mock LLM backend and gateway harness for the integration
// suite. The mock speaks just enough HTTP/1.1 over raw TCP: a health
// endpoint with a switchable status, a buffered chat completion, and a
// chunked SSE stream ending in the [DONE] sentinel.
use ntonix::config::{BackendConfig, Config, HealthCheckConfig, PoolConfig};
use ntonix::metrics::MetricsRegistry;
use ntonix::proxy::Proxy;
use ntonix::server::{RequestHandler, ServerBuilder};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

pub struct MockBackend {
    pub id: String,
    pub addr: SocketAddr,
    health_status: Arc<AtomicU16>,
    chat_requests: Arc<AtomicU64>,
    last_chat_headers: Arc<Mutex<String>>,
}

impl MockBackend {
    pub async fn spawn(id: &str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let health_status = Arc::new(AtomicU16::new(200));
        let chat_requests = Arc::new(AtomicU64::new(0));
        let last_chat_headers = Arc::new(Mutex::new(String::new()));

        let state = BackendState {
            id: id.to_string(),
            health_status: Arc::clone(&health_status),
            chat_requests: Arc::clone(&chat_requests),
            last_chat_headers: Arc::clone(&last_chat_headers),
        };
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let state = state.clone();
                tokio::spawn(async move {
                    let _ = serve_connection(stream, state).await;
                });
            }
        });

        Self {
            id: id.to_string(),
            addr,
            health_status,
            chat_requests,
            last_chat_headers,
        }
    }

    pub fn set_health_status(&self, status: u16) {
        self.health_status.store(status, Ordering::SeqCst);
    }

    pub fn chat_requests(&self) -> u64 {
        self.chat_requests.load(Ordering::SeqCst)
    }

    pub fn last_chat_headers(&self) -> String {
        self.last_chat_headers.lock().unwrap().clone()
    }

    pub fn backend_config(&self, weight: u32) -> BackendConfig {
        BackendConfig {
            host: self.addr.ip().to_string(),
            port: self.addr.port(),
            weight,
        }
    }

    pub fn key(&self) -> String {
        format!("{}:{}", self.addr.ip(), self.addr.port())
    }
}

#[derive(Clone)]
struct BackendState {
    id: String,
    health_status: Arc<AtomicU16>,
    chat_requests: Arc<AtomicU64>,
    last_chat_headers: Arc<Mutex<String>>,
}

struct ParsedRequest {
    method: String,
    path: String,
    headers: String,
    body: Vec<u8>,
}

async fn serve_connection(mut stream: TcpStream, state: BackendState) -> std::io::Result<()> {
    let mut buffer: Vec<u8> = Vec::new();
    loop {
        let request = match read_request(&mut stream, &mut buffer).await? {
            Some(request) => request,
            None => return Ok(()),
        };

        match (request.method.as_str(), request.path.as_str()) {
            ("GET", "/health") => {
                let status = state.health_status.load(Ordering::SeqCst);
                let body = format!("{{\"status\":\"{status}\",\"backend\":\"{}\"}}", state.id);
                write_json(&mut stream, status, &body).await?;
            }
            ("POST", "/v1/chat/completions") => {
                state.chat_requests.fetch_add(1, Ordering::SeqCst);
                *state.last_chat_headers.lock().unwrap() = request.headers.clone();

                if request.body.windows(8).any(|w| w == b"\"slow\":1") {
                    tokio::time::sleep(Duration::from_millis(300)).await;
                }

                if body_wants_stream(&request.body) {
                    write_sse_stream(&mut stream).await?;
                } else {
                    let serial = state.chat_requests.load(Ordering::SeqCst);
                    let body = format!(
                        "{{\"id\":\"chatcmpl-{serial}\",\"object\":\"chat.completion\",\"backend\":\"{}\"}}",
                        state.id
                    );
                    write_json(&mut stream, 200, &body).await?;
                }
            }
            _ => {
                write_json(&mut stream, 404, "{\"error\":\"not found\"}").await?;
            }
        }
    }
}

fn body_wants_stream(body: &[u8]) -> bool {
    body.windows(14).any(|w| w == b"\"stream\": true")
        || body.windows(13).any(|w| w == b"\"stream\":true")
}

async fn read_request(
    stream: &mut TcpStream,
    buffer: &mut Vec<u8>,
) -> std::io::Result<Option<ParsedRequest>> {
    let header_end = loop {
        if let Some(pos) = buffer.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        let mut chunk = [0u8; 4096];
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        buffer.extend_from_slice(&chunk[..n]);
    };

    let header_text = String::from_utf8_lossy(&buffer[..header_end]).to_string();
    let mut lines = header_text.lines();
    let request_line = lines.next().unwrap_or_default().to_string();
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let path = parts.next().unwrap_or_default().to_string();

    let content_length = header_text
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())?
        })
        .unwrap_or(0);

    while buffer.len() < header_end + content_length {
        let mut chunk = [0u8; 4096];
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        buffer.extend_from_slice(&chunk[..n]);
    }

    let body = buffer[header_end..header_end + content_length].to_vec();
    buffer.drain(..header_end + content_length);

    Ok(Some(ParsedRequest {
        method,
        path,
        headers: header_text,
        body,
    }))
}

async fn write_json(stream: &mut TcpStream, status: u16, body: &str) -> std::io::Result<()> {
    let reason = match status {
        200 => "OK",
        404 => "Not Found",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Status",
    };
    let response = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: keep-alive\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(response.as_bytes()).await
}

pub const SSE_EVENTS: [&str; 3] = [
    "data: {\"x\":1}\n\n",
    "data: {\"x\":2}\n\n",
    "data: [DONE]\n\n",
];

async fn write_sse_stream(stream: &mut TcpStream) -> std::io::Result<()> {
    stream
        .write_all(
            b"HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nTransfer-Encoding: chunked\r\nConnection: keep-alive\r\n\r\n",
        )
        .await?;

    for event in SSE_EVENTS {
        let frame = format!("{:x}\r\n{event}\r\n", event.len());
        stream.write_all(frame.as_bytes()).await?;
        stream.flush().await?;
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    stream.write_all(b"0\r\n\r\n").await
}

pub struct Gateway {
    pub addr: SocketAddr,
    pub proxy: Arc<Proxy>,
    pub shutdown: watch::Sender<bool>,
}

impl Gateway {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

/// Fast health cadence so transition tests finish quickly.
pub fn test_config(backends: Vec<BackendConfig>) -> Config {
    let mut config = Config::default();
    config.backends = backends;
    config.health_check = HealthCheckConfig {
        interval_ms: 100,
        timeout_ms: 500,
        unhealthy_threshold: 3,
        healthy_threshold: 2,
        health_path: "/health".to_string(),
    };
    config.pool = PoolConfig {
        pool_size_per_backend: 4,
        connect_timeout_secs: 2,
        ..PoolConfig::default()
    };
    config
}

pub async fn start_gateway(config: Config) -> Gateway {
    let metrics = MetricsRegistry::new().unwrap().collector();
    let proxy = Arc::new(Proxy::new(config, metrics));
    proxy.start_health_checker();
    proxy.start_pool_cleanup();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let bound = ServerBuilder::new("127.0.0.1:0".parse().unwrap())
        .with_handler(RequestHandler::new(Arc::clone(&proxy)))
        .with_shutdown(shutdown_rx)
        .with_grace(Duration::from_secs(2))
        .bind()
        .await
        .unwrap();
    let addr = bound.local_addr().unwrap();
    tokio::spawn(bound.serve());

    Gateway {
        addr,
        proxy,
        shutdown: shutdown_tx,
    }
}

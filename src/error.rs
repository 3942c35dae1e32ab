// src/error.rs
use hyper::{Body, Response, StatusCode};

/// Errors surfaced to clients by the request pipeline.
///
/// Every variant maps to exactly one client status; per-request errors are
/// never fatal to the process.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("No healthy backends available")]
    NoBackends,

    #[error("Connection pool exhausted for {backend}")]
    PoolExhausted { backend: String },

    #[error("Failed to connect to backend {backend}: {source}")]
    ConnectFailed {
        backend: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to send request to backend {backend}: {source}")]
    WriteFailed {
        backend: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read response from backend {backend}: {reason}")]
    ReadFailed { backend: String, reason: String },

    #[error("Backend request timed out")]
    Timeout,

    #[error("Malformed request: {0}")]
    BadRequest(String),

    #[error("Content-Type must be application/json")]
    UnsupportedMedia,

    #[error("Only HTTP/1.0 and HTTP/1.1 are supported")]
    UnsupportedVersion,

    #[error("Not found")]
    NotFound,

    #[error("Internal proxy error: {0}")]
    Internal(String),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::NoBackends => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::PoolExhausted { .. }
            | ProxyError::ConnectFailed { .. }
            | ProxyError::WriteFailed { .. }
            | ProxyError::ReadFailed { .. } => StatusCode::BAD_GATEWAY,
            ProxyError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::UnsupportedMedia => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            ProxyError::UnsupportedVersion => StatusCode::HTTP_VERSION_NOT_SUPPORTED,
            ProxyError::NotFound => StatusCode::NOT_FOUND,
            ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message placed in the JSON error body. Backend I/O details stay in the
    /// logs; clients get a stable, non-leaking description.
    pub fn client_message(&self) -> &'static str {
        match self {
            ProxyError::NoBackends => "No healthy backends available",
            ProxyError::PoolExhausted { .. } => "Backend connection pool exhausted",
            ProxyError::ConnectFailed { .. } => "Failed to connect to backend",
            ProxyError::WriteFailed { .. } => "Failed to send request to backend",
            ProxyError::ReadFailed { .. } => "Failed to read response from backend",
            ProxyError::Timeout => "Backend request timed out",
            ProxyError::BadRequest(_) => "Malformed request",
            ProxyError::UnsupportedMedia => "Content-Type must be application/json",
            ProxyError::UnsupportedVersion => "Only HTTP/1.0 and HTTP/1.1 are supported",
            ProxyError::NotFound => "Not found",
            ProxyError::Internal(_) => "Internal proxy error",
        }
    }
}

impl From<ProxyError> for Response<Body> {
    fn from(err: ProxyError) -> Self {
        let body = serde_json::json!({ "error": err.client_message() }).to_string();
        Response::builder()
            .status(err.status())
            .header("Content-Type", "application/json")
            .body(Body::from(body))
            .expect("static error response must build")
    }
}

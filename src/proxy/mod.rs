// src/proxy/mod.rs
mod connection;
mod forwarder;
mod http1;
mod pool;
mod proxy;
mod stream;

pub use connection::{ConnectionGuard, PooledConnection};
pub use forwarder::{ClientRequest, ForwardReply, ForwardResult, Forwarder};
pub use http1::{BackendRequest, ChunkedDecoder, ResponseHead};
pub use pool::{BackendPool, PoolError, PoolManager, PoolStats};
pub use proxy::Proxy;
pub use stream::{StreamOutcome, StreamRelay};

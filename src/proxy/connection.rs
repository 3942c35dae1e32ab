// src/proxy/connection.rs
use crate::backend::Backend;
use std::sync::Weak;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;

/// A reusable TCP connection to one backend.
///
/// Owned by its pool while idle; exclusively owned by a `ConnectionGuard`
/// while checked out. `valid` is cleared when the socket has seen EOF or an
/// I/O error, which keeps it from re-entering the idle queue.
#[derive(Debug)]
pub struct PooledConnection {
    stream: TcpStream,
    backend: Backend,
    created_at: Instant,
    last_used: Instant,
    usage_count: u64,
    valid: bool,
}

impl PooledConnection {
    pub fn new(stream: TcpStream, backend: Backend) -> Self {
        let now = Instant::now();
        Self {
            stream,
            backend,
            created_at: now,
            last_used: now,
            usage_count: 0,
            valid: true,
        }
    }

    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn invalidate(&mut self) {
        self.valid = false;
    }

    pub fn usage_count(&self) -> u64 {
        self.usage_count
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }

    pub(super) fn mark_in_use(&mut self) {
        self.usage_count += 1;
        self.last_used = Instant::now();
    }

    pub(super) fn mark_returned(&mut self) {
        self.last_used = Instant::now();
    }
}

/// RAII checkout handle.
///
/// Dropping the guard always releases the slot: the connection goes back to
/// the idle front when it is still trusted, and is discarded after
/// `mark_failed` or socket invalidation. Release happens on unwind too.
#[derive(Debug)]
pub struct ConnectionGuard {
    conn: Option<PooledConnection>,
    pool: Weak<super::pool::BackendPool>,
    failed: bool,
}

impl ConnectionGuard {
    pub(super) fn new(conn: PooledConnection, pool: Weak<super::pool::BackendPool>) -> Self {
        Self {
            conn: Some(conn),
            pool,
            failed: false,
        }
    }

    pub fn stream_mut(&mut self) -> &mut TcpStream {
        self.conn
            .as_mut()
            .expect("guard used after release")
            .stream_mut()
    }

    pub fn backend(&self) -> &Backend {
        self.conn
            .as_ref()
            .expect("guard used after release")
            .backend()
    }

    /// Prevent this connection from being pooled again.
    pub fn mark_failed(&mut self) {
        self.failed = true;
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }

    pub fn usage_count(&self) -> u64 {
        self.conn
            .as_ref()
            .expect("guard used after release")
            .usage_count()
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            if self.failed {
                conn.invalidate();
            }
            if let Some(pool) = self.pool.upgrade() {
                pool.release(conn, !self.failed);
            }
            // Pool already gone: the connection drops here and the socket
            // closes with it.
        }
    }
}

// src/proxy/pool.rs
use super::connection::{ConnectionGuard, PooledConnection};
use crate::backend::Backend;
use crate::config::{BackendConfig, PoolConfig};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::TcpStream;
use tokio::time::{interval, timeout};
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("connection pool exhausted")]
    Exhausted,
    #[error("failed to connect: {0}")]
    Connect(#[source] std::io::Error),
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PoolStats {
    pub available: usize,
    pub in_use: usize,
    pub total: usize,
}

/// Connection pool for a single backend.
///
/// Idle connections sit in a deque with the most recently used at the front;
/// checkout pops from the front so warm sockets are preferred before the
/// peer's idle policy can close them. `|idle| + in_use` never exceeds
/// `pool_size_per_backend`.
pub struct BackendPool {
    backend: Backend,
    config: PoolConfig,
    idle: Mutex<VecDeque<PooledConnection>>,
    in_use: AtomicUsize,
}

impl BackendPool {
    pub fn new(backend: Backend, config: PoolConfig) -> Self {
        Self {
            backend,
            config,
            idle: Mutex::new(VecDeque::new()),
            in_use: AtomicUsize::new(0),
        }
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    /// Check out a connection: MRU idle socket if one is still trusted,
    /// otherwise a fresh connection while the pool has room.
    pub async fn checkout(self: &Arc<Self>) -> Result<ConnectionGuard, PoolError> {
        let reused = {
            let mut idle = self.idle.lock().expect("pool lock poisoned");
            let mut found = None;
            while let Some(candidate) = idle.pop_front() {
                if candidate.is_valid() {
                    found = Some(candidate);
                    break;
                }
                debug!(backend = %self.backend, "Discarding invalid pooled connection");
            }

            match found {
                Some(conn) => {
                    self.in_use.fetch_add(1, Ordering::SeqCst);
                    Some(conn)
                }
                None => {
                    // Reserve a slot before connecting so concurrent
                    // checkouts cannot overshoot the pool size.
                    let total = idle.len() + self.in_use.load(Ordering::SeqCst);
                    if total >= self.config.pool_size_per_backend {
                        warn!(
                            backend = %self.backend,
                            max = self.config.pool_size_per_backend,
                            "Connection pool exhausted"
                        );
                        return Err(PoolError::Exhausted);
                    }
                    self.in_use.fetch_add(1, Ordering::SeqCst);
                    None
                }
            }
        };

        let mut conn = match reused {
            Some(conn) => conn,
            None => match self.connect().await {
                Ok(conn) => conn,
                Err(e) => {
                    self.in_use.fetch_sub(1, Ordering::SeqCst);
                    return Err(PoolError::Connect(e));
                }
            },
        };

        conn.mark_in_use();
        Ok(ConnectionGuard::new(conn, Arc::downgrade(self)))
    }

    /// Return a checked-out connection. Reusable, still-valid sockets go back
    /// to the MRU front; everything else is dropped.
    pub(super) fn release(&self, mut conn: PooledConnection, reusable: bool) {
        self.in_use.fetch_sub(1, Ordering::SeqCst);
        conn.mark_returned();

        if reusable && conn.is_valid() {
            let mut idle = self.idle.lock().expect("pool lock poisoned");
            idle.push_front(conn);
            debug!(
                backend = %self.backend,
                available = idle.len(),
                in_use = self.in_use.load(Ordering::SeqCst),
                "Returned connection to pool"
            );
        } else {
            debug!(backend = %self.backend, "Discarding non-reusable connection");
        }
    }

    /// Drop idle connections that have aged out or gone bad.
    pub fn cleanup_idle(&self) -> usize {
        let mut idle = self.idle.lock().expect("pool lock poisoned");
        let before = idle.len();
        idle.retain(|conn| conn.is_valid() && conn.idle_for() <= self.config.idle_timeout());
        let removed = before - idle.len();
        if removed > 0 {
            debug!(backend = %self.backend, removed, "Cleaned up idle connections");
        }
        removed
    }

    pub fn close_all(&self) {
        let mut idle = self.idle.lock().expect("pool lock poisoned");
        idle.clear();
    }

    pub fn available_count(&self) -> usize {
        self.idle.lock().expect("pool lock poisoned").len()
    }

    pub fn in_use_count(&self) -> usize {
        self.in_use.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> PoolStats {
        let available = self.available_count();
        let in_use = self.in_use_count();
        PoolStats {
            available,
            in_use,
            total: available + in_use,
        }
    }

    async fn connect(&self) -> std::io::Result<PooledConnection> {
        let addr = (self.backend.host.clone(), self.backend.port);
        let stream = timeout(self.config.connect_timeout(), TcpStream::connect(addr))
            .await
            .map_err(|_| {
                std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out")
            })??;

        stream.set_nodelay(true)?;
        if self.config.enable_keep_alive {
            let socket = socket2::SockRef::from(&stream);
            socket.set_keepalive(true)?;
        }

        debug!(backend = %self.backend, "Created new backend connection");
        Ok(PooledConnection::new(stream, self.backend.clone()))
    }
}

/// Owns one pool per backend and the shared idle-cleanup timer.
pub struct PoolManager {
    config: PoolConfig,
    pools: DashMap<String, Arc<BackendPool>>,
    shutdown_tx: tokio::sync::watch::Sender<bool>,
    shutdown_rx: tokio::sync::watch::Receiver<bool>,
}

impl PoolManager {
    pub fn new(config: PoolConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        Self {
            config,
            pools: DashMap::new(),
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Reconcile pools with the backend set: drained and dropped when the
    /// backend is gone, created empty when it is new.
    pub fn set_backends(&self, configs: &[BackendConfig]) {
        let keys: std::collections::HashSet<String> = configs
            .iter()
            .map(|c| format!("{}:{}", c.host, c.port))
            .collect();

        self.pools.retain(|key, pool| {
            let keep = keys.contains(key);
            if !keep {
                info!(backend = %key, "Removing connection pool");
                pool.close_all();
            }
            keep
        });

        for config in configs {
            let backend = Backend::from(config);
            let key = backend.key();
            self.pools
                .entry(key)
                .or_insert_with(|| Arc::new(BackendPool::new(backend, self.config.clone())));
        }
    }

    pub async fn checkout(&self, backend: &Backend) -> Result<ConnectionGuard, PoolError> {
        let pool = self
            .pools
            .entry(backend.key())
            .or_insert_with(|| Arc::new(BackendPool::new(backend.clone(), self.config.clone())))
            .clone();
        pool.checkout().await
    }

    pub fn pool(&self, key: &str) -> Option<Arc<BackendPool>> {
        self.pools.get(key).map(|p| p.clone())
    }

    /// Single periodic task that sweeps idle connections across all pools.
    pub async fn run_cleanup(self: Arc<Self>) {
        let mut ticker = interval(self.config.cleanup_interval());
        let mut shutdown_rx = self.shutdown_rx.clone();

        info!(interval = ?self.config.cleanup_interval(), "Pool cleanup timer started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    for pool in self.pools.iter() {
                        pool.cleanup_idle();
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Pool cleanup timer shutting down");
                        break;
                    }
                }
            }
        }
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        for pool in self.pools.iter() {
            pool.close_all();
        }
    }

    pub fn total_stats(&self) -> PoolStats {
        let mut total = PoolStats::default();
        for pool in self.pools.iter() {
            let stats = pool.stats();
            total.available += stats.available;
            total.in_use += stats.in_use;
            total.total += stats.total;
        }
        total
    }
}

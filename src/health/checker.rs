// src/health/checker.rs
use super::status::{BackendHealth, BackendState};
use crate::backend::Backend;
use crate::config::{BackendConfig, HealthCheckConfig};
use chrono::Utc;
use reqwest::Client;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::time::{interval, timeout};
use tracing::{debug, error, info, warn};

/// Callback invoked on every state transition as `(backend, old, new)`.
pub type StateChangeListener = Arc<dyn Fn(&Backend, BackendState, BackendState) + Send + Sync>;

/// Periodic health monitor with hysteresis.
///
/// Each cycle probes every backend concurrently; within one backend probes
/// are serialized because a cycle completes before the next starts.
/// Listeners run strictly after the state lock is released, and a panicking
/// listener is trapped so monitoring keeps going.
pub struct HealthChecker {
    config: HealthCheckConfig,
    client: Client,
    states: Mutex<HashMap<String, BackendHealth>>,
    listeners: Mutex<Vec<StateChangeListener>>,
    shutdown_tx: tokio::sync::watch::Sender<bool>,
    shutdown_rx: tokio::sync::watch::Receiver<bool>,
}

impl HealthChecker {
    pub fn new(config: HealthCheckConfig) -> Self {
        // pool_max_idle_per_host(0) keeps reqwest from holding sockets, so
        // every probe exercises a fresh TCP connection.
        let client = Client::builder()
            .pool_max_idle_per_host(0)
            .timeout(config.timeout())
            .build()
            .expect("Failed to create HTTP client");

        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

        Self {
            config,
            client,
            states: Mutex::new(HashMap::new()),
            listeners: Mutex::new(Vec::new()),
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Replace the monitored backend set, preserving health records for
    /// backends whose `host:port` survives the reload.
    pub fn set_backends(&self, configs: &[BackendConfig]) {
        let mut states = self.states.lock().expect("health state lock poisoned");

        let mut next: HashMap<String, BackendHealth> = HashMap::with_capacity(configs.len());
        for config in configs {
            let backend = Backend::from(config);
            let key = backend.key();
            match states.remove(&key) {
                Some(mut existing) => {
                    existing.backend = backend;
                    next.insert(key, existing);
                }
                None => {
                    debug!(backend = %backend, "Monitoring new backend");
                    next.insert(key, BackendHealth::new(backend));
                }
            }
        }

        for (_, removed) in states.drain() {
            debug!(backend = %removed.backend, "Dropped health record");
        }

        *states = next;
    }

    pub fn on_state_change(&self, listener: StateChangeListener) {
        self.listeners
            .lock()
            .expect("listener lock poisoned")
            .push(listener);
    }

    pub fn is_healthy(&self, key: &str) -> bool {
        self.states
            .lock()
            .expect("health state lock poisoned")
            .get(key)
            .map(|h| h.state == BackendState::Healthy)
            .unwrap_or(false)
    }

    pub fn healthy_backends(&self) -> Vec<Backend> {
        self.states
            .lock()
            .expect("health state lock poisoned")
            .values()
            .filter(|h| h.state == BackendState::Healthy)
            .map(|h| h.backend.clone())
            .collect()
    }

    pub fn all(&self) -> Vec<BackendHealth> {
        self.states
            .lock()
            .expect("health state lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Externally force a state, e.g. to drain a backend ahead of removal.
    pub fn set_state(&self, key: &str, new_state: BackendState) {
        let transition = {
            let mut states = self.states.lock().expect("health state lock poisoned");
            match states.get_mut(key) {
                Some(health) if health.state != new_state => {
                    let old = health.state;
                    health.state = new_state;
                    health.consecutive_failures = 0;
                    health.consecutive_successes = 0;
                    Some((health.backend.clone(), old))
                }
                _ => None,
            }
        };

        if let Some((backend, old)) = transition {
            info!(backend = %backend, %old, new = %new_state, "Backend state forced");
            self.notify(&backend, old, new_state);
        }
    }

    pub async fn start(self: Arc<Self>) {
        let mut ticker = interval(self.config.interval());
        let mut shutdown_rx = self.shutdown_rx.clone();

        info!(interval = ?self.config.interval(), "Health checker started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.check_all_backends().await;
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Health checker shutting down");
                        break;
                    }
                }
            }
        }
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    async fn check_all_backends(&self) {
        let backends: Vec<Backend> = {
            let states = self.states.lock().expect("health state lock poisoned");
            states.values().map(|h| h.backend.clone()).collect()
        };

        if backends.is_empty() {
            return;
        }

        let probes = backends.into_iter().map(|backend| async move {
            let (success, latency) = self.probe(&backend).await;
            self.record_result(&backend.key(), success, latency);
        });

        futures::future::join_all(probes).await;
    }

    /// One probe: GET `health_path` over a fresh connection, success iff the
    /// status is in [200, 300) within the configured deadline.
    async fn probe(&self, backend: &Backend) -> (bool, Duration) {
        let url = format!("http://{}{}", backend.addr(), self.config.health_path);
        let start = Instant::now();

        let result = timeout(self.config.timeout(), self.client.get(&url).send()).await;
        let latency = start.elapsed();

        let success = match result {
            Ok(Ok(response)) => {
                let ok = response.status().is_success();
                if !ok {
                    debug!(backend = %backend, status = %response.status(), "Probe returned non-2xx");
                }
                ok
            }
            Ok(Err(e)) => {
                debug!(backend = %backend, error = %e, "Probe failed");
                false
            }
            Err(_) => {
                debug!(backend = %backend, timeout = ?self.config.timeout(), "Probe timed out");
                false
            }
        };

        (success, latency)
    }

    fn record_result(&self, key: &str, success: bool, latency: Duration) {
        let transition = {
            let mut states = self.states.lock().expect("health state lock poisoned");
            let health = match states.get_mut(key) {
                Some(h) => h,
                // Backend removed while the probe was in flight.
                None => return,
            };

            health.last_check_at = Some(Utc::now());
            health.last_latency = latency;

            if success {
                health.consecutive_failures = 0;
                health.consecutive_successes =
                    (health.consecutive_successes + 1).min(self.config.healthy_threshold);
            } else {
                health.consecutive_successes = 0;
                health.consecutive_failures =
                    (health.consecutive_failures + 1).min(self.config.unhealthy_threshold);
            }

            let old = health.state;
            let new = match old {
                BackendState::Healthy
                    if health.consecutive_failures >= self.config.unhealthy_threshold =>
                {
                    BackendState::Unhealthy
                }
                BackendState::Unhealthy
                    if health.consecutive_successes >= self.config.healthy_threshold =>
                {
                    BackendState::Healthy
                }
                // Draining is sticky for probes.
                _ => old,
            };

            if new != old {
                health.state = new;
                Some((health.backend.clone(), old, new))
            } else {
                None
            }
        };

        if let Some((backend, old, new)) = transition {
            match new {
                BackendState::Unhealthy => {
                    warn!(backend = %backend, %old, %new, "Backend state changed")
                }
                _ => info!(backend = %backend, %old, %new, "Backend state changed"),
            }
            self.notify(&backend, old, new);
        }
    }

    fn notify(&self, backend: &Backend, old: BackendState, new: BackendState) {
        let listeners: Vec<StateChangeListener> = self
            .listeners
            .lock()
            .expect("listener lock poisoned")
            .clone();

        for listener in listeners {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| listener(backend, old, new))) {
                error!(backend = %backend, ?panic, "State change listener panicked");
            }
        }
    }
}

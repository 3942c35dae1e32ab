// src/backend/mod.rs
mod registry;

pub use registry::{Registry, RegistrySnapshot};

use crate::config::BackendConfig;
use std::hash::{Hash, Hasher};
use std::sync::atomic::AtomicI64;

/// A single upstream inference backend.
///
/// Identity is `(host, port)`; weight participates in selection but not in
/// equality or hashing, so a reload that only changes a weight addresses the
/// same backend.
#[derive(Debug, Clone)]
pub struct Backend {
    pub host: String,
    pub port: u16,
    pub weight: u32,
}

impl Backend {
    pub fn new(host: impl Into<String>, port: u16, weight: u32) -> Self {
        Self {
            host: host.into(),
            port,
            weight,
        }
    }

    /// Canonical registry key, `host:port`.
    pub fn key(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl From<&BackendConfig> for Backend {
    fn from(config: &BackendConfig) -> Self {
        Backend::new(config.host.clone(), config.port, config.weight)
    }
}

impl PartialEq for Backend {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host && self.port == other.port
    }
}

impl Eq for Backend {}

impl Hash for Backend {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.host.hash(state);
        self.port.hash(state);
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Registry entry: the backend plus the selector's running weight.
///
/// `current_weight` belongs to the SWRR selector and survives registry merges
/// for preserved backends so selection stays smooth across reloads.
#[derive(Debug)]
pub struct BackendEntry {
    pub backend: Backend,
    pub current_weight: AtomicI64,
}

impl BackendEntry {
    pub fn new(backend: Backend) -> Self {
        Self {
            backend,
            current_weight: AtomicI64::new(0),
        }
    }
}

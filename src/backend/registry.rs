// src/backend/registry.rs
use super::{Backend, BackendEntry};
use crate::config::BackendConfig;
use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::info;

/// Immutable view of the configured backends, published atomically.
///
/// Entries keep their registry index; the selector's tie-break and the
/// per-entry `current_weight` slots both depend on that ordering.
#[derive(Debug, Default)]
pub struct RegistrySnapshot {
    pub entries: Vec<Arc<BackendEntry>>,
}

impl RegistrySnapshot {
    pub fn total_weight(&self) -> u64 {
        self.entries
            .iter()
            .map(|e| u64::from(e.backend.weight))
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Canonical backend set keyed by `host:port`.
///
/// `set_backends` swaps in a new snapshot; unchanged keys carry their entry
/// (and therefore their selector state) over, with only the weight updated.
pub struct Registry {
    snapshot: ArcSwap<RegistrySnapshot>,
}

impl Registry {
    pub fn new(configs: &[BackendConfig]) -> Self {
        let entries = configs
            .iter()
            .map(|c| Arc::new(BackendEntry::new(Backend::from(c))))
            .collect();
        Self {
            snapshot: ArcSwap::from_pointee(RegistrySnapshot { entries }),
        }
    }

    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.snapshot.load_full()
    }

    /// Atomically replace the backend set.
    ///
    /// Entries whose `(host, port)` survive are preserved; new entries start
    /// with a zero running weight.
    pub fn set_backends(&self, configs: &[BackendConfig]) {
        let previous = self.snapshot.load_full();
        let by_key: HashMap<String, Arc<BackendEntry>> = previous
            .entries
            .iter()
            .map(|e| (e.backend.key(), Arc::clone(e)))
            .collect();

        let mut entries = Vec::with_capacity(configs.len());
        for config in configs {
            let backend = Backend::from(config);
            match by_key.get(&backend.key()) {
                Some(existing) if existing.backend.weight == backend.weight => {
                    entries.push(Arc::clone(existing));
                }
                Some(existing) => {
                    // Same identity, new weight: keep the selector state.
                    let entry = BackendEntry::new(backend);
                    entry.current_weight.store(
                        existing.current_weight.load(Ordering::Relaxed),
                        Ordering::Relaxed,
                    );
                    entries.push(Arc::new(entry));
                }
                None => {
                    info!(backend = %backend, weight = backend.weight, "Added backend");
                    entries.push(Arc::new(BackendEntry::new(backend)));
                }
            }
        }

        let new_keys: std::collections::HashSet<String> =
            entries.iter().map(|e| e.backend.key()).collect();
        for entry in &previous.entries {
            if !new_keys.contains(&entry.backend.key()) {
                info!(backend = %entry.backend, "Removed backend");
            }
        }

        self.snapshot.store(Arc::new(RegistrySnapshot { entries }));
    }

    pub fn keys(&self) -> Vec<String> {
        self.snapshot
            .load()
            .entries
            .iter()
            .map(|e| e.backend.key())
            .collect()
    }
}

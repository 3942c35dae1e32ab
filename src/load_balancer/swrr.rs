// src/load_balancer/swrr.rs
use super::algorithm::Selector;
use crate::backend::{BackendEntry, RegistrySnapshot};
use crate::health::HealthChecker;
use async_trait::async_trait;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::debug;

/// Smooth weighted round-robin.
///
/// Each selection adds every healthy backend's configured weight to its
/// running weight, takes the argmax (ties go to the lowest registry index),
/// then subtracts the healthy total from the winner. The running weights live
/// in the registry entries, so they survive reloads for preserved backends.
///
/// Selection is lock-free over the snapshot: concurrent calls may race on
/// the argmax, which perturbs the strict cycle but keeps the long-run
/// distribution weighted-correct.
pub struct SwrrSelector;

impl SwrrSelector {
    pub fn new() -> Self {
        Self
    }
}

impl Default for SwrrSelector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Selector for SwrrSelector {
    async fn select(
        &self,
        snapshot: &RegistrySnapshot,
        health: &HealthChecker,
    ) -> Option<Arc<BackendEntry>> {
        // Healthy set fixed up front so the add / subtract phases agree on
        // the total weight.
        let healthy: Vec<&Arc<BackendEntry>> = snapshot
            .entries
            .iter()
            .filter(|e| health.is_healthy(&e.backend.key()))
            .collect();

        if healthy.is_empty() {
            return None;
        }

        let total: i64 = healthy.iter().map(|e| i64::from(e.backend.weight)).sum();

        let mut selected: Option<&Arc<BackendEntry>> = None;
        let mut max_weight = i64::MIN;
        for entry in &healthy {
            let new_weight = entry
                .current_weight
                .fetch_add(i64::from(entry.backend.weight), Ordering::AcqRel)
                + i64::from(entry.backend.weight);

            if new_weight > max_weight {
                max_weight = new_weight;
                selected = Some(entry);
            }
        }

        let winner = selected?;
        winner.current_weight.fetch_sub(total, Ordering::AcqRel);

        debug!(
            backend = %winner.backend,
            weight = winner.backend.weight,
            "Selected backend"
        );

        Some(Arc::clone(winner))
    }

    fn name(&self) -> &'static str {
        "smooth_weighted_round_robin"
    }
}

// src/load_balancer/algorithm.rs
use crate::backend::{BackendEntry, RegistrySnapshot};
use crate::health::HealthChecker;
use async_trait::async_trait;
use std::sync::Arc;

#[async_trait]
pub trait Selector: Send + Sync {
    /// Pick one backend from the snapshot, restricted to entries the health
    /// checker currently reports as healthy. `None` when no healthy backend
    /// exists.
    async fn select(
        &self,
        snapshot: &RegistrySnapshot,
        health: &HealthChecker,
    ) -> Option<Arc<BackendEntry>>;

    fn name(&self) -> &'static str;
}

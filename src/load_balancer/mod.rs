// src/load_balancer/mod.rs
mod algorithm;
mod swrr;

pub use algorithm::Selector;
pub use swrr::SwrrSelector;

use crate::config::LoadBalancerAlgorithm;
use std::sync::Arc;

pub fn create_selector(algorithm: LoadBalancerAlgorithm) -> Arc<dyn Selector> {
    match algorithm {
        LoadBalancerAlgorithm::SmoothWeightedRoundRobin => Arc::new(SwrrSelector::new()),
    }
}

// src/health/status.rs
use crate::backend::Backend;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Backend health state.
///
/// `Draining` excludes a backend from new selections while in-flight work
/// finishes; probes never move a backend out of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendState {
    Healthy,
    Unhealthy,
    Draining,
}

impl std::fmt::Display for BackendState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BackendState::Healthy => "healthy",
            BackendState::Unhealthy => "unhealthy",
            BackendState::Draining => "draining",
        };
        f.write_str(s)
    }
}

/// Per-backend health record.
///
/// The failure and success counters are mutually exclusive: any probe result
/// zeroes one and bumps the other, and each saturates at its threshold.
#[derive(Debug, Clone)]
pub struct BackendHealth {
    pub backend: Backend,
    pub state: BackendState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub last_check_at: Option<DateTime<Utc>>,
    pub last_latency: Duration,
}

impl BackendHealth {
    pub fn new(backend: Backend) -> Self {
        Self {
            backend,
            state: BackendState::Healthy,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_check_at: None,
            last_latency: Duration::ZERO,
        }
    }
}

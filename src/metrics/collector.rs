// src/metrics/collector.rs
use anyhow::Result;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;

pub struct MetricsRegistry {
    registry: Registry,
    collector: Arc<MetricsCollector>,
}

impl MetricsRegistry {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let collector = Arc::new(MetricsCollector::new(&registry)?);
        Ok(Self {
            registry,
            collector,
        })
    }

    pub fn collector(&self) -> Arc<MetricsCollector> {
        self.collector.clone()
    }

    pub fn gather(&self) -> Vec<u8> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            tracing::error!(error = %e, "Failed to encode metrics");
        }
        buffer
    }
}

pub struct MetricsCollector {
    pub requests_total: IntCounterVec,
    pub request_duration_seconds: HistogramVec,
    pub backend_requests_total: IntCounterVec,
    pub backend_health_status: IntGaugeVec,
    pub healthy_backends: IntGauge,
    pub total_backends: IntGauge,
    pub streams_total: IntCounterVec,
}

impl MetricsCollector {
    pub fn new(registry: &Registry) -> Result<Self> {
        let requests_total = IntCounterVec::new(
            Opts::new("ntonix_requests_total", "Total requests handled"),
            &["method", "status"],
        )?;
        registry.register(Box::new(requests_total.clone()))?;

        let request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "ntonix_request_duration_seconds",
                "Request duration in seconds",
            ),
            &["method"],
        )?;
        registry.register(Box::new(request_duration_seconds.clone()))?;

        let backend_requests_total = IntCounterVec::new(
            Opts::new("ntonix_backend_requests_total", "Forwards per backend"),
            &["backend", "outcome"],
        )?;
        registry.register(Box::new(backend_requests_total.clone()))?;

        let backend_health_status = IntGaugeVec::new(
            Opts::new(
                "ntonix_backend_health_status",
                "Backend health (1=healthy, 0=unhealthy or draining)",
            ),
            &["backend"],
        )?;
        registry.register(Box::new(backend_health_status.clone()))?;

        let healthy_backends =
            IntGauge::new("ntonix_healthy_backends", "Number of healthy backends")?;
        registry.register(Box::new(healthy_backends.clone()))?;

        let total_backends =
            IntGauge::new("ntonix_total_backends", "Total configured backends")?;
        registry.register(Box::new(total_backends.clone()))?;

        let streams_total = IntCounterVec::new(
            Opts::new("ntonix_streams_total", "Streaming responses relayed"),
            &["backend"],
        )?;
        registry.register(Box::new(streams_total.clone()))?;

        Ok(Self {
            requests_total,
            request_duration_seconds,
            backend_requests_total,
            backend_health_status,
            healthy_backends,
            total_backends,
            streams_total,
        })
    }

    pub fn record_request(&self, method: &str, status: u16, duration: std::time::Duration) {
        self.requests_total
            .with_label_values(&[method, &status.to_string()])
            .inc();
        self.request_duration_seconds
            .with_label_values(&[method])
            .observe(duration.as_secs_f64());
    }

    pub fn record_backend_request(&self, backend: &str, success: bool) {
        let outcome = if success { "success" } else { "failure" };
        self.backend_requests_total
            .with_label_values(&[backend, outcome])
            .inc();
    }

    pub fn record_stream(&self, backend: &str) {
        self.streams_total.with_label_values(&[backend]).inc();
    }

    pub fn update_backend_health(&self, backend: &str, healthy: bool) {
        self.backend_health_status
            .with_label_values(&[backend])
            .set(if healthy { 1 } else { 0 });
    }

    pub fn update_backend_counts(&self, healthy: usize, total: usize) {
        self.healthy_backends.set(healthy as i64);
        self.total_backends.set(total as i64);
    }
}

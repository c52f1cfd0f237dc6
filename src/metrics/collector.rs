// src/metrics/collector.rs
use prometheus::{Encoder, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use std::sync::Arc;
use anyhow::Result;

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
        encoder.encode(&metric_families, &mut buffer).unwrap();
        buffer
    }
}

pub struct MetricsCollector {
    // Request metrics
    pub requests_total: IntCounterVec,
    pub upstream_failures_total: IntCounterVec,

    // Backend metrics
    pub backend_active_requests: IntGaugeVec,
    pub backend_health_status: IntGaugeVec,

    // System metrics
    pub available_backends: IntGauge,
}

impl MetricsCollector {
    pub fn new(registry: &Registry) -> Result<Self> {
        let requests_total = IntCounterVec::new(
            Opts::new("lb_requests_total", "Total number of proxied requests"),
            &["method", "status_code", "backend"],
        )?;
        registry.register(Box::new(requests_total.clone()))?;

        let upstream_failures_total = IntCounterVec::new(
            Opts::new(
                "lb_upstream_failures_total",
                "Upstream opens that failed or timed out",
            ),
            &["backend"],
        )?;
        registry.register(Box::new(upstream_failures_total.clone()))?;

        let backend_active_requests = IntGaugeVec::new(
            Opts::new(
                "lb_backend_active_requests",
                "In-flight proxied requests per backend",
            ),
            &["backend"],
        )?;
        registry.register(Box::new(backend_active_requests.clone()))?;

        let backend_health_status = IntGaugeVec::new(
            Opts::new(
                "lb_backend_health_status",
                "Backend health status (1=healthy, 0=unhealthy)",
            ),
            &["backend"],
        )?;
        registry.register(Box::new(backend_health_status.clone()))?;

        let available_backends = IntGauge::new(
            "lb_available_backends",
            "Number of backends currently available for inference",
        )?;
        registry.register(Box::new(available_backends.clone()))?;

        Ok(Self {
            requests_total,
            upstream_failures_total,
            backend_active_requests,
            backend_health_status,
            available_backends,
        })
    }

    pub fn record_request(&self, method: &str, status_code: u16, backend: &str) {
        let status = status_code.to_string();
        self.requests_total
            .with_label_values(&[method, &status, backend])
            .inc();
    }

    pub fn record_upstream_failure(&self, backend: &str) {
        self.upstream_failures_total
            .with_label_values(&[backend])
            .inc();
    }

    pub fn update_backend(&self, backend: &str, healthy: bool, active_requests: usize) {
        let value = if healthy { 1 } else { 0 };
        self.backend_health_status
            .with_label_values(&[backend])
            .set(value);

        self.backend_active_requests
            .with_label_values(&[backend])
            .set(active_requests as i64);
    }

    pub fn update_available(&self, count: usize) {
        self.available_backends.set(count as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gather_exposes_recorded_series() {
        let registry = MetricsRegistry::new().unwrap();
        let collector = registry.collector();

        collector.record_request("GET", 200, "http://b1:8000");
        collector.record_upstream_failure("http://b1:8000");
        collector.update_backend("http://b1:8000", true, 2);
        collector.update_available(1);

        let text = String::from_utf8(registry.gather()).unwrap();
        assert!(text.contains("lb_requests_total"));
        assert!(text.contains("lb_upstream_failures_total"));
        assert!(text.contains("lb_backend_health_status"));
        assert!(text.contains("lb_available_backends 1"));
    }
}

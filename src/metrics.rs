//! Prometheus-compatible metrics, exposed at `GET /metrics`.

use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

pub struct Metrics {
    registry: Registry,
    pub jobs_submitted_total: IntCounter,
    pub jobs_completed_total: IntCounter,
    pub jobs_failed_total: IntCounter,
    pub jobs_cancelled_total: IntCounter,
    pub nodes_registered: IntGauge,
    pub pending_jobs: IntGauge,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let jobs_submitted_total =
            IntCounter::new("jobs_submitted_total", "total jobs admitted").unwrap();
        let jobs_completed_total =
            IntCounter::new("jobs_completed_total", "total jobs settled as completed").unwrap();
        let jobs_failed_total =
            IntCounter::new("jobs_failed_total", "total jobs that reached final failure").unwrap();
        let jobs_cancelled_total =
            IntCounter::new("jobs_cancelled_total", "total jobs cancelled by a client").unwrap();
        let nodes_registered =
            IntGauge::new("nodes_registered", "currently connected nodes").unwrap();
        let pending_jobs = IntGauge::new("pending_jobs", "jobs waiting for dispatch").unwrap();

        registry.register(Box::new(jobs_submitted_total.clone())).unwrap();
        registry.register(Box::new(jobs_completed_total.clone())).unwrap();
        registry.register(Box::new(jobs_failed_total.clone())).unwrap();
        registry.register(Box::new(jobs_cancelled_total.clone())).unwrap();
        registry.register(Box::new(nodes_registered.clone())).unwrap();
        registry.register(Box::new(pending_jobs.clone())).unwrap();

        Self {
            registry,
            jobs_submitted_total,
            jobs_completed_total,
            jobs_failed_total,
            jobs_cancelled_total,
            nodes_registered,
            pending_jobs,
        }
    }

    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&families, &mut buffer).unwrap();
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

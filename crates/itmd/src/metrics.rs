//! Prometheus metrics collection for itmd
//!
//! Each daemon instance owns its own [`Registry`]; nothing is registered
//! globally, so tests can run several instances side by side.

use std::sync::Arc;

use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramTimer, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry, TextEncoder,
};

/// Prometheus metrics collector for itmd
#[derive(Clone)]
pub struct MetricsCollector {
    // Coordinator
    jobs_submitted: IntCounter,
    jobs_completed: IntCounter,
    jobs_retried: IntCounter,
    jobs_failed: IntCounter,
    jobs_cancelled: IntCounter,
    active_keys: IntGauge,
    job_duration_seconds: Histogram,

    // Mesh and lifecycle
    tunnels_created: IntCounter,
    tunnels_removed: IntCounter,
    oper_transitions: IntCounterVec,
    migrations_detected: IntCounter,
    not_hosted_expired: IntCounter,

    registry: Arc<Registry>,
}

impl MetricsCollector {
    /// Create a new metrics collector
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let counter = |name: &str, help: &str| -> Result<IntCounter, prometheus::Error> {
            let c = IntCounter::new(name, help)?;
            registry.register(Box::new(c.clone()))?;
            Ok(c)
        };

        let jobs_submitted = counter("itmd_jobs_submitted_total", "Jobs accepted by the coordinator")?;
        let jobs_completed = counter("itmd_jobs_completed_total", "Jobs that finished successfully")?;
        let jobs_retried = counter("itmd_jobs_retried_total", "Job attempts that were retried")?;
        let jobs_failed = counter(
            "itmd_jobs_failed_total",
            "Jobs that failed after exhausting retries",
        )?;
        let jobs_cancelled = counter(
            "itmd_jobs_cancelled_total",
            "Jobs refused or dropped during shutdown",
        )?;
        let tunnels_created = counter("itmd_tunnels_created_total", "Tunnels provisioned")?;
        let tunnels_removed = counter("itmd_tunnels_removed_total", "Tunnels torn down")?;
        let migrations_detected = counter(
            "itmd_migrations_detected_total",
            "Interface moves between DPNs detected",
        )?;
        let not_hosted_expired = counter(
            "itmd_not_hosted_expired_total",
            "Parked VTEPs dropped by the expiry sweep",
        )?;

        let oper_transitions = IntCounterVec::new(
            Opts::new(
                "itmd_tunnel_oper_transitions_total",
                "Tunnel operational status transitions by new status",
            ),
            &["status"],
        )?;
        registry.register(Box::new(oper_transitions.clone()))?;

        let active_keys = IntGauge::new("itmd_active_keys", "Job keys with queued or running work")?;
        registry.register(Box::new(active_keys.clone()))?;

        let job_duration_seconds = Histogram::with_opts(
            HistogramOpts::new("itmd_job_duration_seconds", "Job attempt latency in seconds")
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )?;
        registry.register(Box::new(job_duration_seconds.clone()))?;

        Ok(Self {
            jobs_submitted,
            jobs_completed,
            jobs_retried,
            jobs_failed,
            jobs_cancelled,
            active_keys,
            job_duration_seconds,
            tunnels_created,
            tunnels_removed,
            oper_transitions,
            migrations_detected,
            not_hosted_expired,
            registry: Arc::new(registry),
        })
    }

    pub fn record_job_submitted(&self) {
        self.jobs_submitted.inc();
    }

    pub fn record_job_completed(&self) {
        self.jobs_completed.inc();
    }

    pub fn record_job_retried(&self) {
        self.jobs_retried.inc();
    }

    pub fn record_job_failed(&self) {
        self.jobs_failed.inc();
    }

    pub fn record_job_cancelled(&self) {
        self.jobs_cancelled.inc();
    }

    pub fn set_active_keys(&self, count: usize) {
        self.active_keys.set(count as i64);
    }

    /// Start job latency timer
    pub fn start_job_timer(&self) -> HistogramTimer {
        self.job_duration_seconds.start_timer()
    }

    pub fn record_tunnel_created(&self) {
        self.tunnels_created.inc();
    }

    pub fn record_tunnel_removed(&self) {
        self.tunnels_removed.inc();
    }

    pub fn record_oper_transition(&self, status: &str) {
        self.oper_transitions.with_label_values(&[status]).inc();
    }

    pub fn record_migration(&self) {
        self.migrations_detected.inc();
    }

    pub fn record_not_hosted_expired(&self, count: usize) {
        self.not_hosted_expired.inc_by(count as u64);
    }

    pub fn jobs_submitted(&self) -> u64 {
        self.jobs_submitted.get()
    }

    pub fn jobs_completed(&self) -> u64 {
        self.jobs_completed.get()
    }

    pub fn jobs_retried(&self) -> u64 {
        self.jobs_retried.get()
    }

    pub fn jobs_failed(&self) -> u64 {
        self.jobs_failed.get()
    }

    pub fn jobs_cancelled(&self) -> u64 {
        self.jobs_cancelled.get()
    }

    pub fn tunnels_created(&self) -> u64 {
        self.tunnels_created.get()
    }

    pub fn tunnels_removed(&self) -> u64 {
        self.tunnels_removed.get()
    }

    pub fn migrations_detected(&self) -> u64 {
        self.migrations_detected.get()
    }

    pub fn not_hosted_expired(&self) -> u64 {
        self.not_hosted_expired.get()
    }

    /// Gather metrics in Prometheus text format
    pub fn gather_text(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buf = vec![];
        encoder.encode(&self.registry.gather(), &mut buf).ok();
        String::from_utf8(buf).unwrap_or_else(|_| String::from("# Error encoding metrics\n"))
    }
}

impl std::fmt::Debug for MetricsCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsCollector")
            .field("jobs_submitted", &self.jobs_submitted.get())
            .field("jobs_failed", &self.jobs_failed.get())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_collector_creation() {
        assert!(MetricsCollector::new().is_ok());
    }

    #[test]
    fn test_instances_are_independent() {
        let a = MetricsCollector::new().unwrap();
        let b = MetricsCollector::new().unwrap();
        a.record_job_submitted();
        a.record_job_submitted();
        assert_eq!(a.jobs_submitted(), 2);
        assert_eq!(b.jobs_submitted(), 0);
    }

    #[test]
    fn test_gather_text() {
        let collector = MetricsCollector::new().unwrap();
        collector.record_job_failed();
        collector.record_oper_transition("up");
        collector.record_not_hosted_expired(3);

        let text = collector.gather_text();
        assert!(text.contains("itmd_jobs_failed_total 1"));
        assert!(text.contains("itmd_tunnel_oper_transitions_total{status=\"up\"} 1"));
        assert!(text.contains("itmd_not_hosted_expired_total 3"));
    }

    #[test]
    fn test_job_timer_observes() {
        let collector = MetricsCollector::new().unwrap();
        let timer = collector.start_job_timer();
        timer.observe_duration();
        assert!(collector
            .gather_text()
            .contains("itmd_job_duration_seconds_count 1"));
    }
}

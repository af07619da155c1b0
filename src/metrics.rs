//! Metrics sinks for rate limit decisions.

use prometheus::{Histogram, HistogramOpts, IntCounter, Opts, Registry};
use std::time::Duration;

/// Passive receiver for decision counters and latency.
///
/// A limiter calls `observe_latency` once per decision and exactly one of
/// `inc_allow` / `inc_deny`, including when a backend failure was converted
/// by the fail policy.
pub trait MetricsSink: Send + Sync {
    fn inc_allow(&self);
    fn inc_deny(&self);
    fn observe_latency(&self, elapsed: Duration);
}

/// Sink that drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn inc_allow(&self) {}
    fn inc_deny(&self) {}
    fn observe_latency(&self, _elapsed: Duration) {}
}

/// Prometheus-backed sink.
#[derive(Clone)]
pub struct PrometheusMetrics {
    allowed: IntCounter,
    denied: IntCounter,
    latency: Histogram,
}

impl PrometheusMetrics {
    /// Create the collectors under `namespace`/`subsystem`.
    pub fn new(namespace: &str, subsystem: &str) -> prometheus::Result<Self> {
        let allowed = IntCounter::with_opts(
            Opts::new("allow_total", "Total number of allowed requests")
                .namespace(namespace)
                .subsystem(subsystem),
        )?;
        let denied = IntCounter::with_opts(
            Opts::new("deny_total", "Total number of denied requests")
                .namespace(namespace)
                .subsystem(subsystem),
        )?;
        let latency = Histogram::with_opts(
            HistogramOpts::new(
                "request_duration_seconds",
                "Histogram of rate limit decision durations",
            )
            .namespace(namespace)
            .subsystem(subsystem)
            .buckets(vec![
                0.000_01, 0.000_05, 0.000_1, 0.000_5, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5,
            ]),
        )?;

        Ok(Self {
            allowed,
            denied,
            latency,
        })
    }

    /// Register all collectors with `registry`.
    pub fn register(&self, registry: &Registry) -> prometheus::Result<()> {
        registry.register(Box::new(self.allowed.clone()))?;
        registry.register(Box::new(self.denied.clone()))?;
        registry.register(Box::new(self.latency.clone()))?;
        Ok(())
    }

    pub fn allowed(&self) -> u64 {
        self.allowed.get()
    }

    pub fn denied(&self) -> u64 {
        self.denied.get()
    }
}

impl MetricsSink for PrometheusMetrics {
    fn inc_allow(&self) {
        self.allowed.inc();
    }

    fn inc_deny(&self) {
        self.denied.inc();
    }

    fn observe_latency(&self, elapsed: Duration) {
        self.latency.observe(elapsed.as_secs_f64());
    }
}

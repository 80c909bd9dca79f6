//! Reconcile metrics
//!
//! Every controller shares one [`Metrics`] registry; the controller name and
//! the reconcile result are label dimensions.

use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};
use std::time::Duration;

/// Prometheus collectors of the reconciliation runtime
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    reconcile_total: IntCounterVec,
    reconcile_duration: HistogramVec,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}

impl Metrics {
    /// Register the reconcile collectors in a fresh registry
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        let reconcile_total = IntCounterVec::new(
            Opts::new("reconcile_total", "Reconciles per controller and result"),
            &["controller", "result"],
        )?;
        let reconcile_duration = HistogramVec::new(
            HistogramOpts::new("reconcile_duration_seconds", "Reconcile latency per controller")
                .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
            &["controller"],
        )?;
        registry.register(Box::new(reconcile_total.clone()))?;
        registry.register(Box::new(reconcile_duration.clone()))?;
        Ok(Self {
            registry,
            reconcile_total,
            reconcile_duration,
        })
    }

    /// Record one reconcile of `controller`
    pub fn observe(&self, controller: &str, result: &str, elapsed: Duration) {
        self.reconcile_total
            .with_label_values(&[controller, result])
            .inc();
        self.reconcile_duration
            .with_label_values(&[controller])
            .observe(elapsed.as_secs_f64());
    }

    /// Reconciles recorded for `controller` with `result`
    pub fn reconcile_count(&self, controller: &str, result: &str) -> u64 {
        self.reconcile_total
            .with_label_values(&[controller, result])
            .get()
    }

    /// Registry holding the collectors, for additional controller metrics
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Text exposition of every registered metric
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

//! Prometheus metrics for the connection pool and the reconciler

use crate::Result;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};
use std::sync::Arc;

/// Event kinds counted by `discovery_events_total`.
pub const EVENT_UPSERT: &str = "upsert";
pub const EVENT_REMOVE: &str = "remove";
pub const EVENT_IGNORED: &str = "ignored";
pub const EVENT_REJECTED: &str = "rejected";

/// Metrics collector shared by a pool and its reconciler
#[derive(Clone)]
pub struct PoolMetrics {
    /// Live endpoints per service
    pub endpoints: IntGaugeVec,
    /// Failed dial attempts per service
    pub dial_failures_total: IntCounterVec,
    /// Change events processed, by kind
    pub events_total: IntCounterVec,
    /// Change feed failures
    pub watch_errors_total: IntCounter,
    /// Full resyncs performed
    pub resyncs_total: IntCounter,
    /// Prometheus registry for metrics
    pub registry: Arc<Registry>,
}

impl PoolMetrics {
    /// Create a new collector with its own registry
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());

        let endpoints = IntGaugeVec::new(
            Opts::new("discovery_endpoints", "Connected endpoints per service"),
            &["service"],
        )?;

        let dial_failures_total = IntCounterVec::new(
            Opts::new(
                "discovery_dial_failures_total",
                "Endpoint dial failures per service",
            ),
            &["service"],
        )?;

        let events_total = IntCounterVec::new(
            Opts::new("discovery_events_total", "Change events processed by kind"),
            &["kind"],
        )?;

        let watch_errors_total = IntCounter::new(
            "discovery_watch_errors_total",
            "Change feed errors",
        )?;

        let resyncs_total = IntCounter::new(
            "discovery_resyncs_total",
            "Full resyncs of the service directory",
        )?;

        registry.register(Box::new(endpoints.clone()))?;
        registry.register(Box::new(dial_failures_total.clone()))?;
        registry.register(Box::new(events_total.clone()))?;
        registry.register(Box::new(watch_errors_total.clone()))?;
        registry.register(Box::new(resyncs_total.clone()))?;

        Ok(Self {
            endpoints,
            dial_failures_total,
            events_total,
            watch_errors_total,
            resyncs_total,
            registry,
        })
    }

    pub(crate) fn set_endpoints(&self, service: &str, count: usize) {
        self.endpoints
            .with_label_values(&[service])
            .set(count as i64);
    }

    pub(crate) fn record_event(&self, kind: &str) {
        self.events_total.with_label_values(&[kind]).inc();
    }

    /// Gather all metrics in Prometheus text format
    pub fn gather(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = vec![];
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

use crate::state::AppState;
use anyhow::Result;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

pub struct Metrics {
    registry: Registry,
    http_requests: IntCounterVec,
    composite_requests: IntCounterVec,
    stage_duration: HistogramVec,
    fetch_failures: IntCounterVec,
    sweep_removed: IntCounter,
    inflight_requests: IntGauge,
    cache_entries: IntGauge,
    cache_bytes: IntGauge,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();
        let http_requests = IntCounterVec::new(
            Opts::new(
                "compositor_http_requests_total",
                "HTTP request count by route group, method, and status",
            ),
            &["route_group", "method", "status"],
        )
        .expect("http_requests_total");
        let composite_requests = IntCounterVec::new(
            Opts::new(
                "compositor_composite_requests_total",
                "Composite requests by result class",
            ),
            &["result"],
        )
        .expect("composite_requests_total");
        let stage_duration = HistogramVec::new(
            HistogramOpts::new(
                "compositor_stage_duration_seconds",
                "Composite generation duration by stage",
            )
            .buckets(vec![
                0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
            ]),
            &["stage"],
        )
        .expect("stage_duration_seconds");
        let fetch_failures = IntCounterVec::new(
            Opts::new(
                "compositor_fetch_failures_total",
                "Source image fetch failures by kind",
            ),
            &["kind"],
        )
        .expect("fetch_failures_total");
        let sweep_removed = IntCounter::new(
            "compositor_sweep_removed_total",
            "Composite files removed by the sweep",
        )
        .expect("sweep_removed_total");
        let inflight_requests = IntGauge::new("compositor_inflight_requests", "Requests in flight")
            .expect("inflight_requests");
        let cache_entries = IntGauge::new("compositor_cache_entries", "Composite files on disk")
            .expect("cache_entries");
        let cache_bytes = IntGauge::new("compositor_cache_bytes", "Composite bytes on disk")
            .expect("cache_bytes");

        registry
            .register(Box::new(http_requests.clone()))
            .expect("register http_requests");
        registry
            .register(Box::new(composite_requests.clone()))
            .expect("register composite_requests");
        registry
            .register(Box::new(stage_duration.clone()))
            .expect("register stage_duration");
        registry
            .register(Box::new(fetch_failures.clone()))
            .expect("register fetch_failures");
        registry
            .register(Box::new(sweep_removed.clone()))
            .expect("register sweep_removed");
        registry
            .register(Box::new(inflight_requests.clone()))
            .expect("register inflight_requests");
        registry
            .register(Box::new(cache_entries.clone()))
            .expect("register cache_entries");
        registry
            .register(Box::new(cache_bytes.clone()))
            .expect("register cache_bytes");

        Self {
            registry,
            http_requests,
            composite_requests,
            stage_duration,
            fetch_failures,
            sweep_removed,
            inflight_requests,
            cache_entries,
            cache_bytes,
        }
    }

    pub fn gather(&self) -> Result<String> {
        let metric_families = self.registry.gather();
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).to_string())
    }

    pub fn inflight_guard(self: &Arc<Self>) -> InflightGuard {
        self.inflight_requests.inc();
        InflightGuard {
            metrics: Arc::clone(self),
        }
    }

    pub fn observe_http_request(&self, route_group: &str, method: &str, status: &str) {
        self.http_requests
            .with_label_values(&[route_group, method, status])
            .inc();
    }

    pub fn observe_composite_result(&self, result: &str) {
        self.composite_requests.with_label_values(&[result]).inc();
    }

    pub fn observe_stage_duration(&self, stage: &str, duration: Duration) {
        self.stage_duration
            .with_label_values(&[stage])
            .observe(duration.as_secs_f64());
    }

    pub fn observe_fetch_failure(&self, kind: &str) {
        self.fetch_failures.with_label_values(&[kind]).inc();
    }

    pub fn add_sweep_removed(&self, removed: usize) {
        self.sweep_removed.inc_by(removed as u64);
    }

    pub fn set_cache_usage(&self, entries: u64, bytes: u64) {
        self.cache_entries.set(entries as i64);
        self.cache_bytes.set(bytes as i64);
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

pub struct InflightGuard {
    metrics: Arc<Metrics>,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.metrics.inflight_requests.dec();
    }
}

pub async fn refresh_metrics(state: &AppState) {
    match state.cache.stats().await {
        Ok(stats) => state.metrics.set_cache_usage(stats.entries, stats.bytes),
        Err(err) => warn!(error = ?err, "cache stats refresh failed"),
    }
}

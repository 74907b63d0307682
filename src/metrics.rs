use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics::{Counter, Gauge, Histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::time::Duration;
use tracing::info;

/// Handles to every metric the service records.
///
/// Handles are bound to whatever recorder is installed when [`Metrics::new`]
/// runs; without one they are no-ops. Install the Prometheus recorder first
/// when exporting.
pub struct Metrics {
    pub cache_hits: Counter,
    pub cache_misses: Counter,
    pub captures_started: Counter,
    pub captures_succeeded: Counter,
    pub captures_failed: Counter,
    pub fallback_captures: Counter,
    pub joined_captures: Counter,
    pub artifacts_purged: Counter,
    pub capture_duration: Histogram,
    pub in_flight_captures: Gauge,
}

impl Metrics {
    pub fn new() -> Self {
        describe_counter!("og_preview_cache_hits_total", "Requests served from an existing artifact");
        describe_counter!("og_preview_cache_misses_total", "Requests that needed a capture");
        describe_counter!("og_preview_captures_total", "Browser captures by result");
        describe_counter!(
            "og_preview_fallback_captures_total",
            "Captures that fell back to the full viewport"
        );
        describe_counter!(
            "og_preview_joined_captures_total",
            "Requests that attached to a capture already in flight"
        );
        describe_counter!("og_preview_artifacts_purged_total", "Artifacts removed by purge");
        describe_histogram!("og_preview_capture_duration_seconds", "Wall time of one capture");
        describe_gauge!("og_preview_in_flight_captures", "Captures currently running");

        Self {
            cache_hits: counter!("og_preview_cache_hits_total"),
            cache_misses: counter!("og_preview_cache_misses_total"),
            captures_started: counter!("og_preview_captures_total", "result" => "started"),
            captures_succeeded: counter!("og_preview_captures_total", "result" => "success"),
            captures_failed: counter!("og_preview_captures_total", "result" => "failure"),
            fallback_captures: counter!("og_preview_fallback_captures_total"),
            joined_captures: counter!("og_preview_joined_captures_total"),
            artifacts_purged: counter!("og_preview_artifacts_purged_total"),
            capture_duration: histogram!("og_preview_capture_duration_seconds"),
            in_flight_captures: gauge!("og_preview_in_flight_captures"),
        }
    }

    pub fn record_cache_lookup(&self, hit: bool) {
        if hit {
            self.cache_hits.increment(1);
        } else {
            self.cache_misses.increment(1);
        }
    }

    pub fn record_capture_started(&self) {
        self.captures_started.increment(1);
        self.in_flight_captures.increment(1.0);
    }

    pub fn record_capture_finished(&self, duration: Duration, success: bool) {
        if success {
            self.captures_succeeded.increment(1);
        } else {
            self.captures_failed.increment(1);
        }
        self.in_flight_captures.decrement(1.0);
        self.capture_duration.record(duration.as_secs_f64());
    }

    pub fn record_fallback(&self) {
        self.fallback_captures.increment(1);
    }

    pub fn record_joined(&self) {
        self.joined_captures.increment(1);
    }

    pub fn record_purge(&self, removed: usize) {
        self.artifacts_purged.increment(removed as u64);
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

pub struct PrometheusExporter;

impl PrometheusExporter {
    /// Install the global Prometheus recorder.
    ///
    /// Must run before [`Metrics::new`] so the handles bind to it. The
    /// returned handle renders the text exposition for `/metrics`.
    pub fn install() -> Result<PrometheusHandle, crate::PreviewError> {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .map_err(|e| crate::PreviewError::ConfigurationError(e.to_string()))?;

        info!("Prometheus recorder installed");
        Ok(handle)
    }
}

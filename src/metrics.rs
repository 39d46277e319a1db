// src/metrics.rs
use axum::{routing::get, Router};
use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

/// One-time metrics registration (so series show up on /metrics).
pub fn ensure_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("refresh_attempts_total", "Refresh attempts per source.");
        describe_counter!(
            "refresh_fetched_total",
            "Fresh bodies fetched and committed per source."
        );
        describe_counter!(
            "refresh_not_modified_total",
            "Conditional fetches answered 304 per source."
        );
        describe_counter!("refresh_errors_total", "Fetch/store failures per source.");
        describe_counter!(
            "refresh_contended_total",
            "Refreshes skipped because another worker held the lock."
        );
        describe_counter!(
            "normalize_parse_errors_total",
            "Upstream documents that failed to parse."
        );
        describe_counter!("normalize_items_total", "Normalized items produced.");
        describe_counter!("dispatch_sent_total", "Push messages emitted.");
        describe_counter!(
            "dispatch_invalid_tokens_total",
            "Tokens the gateway reported invalid."
        );
        describe_gauge!(
            "pipeline_last_refresh_ts",
            "Unix ts of the last completed refresh cycle."
        );
    });
}

pub struct Metrics {
    pub handle: PrometheusHandle,
}

impl Metrics {
    /// Initialize the Prometheus recorder. Call once at startup, before
    /// any counters are touched.
    pub fn init() -> Self {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .expect("prometheus: install recorder");
        ensure_described();
        Self { handle }
    }

    /// Router exposing `/metrics` in the Prometheus exposition format.
    pub fn router(&self) -> Router {
        let handle = self.handle.clone();
        Router::new().route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        )
    }
}

use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Histogram bucket boundaries for latency metrics (seconds). The decision
/// path is sub-millisecond on a healthy store, so the low end is denser than
/// a typical HTTP-latency histogram.
const DECISION_LATENCY_BUCKETS: &[f64] = &[
    0.0001, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0,
];

const HTTP_LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
];

/// Thin handle around the global metrics recorder.
///
/// After `Metrics::install()` the `metrics` crate macros (`counter!`, `gauge!`,
/// `histogram!`) can be used anywhere in the codebase. The `PrometheusHandle`
/// is retained solely for rendering the `/metrics` endpoint.
#[derive(Clone)]
pub struct Metrics {
    handle: PrometheusHandle,
}

impl Metrics {
    /// Install the global Prometheus recorder and register metric descriptions.
    ///
    /// Must be called **once** at startup before any `counter!` / `gauge!` /
    /// `histogram!` calls.
    pub fn install() -> Self {
        let handle = PrometheusBuilder::new()
            .set_buckets_for_metric(
                metrics_exporter_prometheus::Matcher::Full(
                    "ratelimit_decision_duration_seconds".to_string(),
                ),
                DECISION_LATENCY_BUCKETS,
            )
            .expect("valid matcher")
            .set_buckets_for_metric(
                metrics_exporter_prometheus::Matcher::Full(
                    "ratelimit_http_request_duration_seconds".to_string(),
                ),
                HTTP_LATENCY_BUCKETS,
            )
            .expect("valid matcher")
            .install_recorder()
            .expect("failed to install metrics recorder");

        // --- Describe all metrics (adds HELP / TYPE lines) ---

        // decisions
        describe_counter!(
            "ratelimit_decisions_total",
            Unit::Count,
            "Total rate-limit decisions by algorithm and result"
        );
        describe_histogram!(
            "ratelimit_decision_duration_seconds",
            Unit::Seconds,
            "Time spent inside a single strategy's decide() call"
        );

        // store
        describe_counter!(
            "ratelimit_store_errors_total",
            Unit::Count,
            "Store failures by kind (unavailable, script_error)"
        );

        // config resolver
        describe_counter!(
            "ratelimit_config_cache_hits_total",
            Unit::Count,
            "Config resolver exact-key cache hits"
        );
        describe_counter!(
            "ratelimit_config_cache_misses_total",
            Unit::Count,
            "Config resolver exact-key cache misses"
        );
        describe_counter!(
            "ratelimit_config_reloads_total",
            Unit::Count,
            "Config hot-reload events by result"
        );
        describe_gauge!(
            "ratelimit_patterns_total",
            Unit::Count,
            "Number of compiled wildcard patterns currently cached"
        );

        // HTTP boundary
        describe_gauge!(
            "ratelimit_http_requests_in_flight",
            Unit::Count,
            "Number of HTTP requests currently being processed"
        );
        describe_histogram!(
            "ratelimit_http_request_duration_seconds",
            Unit::Seconds,
            "Total HTTP request duration from accept to response"
        );
        describe_counter!(
            "ratelimit_connections_total",
            Unit::Count,
            "Total connections accepted"
        );
        describe_gauge!(
            "ratelimit_connections_active",
            Unit::Count,
            "Number of active downstream connections"
        );

        Self { handle }
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

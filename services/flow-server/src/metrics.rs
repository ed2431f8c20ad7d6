//! Prometheus metrics exposition
//!
//! Library crates record through the `metrics` facade; this module installs
//! the recorder and adds the per-route HTTP metrics:
//!
//! - `http_requests_total` (counter): labels `route`, `method`, `status`
//! - `http_request_duration_seconds` (histogram): label `route`

use std::time::Instant;

use axum::extract::{MatchedPath, Request};
use axum::middleware::Next;
use axum::response::Response;
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};

/// Histograms rendered with `_bucket` lines instead of summaries.
const HISTOGRAMS: &[&str] = &[
    "http_request_duration_seconds",
    "token_exchange_duration_seconds",
    "jwks_fetch_duration_seconds",
];

/// 5ms to 30s, matching the callback timeout ceiling.
const BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

fn builder() -> Result<PrometheusBuilder, BuildError> {
    HISTOGRAMS.iter().try_fold(PrometheusBuilder::new(), |builder, name| {
        builder.set_buckets_for_metric(Matcher::Full((*name).to_string()), BUCKETS)
    })
}

/// Install the global Prometheus recorder and return a handle for `/metrics`.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    builder()?.install_recorder()
}

/// Record a completed request.
pub fn record_request(route: &str, method: &str, status: u16, duration_secs: f64) {
    metrics::counter!(
        "http_requests_total",
        "route" => route.to_string(),
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    metrics::histogram!("http_request_duration_seconds", "route" => route.to_string())
        .record(duration_secs);
}

/// Middleware timing every routed request. Labels by route template so
/// flow ids do not explode cardinality.
pub async fn track_requests(request: Request, next: Next) -> Response {
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_owned())
        .unwrap_or_else(|| "unmatched".to_owned());
    let method = request.method().to_string();
    let started = Instant::now();

    let response = next.run(request).await;

    record_request(
        &route,
        &method,
        response.status().as_u16(),
        started.elapsed().as_secs_f64(),
    );
    response
}

#[cfg(test)]
pub(crate) fn test_handle() -> PrometheusHandle {
    PrometheusBuilder::new().build_recorder().handle()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_request_without_recorder_is_a_no_op() {
        record_request("/health", "GET", 200, 0.01);
    }

    #[test]
    fn request_metrics_render_with_buckets() {
        let recorder = builder().unwrap().build_recorder();
        let handle = recorder.handle();
        let _guard = metrics::set_default_local_recorder(&recorder);

        record_request("/flows/{id}", "GET", 404, 0.003);
        metrics::histogram!("token_exchange_duration_seconds").record(0.2);

        let output = handle.render();
        assert!(output.contains("http_requests_total"));
        assert!(output.contains("route=\"/flows/{id}\""));
        assert!(output.contains("status=\"404\""));
        assert!(output.contains("http_request_duration_seconds_bucket"));
        assert!(output.contains("token_exchange_duration_seconds_bucket"));
        assert!(output.contains("le=\"30\""));
    }
}

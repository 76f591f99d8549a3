//! Prometheus metrics for the node.
//!
//! Request counts and latencies are recorded by [`track_http`] for every
//! routed request. Registry and identity gauges are sampled when the
//! `/metrics` endpoint is scraped, so they never go stale between scrapes.

use anyhow::Context;
use axum::{
    extract::{MatchedPath, Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::Arc;
use std::time::Instant;
use tracing::warn;

use crate::state::AppState;

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

/// Install the process-wide Prometheus recorder.
pub fn install_recorder() -> anyhow::Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install Prometheus recorder")
}

/// Count and time each request, labelled by its route template.
pub async fn track_http(request: Request, next: Next) -> Response {
    let started = Instant::now();
    let method = request.method().to_string();
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|matched| matched.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());

    let response = next.run(request).await;

    let status = response.status().as_u16().to_string();
    counter!(
        "omnicore_http_requests_total",
        "method" => method.clone(),
        "path" => path.clone(),
        "status" => status
    )
    .increment(1);
    histogram!(
        "omnicore_http_request_duration_ms",
        "method" => method,
        "path" => path
    )
    .record(started.elapsed().as_secs_f64() * 1000.0);

    response
}

pub fn record_registration() {
    counter!("omnicore_registrations_total").increment(1);
}

/// Sample registry, client and session gauges.
pub fn refresh_gauges(state: &AppState) {
    match state.identity.sessions().active_count() {
        Ok(active) => gauge!("omnicore_active_sessions").set(active as f64),
        Err(e) => warn!(error = %e, "Could not sample session count"),
    }
    match state.identity.keys().stats() {
        Ok(stats) => {
            gauge!("omnicore_registered_clients").set(stats.completed as f64);
            gauge!("omnicore_pending_clients").set(stats.pending as f64);
        }
        Err(e) => warn!(error = %e, "Could not sample client counts"),
    }
    match state.registry.stats() {
        Ok(stats) => {
            gauge!("omnicore_known_servers").set(stats.total as f64);
            gauge!("omnicore_authenticated_servers").set(stats.authenticated_count as f64);
        }
        Err(e) => warn!(error = %e, "Could not sample registry counts"),
    }
}

/// `GET /metrics` in the Prometheus text format.
pub async fn render(State(state): State<Arc<AppState>>) -> Response {
    let Some(handle) = state.metrics.as_ref() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    refresh_gauges(&state);
    (
        [(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)],
        handle.render(),
    )
        .into_response()
}

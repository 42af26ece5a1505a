//! Prometheus metrics

use axum::http::StatusCode;
use axum::response::IntoResponse;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

static PROMETHEUS: OnceCell<PrometheusHandle> = OnceCell::new();

/// Install the global Prometheus recorder
///
/// Safe to call more than once; later calls return the first handle.
pub fn init_metrics() -> Option<PrometheusHandle> {
    let handle = PROMETHEUS.get_or_try_init(|| {
        let handle = PrometheusBuilder::new().install_recorder()?;
        describe_metrics();
        Ok::<_, metrics_exporter_prometheus::BuildError>(handle)
    });

    match handle {
        Ok(handle) => Some(handle.clone()),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to install Prometheus recorder");
            None
        }
    }
}

fn describe_metrics() {
    metrics::describe_gauge!("phone_agent_active_calls", "Media-stream connections currently open");
    metrics::describe_counter!(
        "phone_agent_interruptions_total",
        "Replies stopped because the caller spoke"
    );
    metrics::describe_counter!("phone_agent_escalations_total", "Calls handed to a human");
    metrics::describe_counter!(
        "phone_agent_fallback_replies_total",
        "Fallback utterances spoken after a collaborator failure"
    );
    metrics::describe_counter!(
        "phone_agent_collaborator_errors_total",
        "Collaborator failures by kind"
    );
    metrics::describe_histogram!(
        "phone_agent_retrieval_latency_seconds",
        metrics::Unit::Seconds,
        "Retrieval round trip"
    );
    metrics::describe_histogram!(
        "phone_agent_first_fragment_latency_seconds",
        metrics::Unit::Seconds,
        "Time from model request to first reply fragment"
    );
    metrics::describe_histogram!(
        "phone_agent_synthesis_latency_seconds",
        metrics::Unit::Seconds,
        "Synthesis time per chunk"
    );
}

/// `GET /metrics`
pub async fn metrics_handler() -> impl IntoResponse {
    match PROMETHEUS.get() {
        Some(handle) => (StatusCode::OK, handle.render()),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            "metrics recorder not installed".to_string(),
        ),
    }
}

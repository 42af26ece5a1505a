//! HTTP Endpoints

use axum::{
    extract::{Json, State},
    http::StatusCode,
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::media_stream::media_stream_handler;
use crate::metrics::metrics_handler;
use crate::state::{ActiveCall, AppState};

/// Create the application router
pub fn create_router(state: AppState) -> Router {
    let media_stream_path = state.get_config().server.media_stream_path.clone();

    Router::new()
        // Telephony media stream
        .route(&media_stream_path, get(media_stream_handler))
        // Health check
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        // Prometheus metrics
        .route("/metrics", get(metrics_handler))
        // Admin endpoints
        .route("/admin/calls", get(list_calls))
        .route("/admin/reload-config", post(reload_config))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Ready while there is room for another call
async fn readiness_check(State(state): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    let active = state.calls.count();
    let limit = state.calls.limit();
    let ready = active < limit;

    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(serde_json::json!({
            "status": if ready { "ready" } else { "at_capacity" },
            "active_calls": active,
            "max_concurrent_calls": limit,
        })),
    )
}

async fn list_calls(State(state): State<AppState>) -> Json<Vec<ActiveCall>> {
    Json(state.calls.list())
}

async fn reload_config(State(state): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    match state.reload_config() {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({ "status": "reloaded" })),
        ),
        Err(e) => {
            tracing::error!(error = %e, "Config reload failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "status": "error", "message": e.to_string() })),
            )
        }
    }
}

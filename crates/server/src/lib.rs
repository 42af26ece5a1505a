//! Phone Agent Server
//!
//! Accepts telephony media-stream WebSocket connections and runs one call
//! session per connection. Also serves health, readiness and Prometheus
//! endpoints.

pub mod http;
pub mod media_stream;
pub mod metrics;
pub mod state;
pub mod twilio;

pub use http::create_router;
pub use metrics::init_metrics;
pub use state::{build_collaborators, ActiveCall, AppState, CallGuard, CallRegistry};
pub use twilio::{TwilioCallTransfer, TwilioConfig};

use thiserror::Error;

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Call capacity reached ({0} active calls)")]
    Capacity(usize),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<phone_agent_config::ConfigError> for ServerError {
    fn from(err: phone_agent_config::ConfigError) -> Self {
        ServerError::Config(err.to_string())
    }
}

impl From<ServerError> for axum::http::StatusCode {
    fn from(err: ServerError) -> Self {
        match err {
            ServerError::InvalidRequest(_) => axum::http::StatusCode::BAD_REQUEST,
            ServerError::WebSocket(_) => axum::http::StatusCode::BAD_REQUEST,
            ServerError::Capacity(_) => axum::http::StatusCode::SERVICE_UNAVAILABLE,
            ServerError::Config(_) => axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            ServerError::Internal(_) => axum::http::StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

//! Retrieval and escalation services
//!
//! Features:
//! - HTTP client for the retrieval / escalation-intent service
//! - Escalation log sinks (JSON lines file, tracing only)

pub mod client;
pub mod escalation_log;

pub use client::{RetrievalClient, RetrievalConfig};
pub use escalation_log::{JsonlEscalationLog, TracingEscalationLog};

use thiserror::Error;

/// RAG errors
#[derive(Error, Debug)]
pub enum RagError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Service error: {0}")]
    Service(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Timeout")]
    Timeout,

    #[error("Log write error: {0}")]
    LogWrite(String),
}

impl From<reqwest::Error> for RagError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            RagError::Timeout
        } else if err.is_decode() {
            RagError::InvalidResponse(err.to_string())
        } else {
            RagError::Connection(err.to_string())
        }
    }
}

impl From<std::io::Error> for RagError {
    fn from(err: std::io::Error) -> Self {
        RagError::LogWrite(err.to_string())
    }
}

impl From<RagError> for phone_agent_core::Error {
    fn from(err: RagError) -> Self {
        match err {
            RagError::LogWrite(_) => phone_agent_core::Error::EscalationLog(err.to_string()),
            _ => phone_agent_core::Error::Retrieval(err.to_string()),
        }
    }
}

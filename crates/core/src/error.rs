//! Error types shared by every collaborator boundary

use thiserror::Error;

/// Core error type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Recognizer error: {0}")]
    Recognizer(String),

    #[error("Retrieval error: {0}")]
    Retrieval(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Synthesis error: {0}")]
    Synthesis(String),

    #[error("Transfer error: {0}")]
    Transfer(String),

    #[error("Escalation log error: {0}")]
    EscalationLog(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Cancelled")]
    Cancelled,
}

impl Error {
    /// Short label used for metrics and structured logs
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Transport(_) => "transport",
            Error::Recognizer(_) => "recognizer",
            Error::Retrieval(_) => "retrieval",
            Error::Llm(_) => "llm",
            Error::Synthesis(_) => "synthesis",
            Error::Transfer(_) => "transfer",
            Error::EscalationLog(_) => "escalation_log",
            Error::Config(_) => "config",
            Error::Cancelled => "cancelled",
        }
    }
}

/// Result alias for core operations
pub type Result<T> = std::result::Result<T, Error>;

//! Language model integration
//!
//! Features:
//! - OpenAI-compatible chat completions with SSE streaming
//! - Delimiter-based fragment splitting for low-latency speech
//! - Adapter to the core `LanguageModel` trait

pub mod adapter;
pub mod backend;
pub mod fragment;

pub use adapter::LanguageModelAdapter;
pub use backend::{GenerationResult, LlmBackend, OpenAIBackend, OpenAIConfig};
pub use fragment::FragmentSplitter;

use thiserror::Error;

/// LLM errors
#[derive(Error, Debug)]
pub enum LlmError {
    #[error("Generation error: {0}")]
    Generation(String),

    #[error("API error: {0}")]
    Api(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Timeout")]
    Timeout,

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            LlmError::Timeout
        } else {
            LlmError::Network(err.to_string())
        }
    }
}

impl From<LlmError> for phone_agent_core::Error {
    fn from(err: LlmError) -> Self {
        phone_agent_core::Error::Llm(err.to_string())
    }
}

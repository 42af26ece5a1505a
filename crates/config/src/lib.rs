//! Configuration management for the phone agent
//!
//! Supports loading configuration from:
//! - TOML/YAML/JSON files under `config/` (`default`, then the environment overlay)
//! - Environment variables (PHONE_AGENT__ prefix, `__` section separator)

pub mod settings;

pub use settings::{
    load_settings, load_settings_from, EscalationLogConfig, LlmSettings, ObservabilityConfig,
    RecognizerSettings, RetrievalSettings, ServerConfig, SessionConfig, Settings,
    SynthesisSettings, TelephonyConfig,
};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("Environment error: {0}")]
    Environment(String),
}

impl From<config::ConfigError> for ConfigError {
    fn from(err: config::ConfigError) -> Self {
        ConfigError::ParseError(err.to_string())
    }
}

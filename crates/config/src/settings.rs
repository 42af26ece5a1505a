//! Main settings module

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// Main application settings
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Per-call session behaviour
    #[serde(default)]
    pub session: SessionConfig,

    /// Streaming speech recognizer
    #[serde(default)]
    pub recognizer: RecognizerSettings,

    /// Speech synthesis
    #[serde(default)]
    pub synthesis: SynthesisSettings,

    /// Language model backend
    #[serde(default)]
    pub llm: LlmSettings,

    /// Retrieval / escalation-intent service
    #[serde(default)]
    pub retrieval: RetrievalSettings,

    /// Telephony provider REST API (call transfer)
    #[serde(default)]
    pub telephony: TelephonyConfig,

    /// Escalation log sink
    #[serde(default)]
    pub escalation_log: EscalationLogConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Settings {
    /// Create default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate settings
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_server()?;
        self.validate_session()?;
        self.validate_collaborators()?;
        Ok(())
    }

    fn validate_server(&self) -> Result<(), ConfigError> {
        let server = &self.server;

        if server.port == 0 {
            return Err(ConfigError::InvalidValue {
                field: "server.port".to_string(),
                message: "Port cannot be 0".to_string(),
            });
        }

        if server.max_concurrent_calls == 0 {
            return Err(ConfigError::InvalidValue {
                field: "server.max_concurrent_calls".to_string(),
                message: "Max concurrent calls must be at least 1".to_string(),
            });
        }

        if !server.media_stream_path.starts_with('/') {
            return Err(ConfigError::InvalidValue {
                field: "server.media_stream_path".to_string(),
                message: format!("Must start with '/', got {}", server.media_stream_path),
            });
        }

        Ok(())
    }

    fn validate_session(&self) -> Result<(), ConfigError> {
        let session = &self.session;

        if session.greeting.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "session.greeting".to_string(),
                message: "Greeting cannot be empty".to_string(),
            });
        }

        if session.fallback_reply.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "session.fallback_reply".to_string(),
                message: "Fallback reply cannot be empty".to_string(),
            });
        }

        if session.fragment_delimiter.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "session.fragment_delimiter".to_string(),
                message: "Fragment delimiter cannot be empty".to_string(),
            });
        }

        if session.event_buffer == 0 {
            return Err(ConfigError::InvalidValue {
                field: "session.event_buffer".to_string(),
                message: "Event buffer must be at least 1".to_string(),
            });
        }

        Ok(())
    }

    fn validate_collaborators(&self) -> Result<(), ConfigError> {
        if self.recognizer.sample_rate == 0 {
            return Err(ConfigError::InvalidValue {
                field: "recognizer.sample_rate".to_string(),
                message: "Sample rate cannot be 0".to_string(),
            });
        }

        if !(0.0..=2.0).contains(&self.llm.temperature) {
            return Err(ConfigError::InvalidValue {
                field: "llm.temperature".to_string(),
                message: format!("Must be between 0.0 and 2.0, got {}", self.llm.temperature),
            });
        }

        if self.llm.max_tokens == 0 {
            return Err(ConfigError::InvalidValue {
                field: "llm.max_tokens".to_string(),
                message: "Max tokens must be at least 1".to_string(),
            });
        }

        if self.retrieval.top_k == 0 {
            return Err(ConfigError::InvalidValue {
                field: "retrieval.top_k".to_string(),
                message: "top_k must be at least 1".to_string(),
            });
        }

        for (field, secs) in [
            ("synthesis.timeout_secs", self.synthesis.timeout_secs),
            ("llm.timeout_secs", self.llm.timeout_secs),
            ("retrieval.timeout_secs", self.retrieval.timeout_secs),
            ("telephony.timeout_secs", self.telephony.timeout_secs),
        ] {
            if secs == 0 {
                return Err(ConfigError::InvalidValue {
                    field: field.to_string(),
                    message: "Timeout must be at least 1 second".to_string(),
                });
            }
        }

        Ok(())
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP server host
    #[serde(default = "default_host")]
    pub host: String,

    /// HTTP server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Media-stream WebSocket path
    #[serde(default = "default_media_stream_path")]
    pub media_stream_path: String,

    /// Maximum concurrent calls; further upgrades are refused with 503
    #[serde(default = "default_max_concurrent_calls")]
    pub max_concurrent_calls: usize,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_media_stream_path() -> String {
    "/media-stream".to_string()
}
fn default_max_concurrent_calls() -> usize {
    100
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            media_stream_path: default_media_stream_path(),
            max_concurrent_calls: default_max_concurrent_calls(),
        }
    }
}

/// Per-call session behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Spoken as soon as the stream starts
    #[serde(default = "default_greeting")]
    pub greeting: String,

    /// Spoken once when a collaborator fails and nothing else would be said
    #[serde(default = "default_fallback_reply")]
    pub fallback_reply: String,

    /// Destination for human hand-off
    #[serde(default)]
    pub escalation_target: String,

    /// System prompt placed first in conversation memory
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,

    /// Marker the model places between speakable phrases
    #[serde(default = "default_fragment_delimiter")]
    pub fragment_delimiter: String,

    /// Capacity of each session's event queue
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

fn default_greeting() -> String {
    "Hello! Thanks for calling. How can I help you today?".to_string()
}
fn default_fallback_reply() -> String {
    "I'm sorry, I'm temporarily unavailable. Please try again in a moment.".to_string()
}
fn default_system_prompt() -> String {
    concat!(
        "You are a friendly phone assistant. Keep answers short and conversational. ",
        "Place a • character between every short phrase of your reply so it can be ",
        "spoken while you are still answering. Use the supplied context when it is relevant."
    )
    .to_string()
}
fn default_fragment_delimiter() -> String {
    "•".to_string()
}
fn default_event_buffer() -> usize {
    256
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            greeting: default_greeting(),
            fallback_reply: default_fallback_reply(),
            escalation_target: String::new(),
            system_prompt: default_system_prompt(),
            fragment_delimiter: default_fragment_delimiter(),
            event_buffer: default_event_buffer(),
        }
    }
}

/// Deepgram live recognizer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecognizerSettings {
    #[serde(default = "default_recognizer_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_recognizer_model")]
    pub model: String,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default = "default_encoding")]
    pub encoding: String,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    /// Silence (ms) before a segment is marked speech-final
    #[serde(default = "default_endpointing_ms")]
    pub endpointing_ms: u32,
    #[serde(default = "default_utterance_end_ms")]
    pub utterance_end_ms: u32,
}

fn default_recognizer_endpoint() -> String {
    "wss://api.deepgram.com/v1/listen".to_string()
}
fn default_recognizer_model() -> String {
    "nova-2-phonecall".to_string()
}
fn default_language() -> String {
    "en-US".to_string()
}
fn default_encoding() -> String {
    "mulaw".to_string()
}
fn default_sample_rate() -> u32 {
    8000
}
fn default_endpointing_ms() -> u32 {
    300
}
fn default_utterance_end_ms() -> u32 {
    1000
}

impl Default for RecognizerSettings {
    fn default() -> Self {
        Self {
            endpoint: default_recognizer_endpoint(),
            api_key: String::new(),
            model: default_recognizer_model(),
            language: default_language(),
            encoding: default_encoding(),
            sample_rate: default_sample_rate(),
            endpointing_ms: default_endpointing_ms(),
            utterance_end_ms: default_utterance_end_ms(),
        }
    }
}

/// ElevenLabs synthesis
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisSettings {
    #[serde(default = "default_synthesis_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_voice_id")]
    pub voice_id: String,
    #[serde(default = "default_synthesis_model")]
    pub model_id: String,
    #[serde(default = "default_output_format")]
    pub output_format: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_synthesis_endpoint() -> String {
    "https://api.elevenlabs.io".to_string()
}
fn default_voice_id() -> String {
    "21m00Tcm4TlvDq8ikWAM".to_string()
}
fn default_synthesis_model() -> String {
    "eleven_turbo_v2_5".to_string()
}
fn default_output_format() -> String {
    "ulaw_8000".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}

impl Default for SynthesisSettings {
    fn default() -> Self {
        Self {
            endpoint: default_synthesis_endpoint(),
            api_key: String::new(),
            voice_id: default_voice_id(),
            model_id: default_synthesis_model(),
            output_format: default_output_format(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// OpenAI-compatible language model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmSettings {
    #[serde(default = "default_llm_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_llm_endpoint() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_llm_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_max_tokens() -> u32 {
    256
}
fn default_temperature() -> f32 {
    0.7
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            endpoint: default_llm_endpoint(),
            api_key: String::new(),
            model: default_llm_model(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// Retrieval / escalation-intent service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalSettings {
    #[serde(default = "default_retrieval_endpoint")]
    pub endpoint: String,
    /// Number of chunks requested per query
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_retrieval_timeout")]
    pub timeout_secs: u64,
}

fn default_retrieval_endpoint() -> String {
    "http://127.0.0.1:8000".to_string()
}
fn default_top_k() -> usize {
    4
}
fn default_retrieval_timeout() -> u64 {
    10
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self {
            endpoint: default_retrieval_endpoint(),
            top_k: default_top_k(),
            timeout_secs: default_retrieval_timeout(),
        }
    }
}

/// Twilio REST API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelephonyConfig {
    #[serde(default = "default_telephony_api_base")]
    pub api_base: String,
    #[serde(default)]
    pub account_sid: String,
    #[serde(default)]
    pub auth_token: String,
    #[serde(default = "default_retrieval_timeout")]
    pub timeout_secs: u64,
}

fn default_telephony_api_base() -> String {
    "https://api.twilio.com".to_string()
}

impl Default for TelephonyConfig {
    fn default() -> Self {
        Self {
            api_base: default_telephony_api_base(),
            account_sid: String::new(),
            auth_token: String::new(),
            timeout_secs: default_retrieval_timeout(),
        }
    }
}

/// Escalation log sink
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EscalationLogConfig {
    /// JSON-lines file; when unset hand-offs are only logged through tracing
    #[serde(default)]
    pub path: Option<String>,
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default)]
    pub log_json: bool,

    /// Enable metrics
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_json: false,
            metrics_enabled: true,
        }
    }
}

/// Load settings from `config/` and the environment
pub fn load_settings(env: Option<&str>) -> Result<Settings, ConfigError> {
    load_settings_from("config", env)
}

/// Load settings from `{dir}/default.*`, `{dir}/{env}.*` and `PHONE_AGENT__*` variables
pub fn load_settings_from(dir: &str, env: Option<&str>) -> Result<Settings, ConfigError> {
    let mut builder = Config::builder();

    // Load default config
    builder = builder.add_source(File::with_name(&format!("{}/default", dir)).required(false));

    // Load environment-specific config
    if let Some(env_name) = env {
        builder =
            builder.add_source(File::with_name(&format!("{}/{}", dir, env_name)).required(false));
    }

    // Load from environment variables
    builder = builder.add_source(
        Environment::with_prefix("PHONE_AGENT")
            .separator("__")
            .try_parsing(true),
    );

    let config = builder.build()?;
    let settings: Settings = config.try_deserialize()?;

    settings.validate()?;

    Ok(settings)
}

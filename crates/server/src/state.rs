//! Application State
//!
//! Shared state across all handlers.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use phone_agent_agent::Collaborators;
use phone_agent_config::{load_settings, Settings};
use phone_agent_core::EscalationLog;
use phone_agent_llm::{LanguageModelAdapter, OpenAIBackend, OpenAIConfig};
use phone_agent_pipeline::{
    DeepgramConfig, DeepgramRecognizer, ElevenLabsConfig, ElevenLabsSynthesizer,
};
use phone_agent_rag::{JsonlEscalationLog, RetrievalClient, RetrievalConfig, TracingEscalationLog};

use crate::twilio::{TwilioCallTransfer, TwilioConfig};
use crate::ServerError;

/// Application state
#[derive(Clone)]
pub struct AppState {
    /// Configuration wrapped in RwLock for hot-reload support
    pub config: Arc<RwLock<Settings>>,
    /// Collaborators shared by every call
    pub collaborators: Collaborators,
    /// Live calls
    pub calls: Arc<CallRegistry>,
    /// Environment name for config reload
    env: Option<String>,
}

impl AppState {
    pub fn new(config: Settings, collaborators: Collaborators) -> Self {
        let calls = Arc::new(CallRegistry::new(config.server.max_concurrent_calls));
        Self {
            config: Arc::new(RwLock::new(config)),
            collaborators,
            calls,
            env: None,
        }
    }

    /// Remember the environment name used by [`AppState::reload_config`]
    pub fn with_env(mut self, env: Option<String>) -> Self {
        self.env = env;
        self
    }

    /// Reload configuration from files
    ///
    /// Calls already in progress keep the settings they started with.
    pub fn reload_config(&self) -> Result<(), ServerError> {
        let new_config = load_settings(self.env.as_deref())?;
        self.calls.set_limit(new_config.server.max_concurrent_calls);

        let mut config = self.config.write();
        *config = new_config;

        tracing::info!("Configuration reloaded successfully");
        Ok(())
    }

    /// Get a read guard to the current configuration
    pub fn get_config(&self) -> parking_lot::RwLockReadGuard<'_, Settings> {
        self.config.read()
    }
}

/// A call currently connected
#[derive(Debug, Clone, Serialize)]
pub struct ActiveCall {
    pub connection_id: Uuid,
    pub call_id: Option<String>,
    pub connected_at: DateTime<Utc>,
}

/// Bounded registry of live media-stream connections
pub struct CallRegistry {
    calls: RwLock<HashMap<Uuid, ActiveCall>>,
    limit: AtomicUsize,
}

impl CallRegistry {
    pub fn new(limit: usize) -> Self {
        Self {
            calls: RwLock::new(HashMap::new()),
            limit: AtomicUsize::new(limit),
        }
    }

    /// Reserve a slot; `None` when the server is at capacity
    pub fn try_register(self: &Arc<Self>) -> Option<CallGuard> {
        let mut calls = self.calls.write();
        if calls.len() >= self.limit() {
            return None;
        }

        let connection_id = Uuid::new_v4();
        calls.insert(
            connection_id,
            ActiveCall {
                connection_id,
                call_id: None,
                connected_at: Utc::now(),
            },
        );
        metrics::gauge!("phone_agent_active_calls").set(calls.len() as f64);
        Some(CallGuard {
            registry: Arc::clone(self),
            connection_id,
        })
    }

    pub fn count(&self) -> usize {
        self.calls.read().len()
    }

    pub fn limit(&self) -> usize {
        self.limit.load(Ordering::Relaxed)
    }

    pub fn set_limit(&self, limit: usize) {
        self.limit.store(limit, Ordering::Relaxed);
    }

    /// Snapshot of live calls, oldest first
    pub fn list(&self) -> Vec<ActiveCall> {
        let mut calls: Vec<ActiveCall> = self.calls.read().values().cloned().collect();
        calls.sort_by_key(|c| c.connected_at);
        calls
    }

    fn bind(&self, connection_id: Uuid, call_id: &str) {
        if let Some(call) = self.calls.write().get_mut(&connection_id) {
            call.call_id = Some(call_id.to_string());
        }
    }

    fn release(&self, connection_id: Uuid) {
        let mut calls = self.calls.write();
        calls.remove(&connection_id);
        metrics::gauge!("phone_agent_active_calls").set(calls.len() as f64);
    }
}

/// Slot held for the lifetime of one connection
pub struct CallGuard {
    registry: Arc<CallRegistry>,
    connection_id: Uuid,
}

impl CallGuard {
    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    /// Attach the telephony call id once the stream has started
    pub fn bind_call(&self, call_id: &str) {
        self.registry.bind(self.connection_id, call_id);
    }
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        self.registry.release(self.connection_id);
    }
}

/// Build the production collaborators from settings
pub fn build_collaborators(settings: &Settings) -> Result<Collaborators, ServerError> {
    let recognizer = DeepgramRecognizer::new(DeepgramConfig {
        endpoint: settings.recognizer.endpoint.clone(),
        api_key: settings.recognizer.api_key.clone(),
        model: settings.recognizer.model.clone(),
        language: settings.recognizer.language.clone(),
        encoding: settings.recognizer.encoding.clone(),
        sample_rate: settings.recognizer.sample_rate,
        endpointing_ms: settings.recognizer.endpointing_ms,
        utterance_end_ms: settings.recognizer.utterance_end_ms,
    });

    let retriever = RetrievalClient::new(RetrievalConfig {
        endpoint: settings.retrieval.endpoint.clone(),
        top_k: settings.retrieval.top_k,
        timeout: Duration::from_secs(settings.retrieval.timeout_secs),
    })
    .map_err(|e| ServerError::Config(format!("retrieval client: {}", e)))?;

    let backend = OpenAIBackend::new(OpenAIConfig {
        endpoint: settings.llm.endpoint.clone(),
        api_key: settings.llm.api_key.clone(),
        model: settings.llm.model.clone(),
        max_tokens: settings.llm.max_tokens as usize,
        temperature: settings.llm.temperature,
        timeout: Duration::from_secs(settings.llm.timeout_secs),
    })
    .map_err(|e| ServerError::Config(format!("language model: {}", e)))?;
    let model = LanguageModelAdapter::new(backend, settings.session.fragment_delimiter.clone());

    let synthesizer = ElevenLabsSynthesizer::new(ElevenLabsConfig {
        endpoint: settings.synthesis.endpoint.clone(),
        api_key: settings.synthesis.api_key.clone(),
        voice_id: settings.synthesis.voice_id.clone(),
        model_id: settings.synthesis.model_id.clone(),
        output_format: settings.synthesis.output_format.clone(),
        timeout: Duration::from_secs(settings.synthesis.timeout_secs),
    })
    .map_err(|e| ServerError::Config(format!("synthesizer: {}", e)))?;

    let transfer = TwilioCallTransfer::new(TwilioConfig::from(&settings.telephony))?;

    let escalation_log: Arc<dyn EscalationLog> = match &settings.escalation_log.path {
        Some(path) => Arc::new(JsonlEscalationLog::new(path)),
        None => Arc::new(TracingEscalationLog),
    };

    Ok(Collaborators {
        recognizer: Arc::new(recognizer),
        retriever: Arc::new(retriever),
        model: Arc::new(model),
        synthesizer: Arc::new(synthesizer),
        transfer: Arc::new(transfer),
        escalation_log,
    })
}

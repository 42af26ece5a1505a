//! Phone call session control
//!
//! Features:
//! - Per-call session state machine (greeting, turns, barge-in, escalation)
//! - Conversation memory reconciled with what the caller actually heard
//! - One-way escalation gate
//! - Session actor wiring the state machine to recognizer, retrieval,
//!   language model, synthesizer and telephony collaborators

pub mod actor;
pub mod escalation;
pub mod memory;
pub mod session;

pub use actor::{spawn_session, Collaborators, SessionHandle};
pub use escalation::{EscalationGate, GateDecision};
pub use memory::ConversationMemory;
pub use session::{CallSession, SessionCommand, SessionEvent, SessionSettings, SessionState};

use thiserror::Error;

/// Agent errors
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Session error: {0}")]
    Session(String),

    #[error("Session channel closed")]
    ChannelClosed,

    #[error("Collaborator error: {0}")]
    Collaborator(#[from] phone_agent_core::Error),
}

impl From<phone_agent_pipeline::PipelineError> for AgentError {
    fn from(err: phone_agent_pipeline::PipelineError) -> Self {
        AgentError::Collaborator(err.into())
    }
}

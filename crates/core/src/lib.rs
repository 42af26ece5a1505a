//! Core traits and types for the phone agent
//!
//! This crate provides foundational types used across all other crates:
//! - Collaborator traits (recognizer, retrieval, language model, synthesis, transfer)
//! - Conversation message types
//! - Media types shared by the transport and the delivery sequencer
//! - Error types

pub mod conversation;
pub mod error;
pub mod media;
pub mod traits;

pub use conversation::{Message, Role};
pub use error::{Error, Result};
pub use media::{CallerId, OrderingKey, OutboundFrame};

pub use traits::{
    CallTransfer, ContextQuery, ContextResult, ContextRetriever, EscalationLog, EscalationRecord,
    LanguageModel, RecognizerEvent, RecognizerStream, ReplyStream, SpeechRecognizer,
    SpeechSynthesizer,
};

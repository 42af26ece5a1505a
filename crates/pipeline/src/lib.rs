//! Outbound audio pipeline for the phone agent
//!
//! This crate provides:
//! - The delivery sequencer (strict-order, gap-free outbound audio)
//! - Streaming speech recognition (Deepgram live)
//! - Speech synthesis (ElevenLabs)

pub mod sequencer;
pub mod stt;
pub mod tts;

pub use sequencer::{Delivery, DeliverySequencer};
pub use stt::{DeepgramConfig, DeepgramRecognizer, TranscriptAssembler};
pub use tts::{ElevenLabsConfig, ElevenLabsSynthesizer};

use thiserror::Error;

/// Pipeline errors
#[derive(Error, Debug, Clone)]
pub enum PipelineError {
    #[error("STT error: {0}")]
    Stt(String),

    #[error("TTS error: {0}")]
    Tts(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Timeout")]
    Timeout,
}

impl From<PipelineError> for phone_agent_core::Error {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::Stt(msg) | PipelineError::Connection(msg) => {
                phone_agent_core::Error::Recognizer(msg)
            }
            PipelineError::Tts(msg) => phone_agent_core::Error::Synthesis(msg),
            PipelineError::ChannelClosed => {
                phone_agent_core::Error::Transport("channel closed".to_string())
            }
            PipelineError::Timeout => phone_agent_core::Error::Synthesis("timeout".to_string()),
        }
    }
}

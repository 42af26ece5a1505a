//! Streaming speech recognition

mod deepgram;

pub use deepgram::{DeepgramConfig, DeepgramMessage, DeepgramRecognizer, TranscriptAssembler};

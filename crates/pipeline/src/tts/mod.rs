//! Speech synthesis

mod elevenlabs;

pub use elevenlabs::{ElevenLabsConfig, ElevenLabsSynthesizer};

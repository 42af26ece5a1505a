//! Speech processing traits

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::Result;

/// Event produced by a live recognizer connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognizerEvent {
    /// Caller is speaking; text may be blank
    Interim(String),
    /// Complete utterance
    Final(String),
    /// The connection failed; no further events follow
    Failed(String),
    /// The connection closed normally
    Closed,
}

/// One live recognition session
///
/// Raw inbound audio is pushed into `audio_tx`; events are read from `events`.
/// Dropping `audio_tx` closes the upstream connection.
pub struct RecognizerStream {
    pub audio_tx: mpsc::Sender<Bytes>,
    pub events: mpsc::Receiver<RecognizerEvent>,
}

/// Streaming speech recognizer
///
/// Implementations:
/// - `DeepgramRecognizer` - Deepgram live streaming over WebSocket
///
/// # Example
///
/// ```ignore
/// let mut stream = recognizer.connect().await?;
/// stream.audio_tx.send(frame).await?;
/// while let Some(event) = stream.events.recv().await {
///     println!("{:?}", event);
/// }
/// ```
#[async_trait]
pub trait SpeechRecognizer: Send + Sync + 'static {
    /// Open a live recognition session for one call
    async fn connect(&self) -> Result<RecognizerStream>;

    /// Get model name for logging
    fn model_name(&self) -> &str;
}

/// Text-to-speech synthesizer
///
/// Implementations:
/// - `ElevenLabsSynthesizer` - ElevenLabs HTTP API, µ-law 8 kHz output
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync + 'static {
    /// Synthesize one text fragment
    ///
    /// # Arguments
    /// * `text` - Fragment to speak
    ///
    /// # Returns
    /// Audio payload in the transport's wire encoding
    async fn synthesize(&self, text: &str) -> Result<Bytes>;

    /// Get voice name for logging
    fn voice_name(&self) -> &str;
}

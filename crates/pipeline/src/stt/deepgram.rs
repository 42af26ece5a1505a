//! Deepgram live streaming recognizer
//!
//! Raw µ-law frames from the telephony transport are forwarded unchanged as
//! binary WebSocket messages. Deepgram answers with `Results` messages: every
//! non-final result becomes an interim-speech event, and final segments are
//! accumulated until the segment flagged `speech_final` (or an `UtteranceEnd`
//! message) closes the utterance.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use phone_agent_core::{RecognizerEvent, RecognizerStream, SpeechRecognizer};
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::Message;
use url::Url;

use crate::PipelineError;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(8);
const AUDIO_BUFFER: usize = 256;
const EVENT_BUFFER: usize = 64;

/// Deepgram configuration
#[derive(Debug, Clone)]
pub struct DeepgramConfig {
    /// Listen endpoint (wss://api.deepgram.com/v1/listen)
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
    pub language: String,
    pub encoding: String,
    pub sample_rate: u32,
    pub endpointing_ms: u32,
    pub utterance_end_ms: u32,
}

impl Default for DeepgramConfig {
    fn default() -> Self {
        Self {
            endpoint: "wss://api.deepgram.com/v1/listen".to_string(),
            api_key: String::new(),
            model: "nova-2-phonecall".to_string(),
            language: "en-US".to_string(),
            encoding: "mulaw".to_string(),
            sample_rate: 8000,
            endpointing_ms: 300,
            utterance_end_ms: 1000,
        }
    }
}

impl DeepgramConfig {
    /// Listen URL with streaming parameters
    pub fn listen_url(&self) -> Result<Url, PipelineError> {
        let mut url = Url::parse(&self.endpoint)
            .map_err(|e| PipelineError::Connection(format!("Invalid endpoint: {}", e)))?;
        url.query_pairs_mut()
            .append_pair("model", &self.model)
            .append_pair("language", &self.language)
            .append_pair("encoding", &self.encoding)
            .append_pair("sample_rate", &self.sample_rate.to_string())
            .append_pair("channels", "1")
            .append_pair("interim_results", "true")
            .append_pair("punctuate", "true")
            .append_pair("endpointing", &self.endpointing_ms.to_string())
            .append_pair("utterance_end_ms", &self.utterance_end_ms.to_string());
        Ok(url)
    }
}

/// Server messages
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum DeepgramMessage {
    Results {
        channel: Channel,
        #[serde(default)]
        is_final: bool,
        #[serde(default)]
        speech_final: bool,
    },
    UtteranceEnd,
    SpeechStarted,
    Metadata,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Channel {
    #[serde(default)]
    pub alternatives: Vec<Alternative>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Alternative {
    #[serde(default)]
    pub transcript: String,
}

impl DeepgramMessage {
    pub fn parse(text: &str) -> Result<Self, PipelineError> {
        serde_json::from_str(text).map_err(|e| PipelineError::Stt(format!("Bad message: {}", e)))
    }
}

/// Turns Deepgram results into interim / final recognizer events
#[derive(Debug, Default)]
pub struct TranscriptAssembler {
    finals: Vec<String>,
}

impl TranscriptAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_message(&mut self, message: DeepgramMessage) -> Option<RecognizerEvent> {
        match message {
            DeepgramMessage::Results {
                channel,
                is_final,
                speech_final,
            } => {
                let transcript = channel
                    .alternatives
                    .into_iter()
                    .next()
                    .map(|a| a.transcript)
                    .unwrap_or_default();

                if !is_final {
                    return Some(RecognizerEvent::Interim(transcript));
                }

                if !transcript.trim().is_empty() {
                    self.finals.push(transcript.trim().to_string());
                }
                if speech_final {
                    self.take_utterance()
                } else {
                    None
                }
            }
            DeepgramMessage::UtteranceEnd => self.take_utterance(),
            _ => None,
        }
    }

    fn take_utterance(&mut self) -> Option<RecognizerEvent> {
        if self.finals.is_empty() {
            return None;
        }
        let utterance = self.finals.join(" ");
        self.finals.clear();
        Some(RecognizerEvent::Final(utterance))
    }
}

/// Deepgram live recognizer
pub struct DeepgramRecognizer {
    config: DeepgramConfig,
}

impl DeepgramRecognizer {
    pub fn new(config: DeepgramConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl SpeechRecognizer for DeepgramRecognizer {
    async fn connect(&self) -> phone_agent_core::Result<RecognizerStream> {
        let url = self.config.listen_url()?;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| PipelineError::Connection(e.to_string()))?;
        let auth = HeaderValue::from_str(&format!("Token {}", self.config.api_key))
            .map_err(|e| PipelineError::Connection(format!("Invalid API key: {}", e)))?;
        request.headers_mut().insert(AUTHORIZATION, auth);

        let (ws_stream, _response) = connect_async(request)
            .await
            .map_err(|e| PipelineError::Connection(format!("Failed to connect: {}", e)))?;
        tracing::info!(model = %self.config.model, "Connected to Deepgram");

        let (audio_tx, mut audio_rx) = mpsc::channel::<Bytes>(AUDIO_BUFFER);
        let (event_tx, events) = mpsc::channel(EVENT_BUFFER);

        tokio::spawn(async move {
            let (mut ws_sink, mut ws_stream) = ws_stream.split();
            let mut assembler = TranscriptAssembler::new();
            let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
            keepalive.tick().await;

            loop {
                tokio::select! {
                    audio = audio_rx.recv() => {
                        match audio {
                            Some(frame) => {
                                if let Err(e) = ws_sink.send(Message::Binary(frame.to_vec())).await {
                                    tracing::warn!("Failed to send audio to Deepgram: {}", e);
                                    let _ = event_tx.send(RecognizerEvent::Failed(e.to_string())).await;
                                    break;
                                }
                            }
                            None => {
                                let close = r#"{"type":"CloseStream"}"#.to_string();
                                let _ = ws_sink.send(Message::Text(close)).await;
                                let _ = ws_sink.send(Message::Close(None)).await;
                                let _ = event_tx.send(RecognizerEvent::Closed).await;
                                break;
                            }
                        }
                    }

                    _ = keepalive.tick() => {
                        let ping = r#"{"type":"KeepAlive"}"#.to_string();
                        if let Err(e) = ws_sink.send(Message::Text(ping)).await {
                            tracing::debug!("Deepgram keepalive failed: {}", e);
                        }
                    }

                    message = ws_stream.next() => {
                        match message {
                            Some(Ok(Message::Text(text))) => {
                                match DeepgramMessage::parse(&text) {
                                    Ok(parsed) => {
                                        if let Some(event) = assembler.on_message(parsed) {
                                            if event_tx.send(event).await.is_err() {
                                                break;
                                            }
                                        }
                                    }
                                    Err(e) => tracing::debug!("{}", e),
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                tracing::info!("Deepgram stream ended");
                                let _ = event_tx.send(RecognizerEvent::Closed).await;
                                break;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                tracing::error!("Deepgram WebSocket error: {}", e);
                                let _ = event_tx.send(RecognizerEvent::Failed(e.to_string())).await;
                                break;
                            }
                        }
                    }
                }
            }
        });

        Ok(RecognizerStream { audio_tx, events })
    }

    fn model_name(&self) -> &str {
        &self.config.model
    }
}

//! ElevenLabs text-to-speech
//!
//! Requests µ-law 8 kHz output so the payload can be written to the
//! telephony transport without transcoding.

use async_trait::async_trait;
use bytes::Bytes;
use phone_agent_core::SpeechSynthesizer;
use serde::Serialize;
use std::time::Duration;

use crate::PipelineError;

/// ElevenLabs configuration
#[derive(Debug, Clone)]
pub struct ElevenLabsConfig {
    pub endpoint: String,
    pub api_key: String,
    pub voice_id: String,
    pub model_id: String,
    pub output_format: String,
    pub timeout: Duration,
}

impl Default for ElevenLabsConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.elevenlabs.io".to_string(),
            api_key: String::new(),
            voice_id: "21m00Tcm4TlvDq8ikWAM".to_string(),
            model_id: "eleven_turbo_v2_5".to_string(),
            output_format: "ulaw_8000".to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Serialize)]
struct SynthesisRequest<'a> {
    text: &'a str,
    model_id: &'a str,
}

/// ElevenLabs synthesizer
pub struct ElevenLabsSynthesizer {
    client: reqwest::Client,
    config: ElevenLabsConfig,
}

impl ElevenLabsSynthesizer {
    pub fn new(config: ElevenLabsConfig) -> Result<Self, PipelineError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| PipelineError::Tts(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { client, config })
    }

    fn synthesis_url(&self) -> String {
        format!(
            "{}/v1/text-to-speech/{}?output_format={}",
            self.config.endpoint.trim_end_matches('/'),
            self.config.voice_id,
            self.config.output_format
        )
    }
}

#[async_trait]
impl SpeechSynthesizer for ElevenLabsSynthesizer {
    async fn synthesize(&self, text: &str) -> phone_agent_core::Result<Bytes> {
        let body = SynthesisRequest {
            text,
            model_id: &self.config.model_id,
        };

        let response = self
            .client
            .post(self.synthesis_url())
            .header("xi-api-key", &self.config.api_key)
            .header("Accept", "audio/basic")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    PipelineError::Timeout
                } else {
                    PipelineError::Tts(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(PipelineError::Tts(format!("API error {}: {}", status, error_text)).into());
        }

        let audio = response
            .bytes()
            .await
            .map_err(|e| PipelineError::Tts(e.to_string()))?;

        tracing::debug!(bytes = audio.len(), chars = text.len(), "Synthesized fragment");
        Ok(audio)
    }

    fn voice_name(&self) -> &str {
        &self.config.voice_id
    }
}

//! LLM backend implementations
//!
//! The OpenAI-compatible backend streams chat-completion deltas over SSE and
//! forwards each delta through an mpsc sender as soon as it is parsed.

use async_trait::async_trait;
use futures::StreamExt;
use phone_agent_core::{Message, Role};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

use crate::LlmError;

/// Outcome of one streamed generation
#[derive(Debug, Clone, Default)]
pub struct GenerationResult {
    /// Full generated text
    pub text: String,
    /// Number of streamed deltas
    pub tokens: usize,
}

/// Streaming LLM backend
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Generate a reply, sending each text delta through `tx`
    async fn generate_stream(
        &self,
        messages: &[Message],
        tx: mpsc::Sender<String>,
    ) -> Result<GenerationResult, LlmError>;

    /// Get model name
    fn model_name(&self) -> &str;
}

/// Configuration for OpenAI-compatible backends
#[derive(Debug, Clone)]
pub struct OpenAIConfig {
    /// API base, e.g. https://api.openai.com/v1 or a local vLLM/Ollama server
    pub endpoint: String,
    /// API key
    pub api_key: String,
    /// Model name
    pub model: String,
    /// Maximum tokens to generate
    pub max_tokens: usize,
    /// Temperature (0-2)
    pub temperature: f32,
    /// Request timeout
    pub timeout: Duration,
}

impl Default for OpenAIConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1".to_string(),
            api_key: String::new(),
            model: "gpt-4o-mini".to_string(),
            max_tokens: 256,
            temperature: 0.7,
            timeout: Duration::from_secs(30),
        }
    }
}

/// OpenAI-compatible backend (OpenAI, vLLM, Ollama, ...)
pub struct OpenAIBackend {
    config: OpenAIConfig,
    client: Client,
}

impl OpenAIBackend {
    /// Create new OpenAI backend
    pub fn new(config: OpenAIConfig) -> Result<Self, LlmError> {
        let is_local = config.endpoint.starts_with("http://localhost")
            || config.endpoint.starts_with("http://127.0.0.1");
        if config.api_key.is_empty() && !is_local {
            return Err(LlmError::Configuration(
                "API key required for remote endpoints".to_string(),
            ));
        }

        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| LlmError::Network(e.to_string()))?;

        Ok(Self { config, client })
    }

    /// Get the full API URL for chat completions
    fn chat_url(&self) -> String {
        format!("{}/chat/completions", self.config.endpoint.trim_end_matches('/'))
    }

    /// Build request headers
    fn build_headers(&self) -> reqwest::header::HeaderMap {
        use reqwest::header::HeaderValue;

        let mut headers = reqwest::header::HeaderMap::new();

        if !self.config.api_key.is_empty() {
            let auth_value = format!("Bearer {}", self.config.api_key);
            if let Ok(val) = HeaderValue::from_str(&auth_value) {
                headers.insert(reqwest::header::AUTHORIZATION, val);
            }
        }

        headers.insert(
            reqwest::header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );

        headers
    }

    fn build_request(&self, messages: &[Message]) -> OpenAIChatRequest {
        OpenAIChatRequest {
            model: self.config.model.clone(),
            messages: messages.iter().map(OpenAIMessage::from).collect(),
            max_tokens: Some(self.config.max_tokens),
            temperature: Some(self.config.temperature),
            stream: Some(true),
        }
    }
}

/// Splits a byte stream into complete lines
///
/// Bytes are held until a newline arrives, so multi-byte characters split
/// across network chunks are decoded whole.
#[derive(Debug, Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(line_end) = self.pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=line_end).collect();
            lines.push(String::from_utf8_lossy(&line).trim().to_string());
        }
        lines
    }
}

/// Extract the delta text from one SSE line, if it carries any
fn parse_sse_line(line: &str) -> Option<String> {
    let json_str = line.strip_prefix("data:")?.trim_start();
    if json_str == "[DONE]" {
        return None;
    }
    let chunk: OpenAIStreamChunk = serde_json::from_str(json_str).ok()?;
    chunk
        .choices
        .into_iter()
        .next()?
        .delta?
        .content
        .filter(|c| !c.is_empty())
}

#[async_trait]
impl LlmBackend for OpenAIBackend {
    async fn generate_stream(
        &self,
        messages: &[Message],
        tx: mpsc::Sender<String>,
    ) -> Result<GenerationResult, LlmError> {
        let start = Instant::now();
        let mut full_text = String::new();
        let mut token_count = 0;

        let request = self.build_request(messages);

        let response = self
            .client
            .post(self.chat_url())
            .headers(self.build_headers())
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(LlmError::Api(format!("HTTP {}: {}", status, error_text)));
        }

        let mut stream = response.bytes_stream();
        let mut lines = LineBuffer::default();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            for line in lines.push(&chunk) {
                if let Some(content) = parse_sse_line(&line) {
                    full_text.push_str(&content);
                    token_count += 1;
                    if tx.send(content).await.is_err() {
                        return Err(LlmError::Generation("Receiver dropped".to_string()));
                    }
                }
            }
        }

        tracing::debug!(
            model = %self.config.model,
            tokens = token_count,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Generation complete"
        );

        Ok(GenerationResult {
            text: full_text,
            tokens: token_count,
        })
    }

    fn model_name(&self) -> &str {
        &self.config.model
    }
}

// OpenAI API types
#[derive(Debug, Serialize)]
struct OpenAIChatRequest {
    model: String,
    messages: Vec<OpenAIMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAIMessage {
    role: String,
    content: String,
}

impl From<&Message> for OpenAIMessage {
    fn from(msg: &Message) -> Self {
        let (role, content) = match msg.role {
            Role::System => ("system", msg.content.clone()),
            Role::Caller => ("user", msg.content.clone()),
            Role::Assistant => ("assistant", msg.content.clone()),
            Role::Context => ("system", format!("Relevant information:\n{}", msg.content)),
        };
        Self {
            role: role.to_string(),
            content,
        }
    }
}

#[derive(Debug, Deserialize)]
struct OpenAIStreamChunk {
    choices: Vec<OpenAIStreamChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAIStreamChoice {
    delta: Option<OpenAIDelta>,
    #[allow(dead_code)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIDelta {
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openai_config_default() {
        let config = OpenAIConfig::default();
        assert_eq!(config.endpoint, "https://api.openai.com/v1");
        assert_eq!(config.model, "gpt-4o-mini");
        assert!(config.api_key.is_empty());
    }

    fn remote_config() -> OpenAIConfig {
        OpenAIConfig {
            api_key: "sk-xxx".to_string(),
            model: "gpt-4o".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_openai_backend_creation() {
        // Local endpoint should work without API key
        let local = OpenAIConfig {
            endpoint: "http://localhost:8000/v1/".to_string(),
            ..Default::default()
        };
        let backend = OpenAIBackend::new(local).unwrap();
        assert_eq!(backend.chat_url(), "http://localhost:8000/v1/chat/completions");
        assert!(!backend
            .build_headers()
            .contains_key(reqwest::header::AUTHORIZATION));

        // Remote endpoint requires API key
        let backend = OpenAIBackend::new(OpenAIConfig::default());
        assert!(matches!(backend, Err(LlmError::Configuration(_))));

        let backend = OpenAIBackend::new(remote_config()).unwrap();
        assert_eq!(backend.chat_url(), "https://api.openai.com/v1/chat/completions");
        assert_eq!(
            backend.build_headers()[reqwest::header::AUTHORIZATION],
            "Bearer sk-xxx"
        );
    }

    #[test]
    fn test_role_mapping() {
        let backend = OpenAIBackend::new(remote_config()).unwrap();
        let request = backend.build_request(&[
            Message::system("be brief"),
            Message::caller("what's your return policy"),
            Message::context("30-day returns"),
            Message::assistant("We • offer 30 • day returns."),
        ]);

        let roles: Vec<&str> = request.messages.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, vec!["system", "user", "system", "assistant"]);
        assert!(request.messages[2].content.ends_with("30-day returns"));

        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("\"stream\":true"));
        assert!(json.contains("max_tokens"));
    }

    #[test]
    fn test_parse_sse_line() {
        let line = r#"data: {"choices":[{"delta":{"content":"We •"},"finish_reason":null}]}"#;
        assert_eq!(parse_sse_line(line), Some("We •".to_string()));

        assert_eq!(parse_sse_line("data: [DONE]"), None);
        assert_eq!(parse_sse_line(": keep-alive"), None);
        assert_eq!(
            parse_sse_line(r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#),
            None
        );
        assert_eq!(parse_sse_line(r#"data: {"choices":[]}"#), None);
    }

    #[test]
    fn test_line_buffer_keeps_split_characters_whole() {
        let line = "data: {\"choices\":[{\"delta\":{\"content\":\"We •\"}}]}\n".as_bytes();
        // Cut inside the three-byte bullet
        let cut = line.iter().position(|&b| b == 0xE2).unwrap() + 1;

        let mut buffer = LineBuffer::default();
        assert!(buffer.push(&line[..cut]).is_empty());
        let lines = buffer.push(&line[cut..]);
        assert_eq!(lines.len(), 1);
        assert_eq!(parse_sse_line(&lines[0]), Some("We •".to_string()));
    }

    #[test]
    fn test_line_buffer_multiple_lines_per_chunk() {
        let mut buffer = LineBuffer::default();
        let lines = buffer.push(b"data: a\r\n\ndata: b\ndata: par");
        assert_eq!(lines, vec!["data: a", "", "data: b"]);
        assert_eq!(buffer.push(b"tial\n"), vec!["data: partial"]);
    }
}

//! Retrieval / escalation-intent service client
//!
//! `POST {endpoint}/context` with the caller's utterance and the serialized
//! history; the service answers with supplementary context and a flag telling
//! whether the caller explicitly asked for a human.

use async_trait::async_trait;
use phone_agent_core::{ContextQuery, ContextResult, ContextRetriever};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::RagError;

/// Retrieval client configuration
#[derive(Debug, Clone)]
pub struct RetrievalConfig {
    /// Service base URL
    pub endpoint: String,
    /// Number of chunks to retrieve
    pub top_k: usize,
    pub timeout: Duration,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8000".to_string(),
            top_k: 4,
            timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Serialize)]
struct ContextRequest<'a> {
    question: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    history: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    caller_number: Option<&'a str>,
    #[serde(skip_serializing_if = "str::is_empty")]
    escalated_to: &'a str,
    k: usize,
}

#[derive(Debug, Deserialize)]
struct ContextResponse {
    #[serde(default)]
    context: String,
    #[serde(default)]
    is_escalation: bool,
}

/// HTTP retrieval client
pub struct RetrievalClient {
    client: Client,
    config: RetrievalConfig,
}

impl RetrievalClient {
    pub fn new(config: RetrievalConfig) -> Result<Self, RagError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| RagError::Connection(e.to_string()))?;
        Ok(Self { client, config })
    }

    fn context_url(&self) -> String {
        format!("{}/context", self.config.endpoint.trim_end_matches('/'))
    }

    fn build_request<'a>(&self, query: &'a ContextQuery) -> ContextRequest<'a> {
        ContextRequest {
            question: &query.utterance,
            history: &query.history,
            caller_number: (!query.caller_id.is_unknown()).then(|| query.caller_id.as_str()),
            escalated_to: &query.escalation_target,
            k: self.config.top_k,
        }
    }

    async fn query(&self, query: &ContextQuery) -> Result<ContextResult, RagError> {
        let response = self
            .client
            .post(self.context_url())
            .json(&self.build_request(query))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(RagError::Service(format!("HTTP {}: {}", status, error_text)));
        }

        let body: ContextResponse = response.json().await?;
        Ok(ContextResult {
            context: body.context,
            is_escalation: body.is_escalation,
        })
    }
}

#[async_trait]
impl ContextRetriever for RetrievalClient {
    async fn retrieve(&self, query: &ContextQuery) -> phone_agent_core::Result<ContextResult> {
        let result = self.query(query).await?;
        tracing::debug!(
            context_chars = result.context.len(),
            is_escalation = result.is_escalation,
            "Retrieval complete"
        );
        Ok(result)
    }
}

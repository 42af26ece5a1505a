//! Language Model adapter
//!
//! Bridges an `LlmBackend` to the core `LanguageModel` trait, re-cutting the
//! backend's raw deltas into speakable fragments.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use phone_agent_core::{Error, LanguageModel, Message, ReplyStream, Result};

use crate::backend::LlmBackend;
use crate::fragment::FragmentSplitter;

const DELTA_BUFFER: usize = 100;
const FRAGMENT_BUFFER: usize = 32;

/// Adapter that wraps an LlmBackend to implement the core LanguageModel trait.
///
/// # Example
///
/// ```ignore
/// let backend = OpenAIBackend::new(config)?;
/// let model: Arc<dyn LanguageModel> = Arc::new(LanguageModelAdapter::new(backend, "•"));
/// ```
pub struct LanguageModelAdapter {
    backend: Arc<dyn LlmBackend>,
    model_name: String,
    delimiter: String,
}

impl LanguageModelAdapter {
    /// Create a new adapter wrapping an LlmBackend
    pub fn new<B: LlmBackend + 'static>(backend: B, delimiter: impl Into<String>) -> Self {
        Self::from_arc(Arc::new(backend), delimiter)
    }

    /// Create from an Arc'd backend
    pub fn from_arc(backend: Arc<dyn LlmBackend>, delimiter: impl Into<String>) -> Self {
        let model_name = backend.model_name().to_string();
        Self {
            backend,
            model_name,
            delimiter: delimiter.into(),
        }
    }
}

#[async_trait]
impl LanguageModel for LanguageModelAdapter {
    async fn stream_reply(&self, messages: Vec<Message>) -> Result<ReplyStream> {
        let backend = self.backend.clone();
        let mut splitter = FragmentSplitter::new(self.delimiter.clone());
        let (out_tx, out_rx) = mpsc::channel::<Result<String>>(FRAGMENT_BUFFER);

        tokio::spawn(async move {
            let (delta_tx, mut delta_rx) = mpsc::channel::<String>(DELTA_BUFFER);

            let generation =
                tokio::spawn(async move { backend.generate_stream(&messages, delta_tx).await });

            while let Some(delta) = delta_rx.recv().await {
                for fragment in splitter.push(&delta) {
                    if out_tx.send(Ok(fragment)).await.is_err() {
                        return;
                    }
                }
            }

            match generation.await {
                Ok(Ok(result)) => {
                    if let Some(rest) = splitter.flush() {
                        let _ = out_tx.send(Ok(rest)).await;
                    }
                    tracing::debug!(
                        tokens = result.tokens,
                        chars = result.text.chars().count(),
                        "Reply streamed"
                    );
                }
                Ok(Err(e)) => {
                    let _ = out_tx.send(Err(e.into())).await;
                }
                Err(e) => {
                    let _ = out_tx
                        .send(Err(Error::Llm(format!("Generation task failed: {}", e))))
                        .await;
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(out_rx)))
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }
}

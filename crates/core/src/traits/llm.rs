//! Language model trait

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::{Message, Result};

/// Lazy, finite, non-restartable sequence of reply fragments
///
/// The stream ends after the last fragment; an `Err` item means the reply
/// failed and nothing further follows.
pub type ReplyStream = BoxStream<'static, Result<String>>;

/// Language model interface
///
/// Implementations:
/// - `LanguageModelAdapter` - OpenAI-compatible chat completions with SSE streaming
#[async_trait]
pub trait LanguageModel: Send + Sync + 'static {
    /// Stream a reply for the full message history
    ///
    /// # Arguments
    /// * `messages` - Conversation history, oldest first
    ///
    /// # Returns
    /// Stream of speakable fragments
    async fn stream_reply(&self, messages: Vec<Message>) -> Result<ReplyStream>;

    /// Get model name for logging
    fn model_name(&self) -> &str;
}

//! Retrieval / escalation-intent trait

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{CallerId, Result};

/// Input for one retrieval query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextQuery {
    /// Caller's latest utterance
    pub utterance: String,
    /// Serialized conversation history
    pub history: String,
    pub caller_id: CallerId,
    /// Destination a hand-off would go to
    pub escalation_target: String,
}

/// Result of one retrieval query
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextResult {
    /// Supplementary context, possibly empty
    pub context: String,
    /// The caller asked for, or needs, a human
    pub is_escalation: bool,
}

impl ContextResult {
    pub fn context(context: impl Into<String>) -> Self {
        Self {
            context: context.into(),
            is_escalation: false,
        }
    }

    pub fn escalation() -> Self {
        Self {
            context: String::new(),
            is_escalation: true,
        }
    }
}

/// Retrieval and escalation-intent service
#[async_trait]
pub trait ContextRetriever: Send + Sync + 'static {
    async fn retrieve(&self, query: &ContextQuery) -> Result<ContextResult>;
}

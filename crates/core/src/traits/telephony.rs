//! Call-control traits

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{CallerId, Result};

/// Hands a live call over to a human operator
#[async_trait]
pub trait CallTransfer: Send + Sync + 'static {
    /// Transfer `call_id` to `destination`. Not retried on failure.
    async fn transfer(&self, call_id: &str, destination: &str) -> Result<()>;
}

/// One human hand-off
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationRecord {
    pub caller: CallerId,
    pub destination: String,
    /// Utterance that triggered the hand-off
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

impl EscalationRecord {
    pub fn new(caller: CallerId, destination: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            caller,
            destination: destination.into(),
            reason: reason.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Persistent escalation log; best effort, never blocks the call
#[async_trait]
pub trait EscalationLog: Send + Sync + 'static {
    async fn record(&self, record: &EscalationRecord) -> Result<()>;
}

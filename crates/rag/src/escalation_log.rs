//! Escalation log sinks

use async_trait::async_trait;
use phone_agent_core::{EscalationLog, EscalationRecord};
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;

use crate::RagError;

/// Appends one JSON object per hand-off to a file
pub struct JsonlEscalationLog {
    path: PathBuf,
}

impl JsonlEscalationLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn append(&self, record: &EscalationRecord) -> Result<(), RagError> {
        let mut line =
            serde_json::to_string(record).map_err(|e| RagError::LogWrite(e.to_string()))?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl EscalationLog for JsonlEscalationLog {
    async fn record(&self, record: &EscalationRecord) -> phone_agent_core::Result<()> {
        self.append(record).await?;
        tracing::info!(
            caller = %record.caller,
            destination = %record.destination,
            path = %self.path.display(),
            "Escalation recorded"
        );
        Ok(())
    }
}

/// Records hand-offs only as structured log events
#[derive(Debug, Default)]
pub struct TracingEscalationLog;

#[async_trait]
impl EscalationLog for TracingEscalationLog {
    async fn record(&self, record: &EscalationRecord) -> phone_agent_core::Result<()> {
        tracing::info!(
            caller = %record.caller,
            destination = %record.destination,
            reason = %record.reason,
            timestamp = %record.timestamp,
            "Escalation"
        );
        Ok(())
    }
}

//! Conversation message types
//!
//! Messages are role-tagged and kept in insertion order. The roles mirror the
//! participants of a phone call rather than a chat API, so adapters map them
//! onto whatever their backend expects.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Message role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Instructions for the language model
    System,
    /// What the caller said
    Caller,
    /// What the assistant said (or will have said once delivered)
    Assistant,
    /// Supplementary context returned by retrieval
    Context,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::Caller => write!(f, "caller"),
            Role::Assistant => write!(f, "assistant"),
            Role::Context => write!(f, "context"),
        }
    }
}

/// Conversation message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    /// Create a system message
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    /// Create a caller message
    pub fn caller(content: impl Into<String>) -> Self {
        Self {
            role: Role::Caller,
            content: content.into(),
        }
    }

    /// Create an assistant message
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    /// Create a retrieval context message
    pub fn context(content: impl Into<String>) -> Self {
        Self {
            role: Role::Context,
            content: content.into(),
        }
    }
}

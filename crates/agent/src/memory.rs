//! Conversation Memory
//!
//! Append-only, insertion-ordered message history handed to the language
//! model verbatim on every turn. Each reply is committed at most once, either
//! as the complete generated text or as the part the caller actually heard.
//! After escalation the memory is frozen and every append is refused.

use phone_agent_core::{Message, Role};
use std::collections::HashSet;

/// Conversation memory for one call
#[derive(Debug, Clone)]
pub struct ConversationMemory {
    messages: Vec<Message>,
    /// Replies already committed
    committed: HashSet<u64>,
    frozen: bool,
}

impl ConversationMemory {
    /// Create memory seeded with the system prompt
    pub fn new(system_prompt: &str) -> Self {
        let mut messages = Vec::new();
        if !system_prompt.trim().is_empty() {
            messages.push(Message::system(system_prompt));
        }
        Self {
            messages,
            committed: HashSet::new(),
            frozen: false,
        }
    }

    /// Append what the caller said
    pub fn push_caller(&mut self, text: &str) -> bool {
        self.append(Message::caller(text.trim()))
    }

    /// Append retrieval context; empty context is not recorded
    pub fn push_context(&mut self, context: &str) -> bool {
        if context.trim().is_empty() {
            return false;
        }
        self.append(Message::context(context))
    }

    /// Append an assistant utterance not produced by the model (greeting, fallback)
    pub fn push_assistant(&mut self, text: &str) -> bool {
        self.append(Message::assistant(text.trim()))
    }

    /// Commit only the text confirmed spoken for an interrupted reply
    ///
    /// Nothing is appended when `text` is blank or the reply was already committed.
    pub fn commit_partial(&mut self, reply_id: u64, text: &str) -> bool {
        self.commit(reply_id, text)
    }

    /// Commit the complete generated reply
    pub fn commit_full(&mut self, reply_id: u64, text: &str) -> bool {
        self.commit(reply_id, text)
    }

    /// Refuse every further append
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Caller / assistant exchange as plain text lines, oldest first
    pub fn serialize_history(&self) -> String {
        self.messages
            .iter()
            .filter(|m| matches!(m.role, Role::Caller | Role::Assistant))
            .map(|m| format!("{}: {}", m.role, m.content))
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last_assistant(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant)
            .map(|m| m.content.as_str())
    }

    pub fn count_role(&self, role: Role) -> usize {
        self.messages.iter().filter(|m| m.role == role).count()
    }

    fn commit(&mut self, reply_id: u64, text: &str) -> bool {
        let text = text.trim();
        if text.is_empty() || self.frozen || self.committed.contains(&reply_id) {
            return false;
        }
        self.committed.insert(reply_id);
        self.append(Message::assistant(text))
    }

    fn append(&mut self, message: Message) -> bool {
        if self.frozen {
            tracing::debug!(role = %message.role, "Memory frozen, dropping message");
            return false;
        }
        self.messages.push(message);
        true
    }
}

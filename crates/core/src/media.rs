//! Media types shared between the transport and the delivery sequencer

use bytes::Bytes;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Ordering key attached to every outbound chunk
///
/// `Sequenced` keys come from one call-scoped counter that is never reset per
/// turn. `Bypass` plays immediately and does not consume the ordering space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderingKey {
    Bypass,
    Sequenced(u64),
}

impl OrderingKey {
    pub fn is_bypass(&self) -> bool {
        matches!(self, OrderingKey::Bypass)
    }

    pub fn index(&self) -> Option<u64> {
        match self {
            OrderingKey::Bypass => None,
            OrderingKey::Sequenced(index) => Some(*index),
        }
    }
}

impl fmt::Display for OrderingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderingKey::Bypass => write!(f, "bypass"),
            OrderingKey::Sequenced(index) => write!(f, "{}", index),
        }
    }
}

/// Frame written to the telephony transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    /// Raw audio payload for playback
    Audio(Bytes),
    /// Completion marker; the transport echoes the label back once played
    Mark(String),
    /// Flush any queued but unplayed audio
    Clear,
}

static E164: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\+?[1-9]\d{6,14}$").unwrap());

/// Caller number, or the empty sentinel when missing or malformed
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallerId(String);

impl CallerId {
    /// Parse a raw caller number
    ///
    /// Spaces, dashes, dots and parentheses are stripped before validation.
    /// Anything that is not an E.164-like number degrades to `CallerId::unknown()`.
    pub fn parse(raw: Option<&str>) -> Self {
        let Some(raw) = raw else {
            return Self::unknown();
        };
        let normalized: String = raw
            .trim()
            .chars()
            .filter(|c| !matches!(c, ' ' | '-' | '.' | '(' | ')'))
            .collect();
        if E164.is_match(&normalized) {
            Self(normalized)
        } else {
            Self::unknown()
        }
    }

    pub fn unknown() -> Self {
        Self(String::new())
    }

    pub fn is_unknown(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unknown() {
            write!(f, "unknown")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

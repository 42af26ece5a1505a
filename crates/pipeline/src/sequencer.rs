//! Delivery sequencer
//!
//! Reorder buffer between synthesis (which completes in any order) and the
//! transport (which must play chunks in ordering-key order). Chunks ahead of
//! `expected_index` are withheld until the gap in front of them fills; each
//! chunk handed on gets a fresh acknowledgment token which the transport
//! echoes back once played.
//!
//! Every sequenced chunk also carries the reply generation it was dispatched
//! under. Chunks from an older generation are dropped on arrival, so a
//! synthesis call that outlives an interruption can never reach the caller.

use bytes::Bytes;
use phone_agent_core::OrderingKey;
use std::collections::{HashMap, HashSet};

/// A chunk released to the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub key: OrderingKey,
    pub payload: Bytes,
    /// Label for the transport's completion marker
    pub ack_token: String,
}

/// Per-call delivery queue
#[derive(Debug, Default)]
pub struct DeliverySequencer {
    /// Next sequenced index eligible for transport; never decreases
    expected_index: u64,
    /// Generation accepted for sequenced chunks
    generation: u64,
    /// Chunks received ahead of `expected_index`; `None` marks a skipped index
    withheld: HashMap<u64, Option<Bytes>>,
    /// Tokens handed out and not yet acknowledged
    outstanding: HashSet<String>,
    next_token: u64,
}

impl DeliverySequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer a synthesized chunk
    ///
    /// Returns the chunks released by this call, in order. The bypass key is
    /// released immediately and ignores the generation. Sequenced chunks from
    /// another generation, below `expected_index`, or duplicating a withheld
    /// index are dropped.
    pub fn enqueue(&mut self, key: OrderingKey, generation: u64, payload: Bytes) -> Vec<Delivery> {
        let index = match key {
            OrderingKey::Bypass => return vec![self.release(key, payload)],
            OrderingKey::Sequenced(index) => index,
        };

        if generation != self.generation {
            tracing::debug!(
                ordering_key = index,
                generation,
                current_generation = self.generation,
                "Dropping chunk from superseded reply"
            );
            return Vec::new();
        }

        if index < self.expected_index || self.withheld.contains_key(&index) {
            tracing::debug!(
                ordering_key = index,
                expected_index = self.expected_index,
                "Dropping stale or duplicate chunk"
            );
            return Vec::new();
        }

        self.withheld.insert(index, Some(payload));
        self.drain()
    }

    /// Mark an index as never arriving (its synthesis failed)
    ///
    /// Successors are no longer held back by it. Returns any chunks this releases.
    pub fn skip(&mut self, index: u64, generation: u64) -> Vec<Delivery> {
        if generation != self.generation || index < self.expected_index {
            return Vec::new();
        }
        self.withheld.entry(index).or_insert(None);
        self.drain()
    }

    /// Drop every withheld chunk and stop tracking outstanding acknowledgments
    ///
    /// `expected_index` is left unchanged.
    pub fn discard_pending(&mut self) {
        self.withheld.clear();
        self.outstanding.clear();
    }

    /// Switch to a new reply generation
    ///
    /// Sequenced chunks from any other generation are dropped from now on, and
    /// delivery resumes at `resume_at` unless `expected_index` is already past it.
    pub fn begin_generation(&mut self, generation: u64, resume_at: u64) {
        self.generation = generation;
        self.withheld.clear();
        self.expected_index = self.expected_index.max(resume_at);
    }

    /// Consume an acknowledgment token
    ///
    /// Returns false for tokens that are unknown or were discarded.
    pub fn acknowledge(&mut self, token: &str) -> bool {
        self.outstanding.remove(token)
    }

    /// True while at least one delivered chunk awaits acknowledgment
    pub fn is_speaking(&self) -> bool {
        !self.outstanding.is_empty()
    }

    pub fn expected_index(&self) -> u64 {
        self.expected_index
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn withheld_len(&self) -> usize {
        self.withheld.values().filter(|p| p.is_some()).count()
    }

    pub fn outstanding_len(&self) -> usize {
        self.outstanding.len()
    }

    fn drain(&mut self) -> Vec<Delivery> {
        let mut released = Vec::new();
        while let Some(slot) = self.withheld.remove(&self.expected_index) {
            let key = OrderingKey::Sequenced(self.expected_index);
            self.expected_index += 1;
            if let Some(payload) = slot {
                released.push(self.release(key, payload));
            }
        }
        released
    }

    fn release(&mut self, key: OrderingKey, payload: Bytes) -> Delivery {
        let ack_token = format!("chunk-{}", self.next_token);
        self.next_token += 1;
        self.outstanding.insert(ack_token.clone());
        Delivery {
            key,
            payload,
            ack_token,
        }
    }
}

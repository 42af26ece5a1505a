//! Call session state machine
//!
//! One `CallSession` per live call. It owns every piece of per-call state
//! (conversation memory, escalation latch, delivery queue, ordering counter)
//! and reacts to one event at a time, returning the commands the actor must
//! carry out. It performs no I/O itself.
//!
//! ```text
//! AwaitingStart ──start──▶ Greeting ──ack──▶ Listening ⇄ Speaking
//!                                                │   ▲       │
//!                                                │   └───────┘
//!                                         escalation   interim speech
//!                                                ▼     (interrupt)
//!                                           Escalating ──transfer done──▶ Closed
//! ```
//!
//! An interruption flushes the current reply and lands back in `Listening`
//! within the same event.
//!
//! Ordering keys come from one call-scoped counter that is never reset per
//! turn. Each interruption starts a new reply generation; chunks synthesized
//! under an older generation are dropped on arrival.

use bytes::Bytes;
use phone_agent_core::{
    CallerId, ContextQuery, ContextResult, Error, EscalationRecord, Message, OrderingKey,
    OutboundFrame,
};
use phone_agent_pipeline::{Delivery, DeliverySequencer};
use std::collections::HashMap;

use crate::escalation::{EscalationGate, GateDecision};
use crate::memory::ConversationMemory;

/// Per-call behaviour
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub greeting: String,
    pub fallback_reply: String,
    pub escalation_target: String,
    pub system_prompt: String,
    pub fragment_delimiter: String,
}

impl From<&phone_agent_config::SessionConfig> for SessionSettings {
    fn from(config: &phone_agent_config::SessionConfig) -> Self {
        Self {
            greeting: config.greeting.clone(),
            fallback_reply: config.fallback_reply.clone(),
            escalation_target: config.escalation_target.clone(),
            system_prompt: config.system_prompt.clone(),
            fragment_delimiter: config.fragment_delimiter.clone(),
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from(&phone_agent_config::SessionConfig::default())
    }
}

/// Assistant output state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingStart,
    Greeting,
    Listening,
    Speaking,
    Escalating,
    Closed,
}

/// Everything that can happen to a call
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Transport stream started
    Start {
        call_id: String,
        stream_id: String,
        caller_id: CallerId,
    },
    /// Inbound caller audio
    Media(Bytes),
    /// Recognizer heard speech; text may be blank
    Interim { text: String },
    /// Recognizer finished an utterance
    Final { text: String },
    RecognizerFailed { error: String },
    RetrievalCompleted {
        seq: u64,
        utterance: String,
        outcome: Result<ContextResult, Error>,
    },
    ReplyFragment { reply_id: u64, text: String },
    ReplyCompleted { reply_id: u64 },
    ReplyFailed { reply_id: u64, error: Error },
    Synthesized {
        key: OrderingKey,
        generation: u64,
        result: Result<Bytes, Error>,
    },
    /// Transport played the chunk carrying this marker
    MarkAcknowledged { label: String },
    TransferCompleted { result: Result<(), Error> },
    /// Transport stream stopped or the socket closed
    Stop,
}

/// Effects requested by the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    ConnectRecognizer,
    ForwardAudio(Bytes),
    Retrieve { seq: u64, query: ContextQuery },
    Complete { reply_id: u64, messages: Vec<Message> },
    Synthesize {
        key: OrderingKey,
        generation: u64,
        text: String,
    },
    Send(OutboundFrame),
    CancelSynthesis,
    RecordEscalation(EscalationRecord),
    Transfer { call_id: String, destination: String },
    Close,
}

/// The reply currently being generated or played
#[derive(Debug)]
struct ActiveReply {
    id: u64,
    /// Every fragment received so far
    full_text: String,
    /// Fragments whose audio reached the transport
    spoken_so_far: String,
    /// Dispatched chunks neither delivered nor failed
    pending_chunks: usize,
    model_done: bool,
    failed: bool,
    /// A chunk failed synthesis and was never heard
    skipped: bool,
}

impl ActiveReply {
    fn new(id: u64) -> Self {
        Self {
            id,
            full_text: String::new(),
            spoken_so_far: String::new(),
            pending_chunks: 0,
            model_done: false,
            failed: false,
            skipped: false,
        }
    }
}

/// Owner of a dispatched chunk
#[derive(Debug)]
struct ChunkOwner {
    /// `None` for fallback utterances, committed on their own delivery
    reply_id: Option<u64>,
    text: String,
}

/// Per-call session state
pub struct CallSession {
    settings: SessionSettings,
    state: SessionState,
    call_id: String,
    stream_id: String,
    caller_id: CallerId,
    /// Caller turns that reached the language model
    turn_counter: u64,
    /// Final transcripts sent to retrieval
    utterance_seq: u64,
    /// Latest retrieval result applied to memory
    routed_seq: u64,
    next_ordering_key: u64,
    generation: u64,
    memory: ConversationMemory,
    gate: EscalationGate,
    sequencer: DeliverySequencer,
    active_reply: Option<ActiveReply>,
    chunk_owners: HashMap<u64, ChunkOwner>,
    recognizer_fallback_spoken: bool,
}

impl CallSession {
    pub fn new(settings: SessionSettings) -> Self {
        let memory = ConversationMemory::new(&settings.system_prompt);
        Self {
            settings,
            state: SessionState::AwaitingStart,
            call_id: String::new(),
            stream_id: String::new(),
            caller_id: CallerId::unknown(),
            turn_counter: 0,
            utterance_seq: 0,
            routed_seq: 0,
            next_ordering_key: 0,
            generation: 0,
            memory,
            gate: EscalationGate::new(),
            sequencer: DeliverySequencer::new(),
            active_reply: None,
            chunk_owners: HashMap::new(),
            recognizer_fallback_spoken: false,
        }
    }

    /// Apply one event
    pub fn handle(&mut self, event: SessionEvent) -> Vec<SessionCommand> {
        let mut out = Vec::new();
        if self.state == SessionState::Closed {
            return out;
        }

        match event {
            SessionEvent::Start {
                call_id,
                stream_id,
                caller_id,
            } => self.on_start(call_id, stream_id, caller_id, &mut out),
            SessionEvent::Stop => self.on_stop(&mut out),
            SessionEvent::TransferCompleted { result } => {
                self.on_transfer_completed(result, &mut out)
            }
            _ if self.gate.is_escalated() => {
                tracing::trace!(call_id = %self.call_id, "Escalated, ignoring event");
            }
            _ if self.state == SessionState::AwaitingStart => {
                tracing::debug!("Event before stream start ignored");
            }
            SessionEvent::Media(audio) => out.push(SessionCommand::ForwardAudio(audio)),
            SessionEvent::Interim { text } => self.on_interim(&text, &mut out),
            SessionEvent::Final { text } => self.on_final(text, &mut out),
            SessionEvent::RecognizerFailed { error } => self.on_recognizer_failed(&error, &mut out),
            SessionEvent::RetrievalCompleted {
                seq,
                utterance,
                outcome,
            } => self.on_retrieval(seq, utterance, outcome, &mut out),
            SessionEvent::ReplyFragment { reply_id, text } => {
                self.on_fragment(reply_id, text, &mut out)
            }
            SessionEvent::ReplyCompleted { reply_id } => self.on_reply_completed(reply_id, &mut out),
            SessionEvent::ReplyFailed { reply_id, error } => {
                self.on_reply_failed(reply_id, error, &mut out)
            }
            SessionEvent::Synthesized {
                key,
                generation,
                result,
            } => self.on_synthesized(key, generation, result, &mut out),
            SessionEvent::MarkAcknowledged { label } => self.on_mark(&label),
        }

        out
    }

    fn on_start(
        &mut self,
        call_id: String,
        stream_id: String,
        caller_id: CallerId,
        out: &mut Vec<SessionCommand>,
    ) {
        if self.state != SessionState::AwaitingStart {
            tracing::warn!(call_id = %self.call_id, "Duplicate start ignored");
            return;
        }

        tracing::info!(
            call_id = %call_id,
            stream_id = %stream_id,
            caller = %caller_id,
            "Call session started"
        );
        self.call_id = call_id;
        self.stream_id = stream_id;
        self.caller_id = caller_id;
        self.state = SessionState::Greeting;

        out.push(SessionCommand::Synthesize {
            key: OrderingKey::Bypass,
            generation: self.generation,
            text: self.settings.greeting.clone(),
        });
        out.push(SessionCommand::ConnectRecognizer);
    }

    fn on_stop(&mut self, out: &mut Vec<SessionCommand>) {
        tracing::info!(
            call_id = %self.call_id,
            turns = self.turn_counter,
            escalated = self.gate.is_escalated(),
            "Call session closed"
        );
        self.state = SessionState::Closed;
        out.push(SessionCommand::CancelSynthesis);
        out.push(SessionCommand::Close);
    }

    fn on_interim(&mut self, text: &str, out: &mut Vec<SessionCommand>) {
        if text.trim().is_empty() || !self.sequencer.is_speaking() {
            return;
        }
        tracing::info!(call_id = %self.call_id, "Caller barged in");
        self.interrupt(out);
    }

    fn on_final(&mut self, text: String, out: &mut Vec<SessionCommand>) {
        let utterance = text.trim().to_string();
        if utterance.is_empty() {
            return;
        }

        if self.active_reply.is_some() || self.sequencer.is_speaking() {
            self.interrupt(out);
        }

        self.utterance_seq += 1;
        tracing::info!(call_id = %self.call_id, utterance = %utterance, "Caller utterance");
        out.push(SessionCommand::Retrieve {
            seq: self.utterance_seq,
            query: ContextQuery {
                utterance,
                history: self.memory.serialize_history(),
                caller_id: self.caller_id.clone(),
                escalation_target: self.settings.escalation_target.clone(),
            },
        });
    }

    fn on_recognizer_failed(&mut self, error: &str, out: &mut Vec<SessionCommand>) {
        tracing::error!(call_id = %self.call_id, error = %error, "Recognizer failed");
        metrics::counter!("phone_agent_collaborator_errors_total", "kind" => "recognizer")
            .increment(1);
        if !self.recognizer_fallback_spoken {
            self.recognizer_fallback_spoken = true;
            self.speak_fallback(out);
        }
    }

    fn on_retrieval(
        &mut self,
        seq: u64,
        utterance: String,
        outcome: Result<ContextResult, Error>,
        out: &mut Vec<SessionCommand>,
    ) {
        match self.gate.route(outcome) {
            GateDecision::Frozen => {}
            GateDecision::Escalate => self.escalate(utterance, out),
            GateDecision::Reply { context } => {
                if seq < self.routed_seq {
                    tracing::debug!(call_id = %self.call_id, seq, "Retrieval finished after a later turn, dropped");
                    return;
                }
                self.routed_seq = seq;
                self.memory.push_caller(&utterance);

                if seq != self.utterance_seq {
                    // Context is only kept for the turn the model answers
                    tracing::debug!(call_id = %self.call_id, seq, "Superseded utterance, no reply");
                    return;
                }
                self.memory.push_context(&context);
                if self.active_reply.is_some() {
                    self.interrupt(out);
                }

                self.turn_counter += 1;
                let reply_id = self.turn_counter;
                self.active_reply = Some(ActiveReply::new(reply_id));
                out.push(SessionCommand::Complete {
                    reply_id,
                    messages: self.memory.messages().to_vec(),
                });
            }
        }
    }

    fn on_fragment(&mut self, reply_id: u64, text: String, out: &mut Vec<SessionCommand>) {
        let Some(reply) = self.active_reply.as_mut().filter(|r| r.id == reply_id) else {
            tracing::trace!(reply_id, "Fragment from discarded reply ignored");
            return;
        };

        reply.full_text.push_str(&text);
        let speech = speakable(&text, &self.settings.fragment_delimiter);
        if speech.is_empty() {
            return;
        }

        let index = self.next_ordering_key;
        self.next_ordering_key += 1;
        reply.pending_chunks += 1;
        self.chunk_owners.insert(
            index,
            ChunkOwner {
                reply_id: Some(reply_id),
                text,
            },
        );
        self.state = SessionState::Speaking;
        out.push(SessionCommand::Synthesize {
            key: OrderingKey::Sequenced(index),
            generation: self.generation,
            text: speech,
        });
    }

    fn on_reply_completed(&mut self, reply_id: u64, out: &mut Vec<SessionCommand>) {
        if let Some(reply) = self.active_reply.as_mut().filter(|r| r.id == reply_id) {
            reply.model_done = true;
            self.try_finalize(out);
        }
    }

    fn on_reply_failed(&mut self, reply_id: u64, error: Error, out: &mut Vec<SessionCommand>) {
        tracing::warn!(call_id = %self.call_id, reply_id, error = %error, "Reply generation failed");
        metrics::counter!("phone_agent_collaborator_errors_total", "kind" => error.kind())
            .increment(1);

        if let Some(reply) = self.active_reply.as_mut().filter(|r| r.id == reply_id) {
            reply.model_done = true;
            reply.failed = true;
            self.try_finalize(out);
        }
    }

    fn on_synthesized(
        &mut self,
        key: OrderingKey,
        generation: u64,
        result: Result<Bytes, Error>,
        out: &mut Vec<SessionCommand>,
    ) {
        if generation != self.generation {
            tracing::debug!(ordering_key = %key, generation, "Chunk from superseded reply dropped");
            return;
        }

        match result {
            Ok(payload) => {
                let deliveries = self.sequencer.enqueue(key, generation, payload);
                self.deliver(deliveries, out);
            }
            Err(e) => {
                tracing::warn!(call_id = %self.call_id, ordering_key = %key, error = %e, "Synthesis failed");
                metrics::counter!("phone_agent_collaborator_errors_total", "kind" => e.kind())
                    .increment(1);
                if let OrderingKey::Sequenced(index) = key {
                    self.release_chunk(index, false);
                    let deliveries = self.sequencer.skip(index, generation);
                    self.deliver(deliveries, out);
                }
            }
        }
        self.try_finalize(out);
    }

    fn on_mark(&mut self, label: &str) {
        if !self.sequencer.acknowledge(label) {
            return;
        }
        if !self.sequencer.is_speaking()
            && matches!(self.state, SessionState::Greeting | SessionState::Speaking)
        {
            self.state = SessionState::Listening;
        }
    }

    fn on_transfer_completed(&mut self, result: Result<(), Error>, out: &mut Vec<SessionCommand>) {
        if self.state != SessionState::Escalating {
            return;
        }
        match result {
            Ok(()) => tracing::info!(call_id = %self.call_id, "Call transferred"),
            Err(e) => {
                tracing::error!(call_id = %self.call_id, error = %e, "Call transfer failed, closing session");
                metrics::counter!("phone_agent_collaborator_errors_total", "kind" => "transfer")
                    .increment(1);
            }
        }
        self.state = SessionState::Closed;
        out.push(SessionCommand::Close);
    }

    /// Stop the current output and reconcile memory with what was heard
    fn interrupt(&mut self, out: &mut Vec<SessionCommand>) {
        if let Some(reply) = self.active_reply.take() {
            if self.memory.commit_partial(reply.id, &reply.spoken_so_far) {
                tracing::debug!(reply_id = reply.id, spoken = %reply.spoken_so_far.trim(), "Committed partial reply");
            }
        }

        self.sequencer.discard_pending();
        self.start_generation();
        self.state = SessionState::Listening;
        out.push(SessionCommand::Send(OutboundFrame::Clear));
        out.push(SessionCommand::CancelSynthesis);
        metrics::counter!("phone_agent_interruptions_total").increment(1);
    }

    fn escalate(&mut self, utterance: String, out: &mut Vec<SessionCommand>) {
        tracing::info!(
            call_id = %self.call_id,
            destination = %self.settings.escalation_target,
            "Escalating to human"
        );
        self.memory.freeze();
        self.active_reply = None;
        self.sequencer.discard_pending();
        self.start_generation();
        self.state = SessionState::Escalating;
        metrics::counter!("phone_agent_escalations_total").increment(1);

        out.push(SessionCommand::Send(OutboundFrame::Clear));
        out.push(SessionCommand::CancelSynthesis);
        out.push(SessionCommand::RecordEscalation(EscalationRecord::new(
            self.caller_id.clone(),
            self.settings.escalation_target.clone(),
            utterance,
        )));
        out.push(SessionCommand::Transfer {
            call_id: self.call_id.clone(),
            destination: self.settings.escalation_target.clone(),
        });
    }

    fn start_generation(&mut self) {
        self.generation += 1;
        self.sequencer
            .begin_generation(self.generation, self.next_ordering_key);
        self.chunk_owners.clear();
    }

    fn speak_fallback(&mut self, out: &mut Vec<SessionCommand>) {
        let text = self.settings.fallback_reply.clone();
        let index = self.next_ordering_key;
        self.next_ordering_key += 1;
        self.chunk_owners.insert(
            index,
            ChunkOwner {
                reply_id: None,
                text: text.clone(),
            },
        );
        metrics::counter!("phone_agent_fallback_replies_total").increment(1);
        out.push(SessionCommand::Synthesize {
            key: OrderingKey::Sequenced(index),
            generation: self.generation,
            text,
        });
    }

    fn deliver(&mut self, deliveries: Vec<Delivery>, out: &mut Vec<SessionCommand>) {
        for delivery in deliveries {
            match delivery.key {
                OrderingKey::Sequenced(index) => {
                    self.release_chunk(index, true);
                    self.state = SessionState::Speaking;
                }
                OrderingKey::Bypass => {
                    let greeting = self.settings.greeting.clone();
                    self.memory.push_assistant(&greeting);
                }
            }
            tracing::trace!(ordering_key = %delivery.key, mark = %delivery.ack_token, "Chunk delivered");
            out.push(SessionCommand::Send(OutboundFrame::Audio(delivery.payload)));
            out.push(SessionCommand::Send(OutboundFrame::Mark(delivery.ack_token)));
        }
    }

    /// Account for a chunk that was delivered or will never arrive
    fn release_chunk(&mut self, index: u64, delivered: bool) {
        let Some(owner) = self.chunk_owners.remove(&index) else {
            return;
        };
        let Some(reply_id) = owner.reply_id else {
            if delivered {
                self.memory.push_assistant(&owner.text);
            }
            return;
        };
        if let Some(reply) = self.active_reply.as_mut().filter(|r| r.id == reply_id) {
            reply.pending_chunks = reply.pending_chunks.saturating_sub(1);
            if delivered {
                reply.spoken_so_far.push_str(&owner.text);
            } else {
                reply.skipped = true;
            }
        }
    }

    /// Commit the active reply once generation ended and all its chunks reached the transport
    fn try_finalize(&mut self, out: &mut Vec<SessionCommand>) {
        let finished = self
            .active_reply
            .as_ref()
            .map_or(false, |r| r.model_done && r.pending_chunks == 0);
        if !finished {
            return;
        }
        let Some(reply) = self.active_reply.take() else {
            return;
        };

        if reply.spoken_so_far.trim().is_empty() {
            // Nothing was said this turn
            self.speak_fallback(out);
        } else if reply.failed || reply.skipped {
            self.memory.commit_partial(reply.id, &reply.spoken_so_far);
        } else {
            self.memory.commit_full(reply.id, &reply.full_text);
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn caller_id(&self) -> &CallerId {
        &self.caller_id
    }

    pub fn memory(&self) -> &ConversationMemory {
        &self.memory
    }

    pub fn turn_counter(&self) -> u64 {
        self.turn_counter
    }

    pub fn next_ordering_key(&self) -> u64 {
        self.next_ordering_key
    }

    pub fn expected_index(&self) -> u64 {
        self.sequencer.expected_index()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_assistant_speaking(&self) -> bool {
        self.sequencer.is_speaking()
    }

    pub fn is_escalated(&self) -> bool {
        self.gate.is_escalated()
    }

    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }
}

/// Fragment text with the phrase delimiter removed
fn speakable(text: &str, delimiter: &str) -> String {
    text.replace(delimiter, " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use phone_agent_core::Role;

    const TARGET: &str = "+18005559876";

    fn settings() -> SessionSettings {
        SessionSettings {
            greeting: "Hello!".to_string(),
            fallback_reply: "Sorry, I'm temporarily unavailable.".to_string(),
            escalation_target: TARGET.to_string(),
            system_prompt: "be brief".to_string(),
            fragment_delimiter: "•".to_string(),
        }
    }

    fn audio(cmds: &[SessionCommand]) -> Vec<Bytes> {
        cmds.iter()
            .filter_map(|c| match c {
                SessionCommand::Send(OutboundFrame::Audio(payload)) => Some(payload.clone()),
                _ => None,
            })
            .collect()
    }

    fn marks(cmds: &[SessionCommand]) -> Vec<String> {
        cmds.iter()
            .filter_map(|c| match c {
                SessionCommand::Send(OutboundFrame::Mark(label)) => Some(label.clone()),
                _ => None,
            })
            .collect()
    }

    fn synth_requests(cmds: &[SessionCommand]) -> Vec<(OrderingKey, u64, String)> {
        cmds.iter()
            .filter_map(|c| match c {
                SessionCommand::Synthesize {
                    key,
                    generation,
                    text,
                } => Some((*key, *generation, text.clone())),
                _ => None,
            })
            .collect()
    }

    fn has_clear(cmds: &[SessionCommand]) -> bool {
        cmds.contains(&SessionCommand::Send(OutboundFrame::Clear))
    }

    fn synthesized(session: &mut CallSession, index: u64, text: &str) -> Vec<SessionCommand> {
        let generation = session.generation();
        session.handle(SessionEvent::Synthesized {
            key: OrderingKey::Sequenced(index),
            generation,
            result: Ok(Bytes::from(text.to_string())),
        })
    }

    fn ack_all(session: &mut CallSession, cmds: &[SessionCommand]) {
        for label in marks(cmds) {
            session.handle(SessionEvent::MarkAcknowledged { label });
        }
    }

    /// Session past the greeting, listening
    fn started() -> CallSession {
        let mut session = CallSession::new(settings());
        let cmds = session.handle(SessionEvent::Start {
            call_id: "CA123".to_string(),
            stream_id: "MZ456".to_string(),
            caller_id: CallerId::parse(Some("+15551234567")),
        });
        assert_eq!(cmds.last(), Some(&SessionCommand::ConnectRecognizer));
        assert_eq!(
            synth_requests(&cmds),
            vec![(OrderingKey::Bypass, 0, "Hello!".to_string())]
        );
        assert_eq!(session.state(), SessionState::Greeting);

        let cmds = session.handle(SessionEvent::Synthesized {
            key: OrderingKey::Bypass,
            generation: 0,
            result: Ok(Bytes::from_static(b"hello-audio")),
        });
        assert_eq!(audio(&cmds), vec![Bytes::from_static(b"hello-audio")]);
        assert!(session.is_assistant_speaking());
        assert_eq!(session.next_ordering_key(), 0);

        ack_all(&mut session, &cmds);
        assert_eq!(session.state(), SessionState::Listening);
        assert!(!session.is_assistant_speaking());
        session
    }

    /// Ask a question and start reply 1 with the return-policy context
    fn ask(session: &mut CallSession, utterance: &str, outcome: Result<ContextResult, Error>) -> Vec<SessionCommand> {
        let cmds = session.handle(SessionEvent::Final {
            text: utterance.to_string(),
        });
        let seq = cmds
            .iter()
            .find_map(|c| match c {
                SessionCommand::Retrieve { seq, .. } => Some(*seq),
                _ => None,
            })
            .unwrap();
        session.handle(SessionEvent::RetrievalCompleted {
            seq,
            utterance: utterance.to_string(),
            outcome,
        })
    }

    fn stream_reply(session: &mut CallSession, reply_id: u64, fragments: &[&str]) -> Vec<SessionCommand> {
        let mut cmds = Vec::new();
        for fragment in fragments {
            cmds.extend(session.handle(SessionEvent::ReplyFragment {
                reply_id,
                text: fragment.to_string(),
            }));
        }
        cmds
    }

    #[test]
    fn test_retrieval_query_contents() {
        let mut session = started();
        let cmds = session.handle(SessionEvent::Final {
            text: " what's your return policy ".to_string(),
        });
        match &cmds[..] {
            [SessionCommand::Retrieve { seq, query }] => {
                assert_eq!(*seq, 1);
                assert_eq!(query.utterance, "what's your return policy");
                assert_eq!(query.history, "assistant: Hello!");
                assert_eq!(query.caller_id.as_str(), "+15551234567");
                assert_eq!(query.escalation_target, TARGET);
            }
            other => panic!("unexpected commands: {:?}", other),
        }
    }

    #[test]
    fn test_return_policy_scenario() {
        let mut session = started();
        let cmds = ask(
            &mut session,
            "what's your return policy",
            Ok(ContextResult::context("30-day returns")),
        );
        let messages = match &cmds[..] {
            [SessionCommand::Complete { reply_id: 1, messages }] => messages.clone(),
            other => panic!("unexpected commands: {:?}", other),
        };
        let tail: Vec<Role> = messages.iter().rev().take(2).map(|m| m.role).collect();
        assert_eq!(tail, vec![Role::Context, Role::Caller]);
        assert_eq!(session.turn_counter(), 1);

        let cmds = stream_reply(&mut session, 1, &["We •", " offer 30 •", " day returns."]);
        assert_eq!(
            synth_requests(&cmds),
            vec![
                (OrderingKey::Sequenced(0), 0, "We".to_string()),
                (OrderingKey::Sequenced(1), 0, "offer 30".to_string()),
                (OrderingKey::Sequenced(2), 0, "day returns.".to_string()),
            ]
        );
        assert_eq!(session.state(), SessionState::Speaking);
        session.handle(SessionEvent::ReplyCompleted { reply_id: 1 });
        // Not committed until the audio has been handed on
        assert_eq!(session.memory().last_assistant(), Some("Hello!"));

        let mut delivered = Vec::new();
        delivered.extend(synthesized(&mut session, 2, "c2"));
        delivered.extend(synthesized(&mut session, 0, "c0"));
        delivered.extend(synthesized(&mut session, 1, "c1"));
        assert_eq!(
            audio(&delivered),
            vec![Bytes::from("c0"), Bytes::from("c1"), Bytes::from("c2")]
        );
        assert_eq!(marks(&delivered).len(), 3);

        ack_all(&mut session, &delivered);
        assert!(!session.is_assistant_speaking());
        assert_eq!(session.state(), SessionState::Listening);
        assert_eq!(session.memory().count_role(Role::Assistant), 2);
        assert_eq!(
            session.memory().last_assistant(),
            Some("We • offer 30 • day returns.")
        );
    }

    #[test]
    fn test_mid_reply_interruption_commits_spoken_text_only() {
        let mut session = started();
        ask(&mut session, "what's your return policy", Ok(ContextResult::context("30-day returns")));
        stream_reply(&mut session, 1, &["We •", " offer 30 •", " day returns."]);
        session.handle(SessionEvent::ReplyCompleted { reply_id: 1 });

        let cmds = synthesized(&mut session, 0, "c0");
        assert_eq!(audio(&cmds).len(), 1);
        assert!(synthesized(&mut session, 2, "c2").is_empty());
        assert!(session.is_assistant_speaking());

        let cmds = session.handle(SessionEvent::Interim {
            text: "wait".to_string(),
        });
        assert!(has_clear(&cmds));
        assert!(cmds.contains(&SessionCommand::CancelSynthesis));
        assert_eq!(session.state(), SessionState::Listening);
        assert!(!session.is_assistant_speaking());
        assert_eq!(session.memory().last_assistant(), Some("We •"));
        assert_eq!(session.memory().count_role(Role::Assistant), 2);

        // Late chunk 1 from the discarded reply never reaches the caller
        assert!(session
            .handle(SessionEvent::Synthesized {
                key: OrderingKey::Sequenced(1),
                generation: 0,
                result: Ok(Bytes::from("c1")),
            })
            .is_empty());
        assert_eq!(session.expected_index(), 3);
        assert_eq!(session.generation(), 1);

        // A late completion does not commit the full reply
        session.handle(SessionEvent::ReplyCompleted { reply_id: 1 });
        assert_eq!(session.memory().count_role(Role::Assistant), 2);
    }

    #[test]
    fn test_interruption_is_idempotent() {
        let mut session = started();
        ask(&mut session, "hours?", Ok(ContextResult::default()));
        stream_reply(&mut session, 1, &["We open •", " at nine."]);
        synthesized(&mut session, 0, "c0");

        let first = session.handle(SessionEvent::Interim {
            text: "hold on".to_string(),
        });
        let memory_len = session.memory().len();
        let generation = session.generation();

        let second = session.handle(SessionEvent::Interim {
            text: "hold on".to_string(),
        });
        assert!(has_clear(&first));
        assert!(second.is_empty());
        assert_eq!(session.memory().len(), memory_len);
        assert_eq!(session.generation(), generation);
    }

    #[test]
    fn test_blank_interim_or_silence_does_not_interrupt() {
        let mut session = started();
        ask(&mut session, "hours?", Ok(ContextResult::default()));
        stream_reply(&mut session, 1, &["We open •"]);
        synthesized(&mut session, 0, "c0");

        assert!(session
            .handle(SessionEvent::Interim {
                text: "   ".to_string()
            })
            .is_empty());
        assert_eq!(session.state(), SessionState::Speaking);

        // Not speaking: interim speech is just the caller talking
        let mut quiet = started();
        assert!(quiet
            .handle(SessionEvent::Interim {
                text: "hello".to_string()
            })
            .is_empty());
    }

    #[test]
    fn test_next_reply_continues_ordering_after_interruption() {
        let mut session = started();
        ask(&mut session, "hours?", Ok(ContextResult::default()));
        stream_reply(&mut session, 1, &["We open •", " at nine •", " daily."]);
        synthesized(&mut session, 0, "c0");
        session.handle(SessionEvent::Interim {
            text: "and sundays".to_string(),
        });

        ask(&mut session, "and sundays?", Ok(ContextResult::default()));
        assert_eq!(session.turn_counter(), 2);
        let cmds = stream_reply(&mut session, 2, &["Closed •"]);
        assert_eq!(
            synth_requests(&cmds),
            vec![(OrderingKey::Sequenced(3), 1, "Closed".to_string())]
        );

        let cmds = synthesized(&mut session, 3, "c3");
        assert_eq!(audio(&cmds), vec![Bytes::from("c3")]);
        assert_eq!(session.state(), SessionState::Speaking);
    }

    #[test]
    fn test_new_utterance_supersedes_streaming_reply() {
        let mut session = started();
        ask(&mut session, "hours?", Ok(ContextResult::default()));
        stream_reply(&mut session, 1, &["We open •"]);
        synthesized(&mut session, 0, "c0");

        let cmds = session.handle(SessionEvent::Final {
            text: "actually, returns?".to_string(),
        });
        assert!(has_clear(&cmds));
        assert!(matches!(cmds.last(), Some(SessionCommand::Retrieve { seq: 2, .. })));
        assert_eq!(session.memory().last_assistant(), Some("We open •"));
        assert_eq!(session.state(), SessionState::Listening);

        // Fragments still streaming for reply 1 are ignored
        assert!(stream_reply(&mut session, 1, &[" at nine."]).is_empty());
    }

    #[test]
    fn test_escalation_freezes_session() {
        let mut session = started();
        let memory_len = session.memory().len();
        let cmds = ask(&mut session, "let me talk to a human", Ok(ContextResult::escalation()));

        assert!(!cmds
            .iter()
            .any(|c| matches!(c, SessionCommand::Complete { .. })));
        assert!(cmds.contains(&SessionCommand::Transfer {
            call_id: "CA123".to_string(),
            destination: TARGET.to_string(),
        }));
        let record = cmds
            .iter()
            .find_map(|c| match c {
                SessionCommand::RecordEscalation(record) => Some(record.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(record.reason, "let me talk to a human");
        assert_eq!(record.caller.as_str(), "+15551234567");
        assert_eq!(record.destination, TARGET);
        assert_eq!(session.state(), SessionState::Escalating);
        assert!(session.is_escalated());

        // Everything but stop / transfer completion is a no-op now
        assert!(session
            .handle(SessionEvent::Final {
                text: "hello?".to_string()
            })
            .is_empty());
        assert!(session
            .handle(SessionEvent::RecognizerFailed {
                error: "gone".to_string()
            })
            .is_empty());
        assert!(synthesized(&mut session, 0, "late").is_empty());
        assert!(session
            .handle(SessionEvent::Media(Bytes::from_static(b"\xff")))
            .is_empty());
        assert_eq!(session.memory().len(), memory_len);

        let cmds = session.handle(SessionEvent::TransferCompleted { result: Ok(()) });
        assert_eq!(cmds, vec![SessionCommand::Close]);
        assert!(session.is_closed());
    }

    #[test]
    fn test_escalation_mid_reply_drops_pending_audio() {
        let mut session = started();
        ask(&mut session, "hours?", Ok(ContextResult::default()));
        stream_reply(&mut session, 1, &["We open •", " at nine."]);
        synthesized(&mut session, 0, "c0");
        let assistant_count = session.memory().count_role(Role::Assistant);

        let cmds = ask(&mut session, "get me a person", Ok(ContextResult::escalation()));
        assert!(has_clear(&cmds));
        assert!(synthesized(&mut session, 1, "c1").is_empty());
        session.handle(SessionEvent::ReplyCompleted { reply_id: 1 });
        assert_eq!(session.memory().count_role(Role::Assistant), assistant_count + 1);
        assert!(session.memory().is_frozen());
    }

    #[test]
    fn test_transfer_failure_still_closes() {
        let mut session = started();
        ask(&mut session, "human please", Ok(ContextResult::escalation()));
        let cmds = session.handle(SessionEvent::TransferCompleted {
            result: Err(Error::Transfer("HTTP 404".to_string())),
        });
        assert_eq!(cmds, vec![SessionCommand::Close]);
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn test_retrieval_failure_proceeds_without_context() {
        let mut session = started();
        let cmds = ask(
            &mut session,
            "what's your return policy",
            Err(Error::Retrieval("connection refused".to_string())),
        );
        let messages = match &cmds[..] {
            [SessionCommand::Complete { messages, .. }] => messages.clone(),
            other => panic!("unexpected commands: {:?}", other),
        };
        assert!(messages.iter().all(|m| m.role != Role::Context));
        assert_eq!(messages.last().map(|m| m.role), Some(Role::Caller));
        assert!(!session.is_escalated());
    }

    #[test]
    fn test_model_failure_without_output_speaks_fallback() {
        let mut session = started();
        ask(&mut session, "hours?", Ok(ContextResult::default()));
        let cmds = session.handle(SessionEvent::ReplyFailed {
            reply_id: 1,
            error: Error::Llm("HTTP 500".to_string()),
        });
        assert_eq!(
            synth_requests(&cmds),
            vec![(
                OrderingKey::Sequenced(0),
                0,
                "Sorry, I'm temporarily unavailable.".to_string()
            )]
        );
        assert_eq!(session.memory().last_assistant(), Some("Hello!"));

        let cmds = synthesized(&mut session, 0, "fallback");
        assert_eq!(audio(&cmds), vec![Bytes::from("fallback")]);
        assert_eq!(
            session.memory().last_assistant(),
            Some("Sorry, I'm temporarily unavailable.")
        );
        assert_eq!(session.memory().count_role(Role::Assistant), 2);
    }

    #[test]
    fn test_model_failure_after_partial_output_commits_what_was_said() {
        let mut session = started();
        ask(&mut session, "hours?", Ok(ContextResult::default()));
        stream_reply(&mut session, 1, &["Sure •"]);
        let cmds = session.handle(SessionEvent::ReplyFailed {
            reply_id: 1,
            error: Error::Llm("stream reset".to_string()),
        });
        assert!(synth_requests(&cmds).is_empty());

        synthesized(&mut session, 0, "c0");
        assert_eq!(session.memory().last_assistant(), Some("Sure •"));
        assert_eq!(session.memory().count_role(Role::Assistant), 2);
    }

    #[test]
    fn test_synthesis_failure_does_not_block_successors() {
        let mut session = started();
        ask(&mut session, "hours?", Ok(ContextResult::default()));
        stream_reply(&mut session, 1, &["We open •", " at nine."]);
        session.handle(SessionEvent::ReplyCompleted { reply_id: 1 });

        assert!(synthesized(&mut session, 1, "c1").is_empty());
        let cmds = session.handle(SessionEvent::Synthesized {
            key: OrderingKey::Sequenced(0),
            generation: 0,
            result: Err(Error::Synthesis("HTTP 429".to_string())),
        });
        assert_eq!(audio(&cmds), vec![Bytes::from("c1")]);
        assert_eq!(session.memory().count_role(Role::Assistant), 2);
        // Only the chunk the caller heard is remembered
        assert_eq!(session.memory().last_assistant(), Some("at nine."));
    }

    #[test]
    fn test_every_chunk_failing_speaks_fallback() {
        let mut session = started();
        ask(&mut session, "hours?", Ok(ContextResult::default()));
        stream_reply(&mut session, 1, &["We open •"]);
        session.handle(SessionEvent::ReplyCompleted { reply_id: 1 });

        let cmds = session.handle(SessionEvent::Synthesized {
            key: OrderingKey::Sequenced(0),
            generation: 0,
            result: Err(Error::Synthesis("HTTP 503".to_string())),
        });
        assert_eq!(
            synth_requests(&cmds),
            vec![(
                OrderingKey::Sequenced(1),
                0,
                "Sorry, I'm temporarily unavailable.".to_string()
            )]
        );
        assert_eq!(session.memory().count_role(Role::Assistant), 1);
    }

    #[test]
    fn test_greeting_remembered_once_delivered() {
        let mut session = CallSession::new(settings());
        session.handle(SessionEvent::Start {
            call_id: "CA123".to_string(),
            stream_id: "MZ456".to_string(),
            caller_id: CallerId::unknown(),
        });
        assert_eq!(session.memory().count_role(Role::Assistant), 0);

        session.handle(SessionEvent::Synthesized {
            key: OrderingKey::Bypass,
            generation: 0,
            result: Err(Error::Synthesis("HTTP 500".to_string())),
        });
        assert_eq!(session.memory().count_role(Role::Assistant), 0);

        let mut session = CallSession::new(settings());
        session.handle(SessionEvent::Start {
            call_id: "CA124".to_string(),
            stream_id: "MZ457".to_string(),
            caller_id: CallerId::unknown(),
        });
        session.handle(SessionEvent::Synthesized {
            key: OrderingKey::Bypass,
            generation: 0,
            result: Ok(Bytes::from_static(b"hello-audio")),
        });
        assert_eq!(session.memory().last_assistant(), Some("Hello!"));
    }

    #[test]
    fn test_interrupted_fallback_not_remembered() {
        let mut session = started();
        ask(&mut session, "hours?", Ok(ContextResult::default()));
        stream_reply(&mut session, 1, &["We open •"]);
        synthesized(&mut session, 0, "c0");

        let cmds = session.handle(SessionEvent::RecognizerFailed {
            error: "socket closed".to_string(),
        });
        assert_eq!(synth_requests(&cmds)[0].0, OrderingKey::Sequenced(1));
        session.handle(SessionEvent::Interim {
            text: "wait".to_string(),
        });
        // Fallback audio from before the interruption is dropped on arrival
        assert!(session
            .handle(SessionEvent::Synthesized {
                key: OrderingKey::Sequenced(1),
                generation: 0,
                result: Ok(Bytes::from("fallback")),
            })
            .is_empty());

        assert_eq!(session.memory().count_role(Role::Assistant), 2);
        assert_eq!(session.memory().last_assistant(), Some("We open •"));
    }

    #[test]
    fn test_superseded_retrieval_keeps_utterance_without_context() {
        let mut session = started();
        session.handle(SessionEvent::Final {
            text: "hours?".to_string(),
        });
        session.handle(SessionEvent::Final {
            text: "actually, returns?".to_string(),
        });

        let cmds = session.handle(SessionEvent::RetrievalCompleted {
            seq: 1,
            utterance: "hours?".to_string(),
            outcome: Ok(ContextResult::context("open 9-5")),
        });
        assert!(cmds.is_empty());
        let cmds = session.handle(SessionEvent::RetrievalCompleted {
            seq: 2,
            utterance: "actually, returns?".to_string(),
            outcome: Ok(ContextResult::context("30-day returns")),
        });
        assert!(matches!(&cmds[..], [SessionCommand::Complete { reply_id: 1, .. }]));

        let roles: Vec<Role> = session.memory().messages().iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![
                Role::System,
                Role::Assistant,
                Role::Caller,
                Role::Caller,
                Role::Context
            ]
        );
        assert_eq!(session.memory().count_role(Role::Context), 1);
    }

    #[test]
    fn test_late_retrieval_for_earlier_turn_dropped() {
        let mut session = started();
        session.handle(SessionEvent::Final {
            text: "hours?".to_string(),
        });
        session.handle(SessionEvent::Final {
            text: "actually, returns?".to_string(),
        });
        session.handle(SessionEvent::RetrievalCompleted {
            seq: 2,
            utterance: "actually, returns?".to_string(),
            outcome: Ok(ContextResult::context("30-day returns")),
        });
        let memory_len = session.memory().len();

        let cmds = session.handle(SessionEvent::RetrievalCompleted {
            seq: 1,
            utterance: "hours?".to_string(),
            outcome: Ok(ContextResult::context("open 9-5")),
        });
        assert!(cmds.is_empty());
        assert_eq!(session.memory().len(), memory_len);
        assert_eq!(session.turn_counter(), 1);
    }

    #[test]
    fn test_recognizer_failure_fallback_spoken_once() {
        let mut session = started();
        let first = session.handle(SessionEvent::RecognizerFailed {
            error: "socket closed".to_string(),
        });
        let second = session.handle(SessionEvent::RecognizerFailed {
            error: "socket closed".to_string(),
        });
        assert_eq!(synth_requests(&first).len(), 1);
        assert!(second.is_empty());
    }

    #[test]
    fn test_events_before_start_ignored() {
        let mut session = CallSession::new(settings());
        assert!(session
            .handle(SessionEvent::Media(Bytes::from_static(b"\x7f")))
            .is_empty());
        assert!(session
            .handle(SessionEvent::Final {
                text: "hello".to_string()
            })
            .is_empty());
        assert_eq!(session.state(), SessionState::AwaitingStart);

        let mut session = started();
        let cmds = session.handle(SessionEvent::Media(Bytes::from_static(b"\x7f")));
        assert_eq!(
            cmds,
            vec![SessionCommand::ForwardAudio(Bytes::from_static(b"\x7f"))]
        );
    }

    #[test]
    fn test_stop_is_idempotent() {
        let mut session = started();
        let cmds = session.handle(SessionEvent::Stop);
        assert_eq!(
            cmds,
            vec![SessionCommand::CancelSynthesis, SessionCommand::Close]
        );
        assert!(session.is_closed());
        assert!(session.handle(SessionEvent::Stop).is_empty());
        assert!(session
            .handle(SessionEvent::Final {
                text: "hello".to_string()
            })
            .is_empty());
    }

    #[test]
    fn test_speakable_strips_delimiter() {
        assert_eq!(speakable("We •", "•"), "We");
        assert_eq!(speakable(" offer 30 •", "•"), "offer 30");
        assert_eq!(speakable("• •", "•"), "");
    }
}

//! Session actor
//!
//! Runs a [`CallSession`] on its own task. Events arrive on one channel and
//! are applied strictly one at a time; every collaborator call runs on a
//! spawned task that posts its outcome back as a new event. Nothing outside
//! this task touches the session state while the call is live.

use phone_agent_core::{
    CallTransfer, ContextQuery, ContextRetriever, EscalationLog, EscalationRecord, LanguageModel,
    Message, OrderingKey, OutboundFrame, RecognizerEvent, SpeechRecognizer, SpeechSynthesizer,
};
use bytes::Bytes;
use futures::StreamExt;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::session::{CallSession, SessionCommand, SessionEvent, SessionSettings};
use crate::AgentError;

/// External services a call talks to
#[derive(Clone)]
pub struct Collaborators {
    pub recognizer: Arc<dyn SpeechRecognizer>,
    pub retriever: Arc<dyn ContextRetriever>,
    pub model: Arc<dyn LanguageModel>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
    pub transfer: Arc<dyn CallTransfer>,
    pub escalation_log: Arc<dyn EscalationLog>,
}

/// Handle to a running session
pub struct SessionHandle {
    tx: mpsc::Sender<SessionEvent>,
    task: JoinHandle<CallSession>,
}

impl SessionHandle {
    /// Deliver a transport event to the session
    pub async fn send(&self, event: SessionEvent) -> Result<(), AgentError> {
        self.tx
            .send(event)
            .await
            .map_err(|_| AgentError::ChannelClosed)
    }

    pub fn sender(&self) -> mpsc::Sender<SessionEvent> {
        self.tx.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the session to close and return its final state
    ///
    /// Dropping the handle's sender counts as a stop once every in-flight
    /// task has posted back.
    pub async fn join(self) -> Result<CallSession, AgentError> {
        drop(self.tx);
        self.task
            .await
            .map_err(|e| AgentError::Session(format!("session task failed: {}", e)))
    }
}

/// Start a session actor for one call
pub fn spawn_session(
    settings: SessionSettings,
    collaborators: Collaborators,
    outbound: mpsc::Sender<OutboundFrame>,
    buffer: usize,
) -> SessionHandle {
    let (tx, rx) = mpsc::channel(buffer.max(1));
    let call_token = CancellationToken::new();
    let actor = SessionActor {
        session: CallSession::new(settings),
        collaborators,
        outbound,
        events: tx.downgrade(),
        inbox: VecDeque::new(),
        recognizer_audio: None,
        reply_token: call_token.child_token(),
        call_token,
    };
    let task = tokio::spawn(actor.run(rx));
    SessionHandle { tx, task }
}

struct SessionActor {
    session: CallSession,
    collaborators: Collaborators,
    outbound: mpsc::Sender<OutboundFrame>,
    /// Weak so that the session ends once the transport drops its sender
    events: mpsc::WeakSender<SessionEvent>,
    /// Events raised by the actor itself, applied before the channel
    inbox: VecDeque<SessionEvent>,
    recognizer_audio: Option<mpsc::Sender<Bytes>>,
    /// Cancelled on interruption: in-flight synthesis
    reply_token: CancellationToken,
    /// Cancelled when the call ends
    call_token: CancellationToken,
}

impl SessionActor {
    async fn run(mut self, mut rx: mpsc::Receiver<SessionEvent>) -> CallSession {
        loop {
            let event = match self.inbox.pop_front() {
                Some(event) => event,
                None => rx.recv().await.unwrap_or(SessionEvent::Stop),
            };

            let commands = self.session.handle(event);
            for command in commands {
                self.execute(command).await;
            }

            if self.session.is_closed() {
                break;
            }
        }

        self.call_token.cancel();
        self.recognizer_audio = None;
        tracing::debug!(call_id = %self.session.call_id(), "Session actor stopped");
        self.session
    }

    async fn execute(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::ConnectRecognizer => self.connect_recognizer().await,
            SessionCommand::ForwardAudio(audio) => {
                if let Some(tx) = &self.recognizer_audio {
                    if let Err(e) = tx.try_send(audio) {
                        tracing::trace!(error = %e, "Recognizer audio dropped");
                    }
                }
            }
            SessionCommand::Retrieve { seq, query } => self.spawn_retrieval(seq, query),
            SessionCommand::Complete { reply_id, messages } => {
                self.spawn_completion(reply_id, messages)
            }
            SessionCommand::Synthesize {
                key,
                generation,
                text,
            } => self.spawn_synthesis(key, generation, text),
            SessionCommand::Send(frame) => {
                if self.outbound.send(frame).await.is_err() {
                    tracing::debug!(call_id = %self.session.call_id(), "Transport gone");
                    self.inbox.push_back(SessionEvent::Stop);
                }
            }
            SessionCommand::CancelSynthesis => {
                self.reply_token.cancel();
                self.reply_token = self.call_token.child_token();
            }
            SessionCommand::RecordEscalation(record) => self.spawn_escalation_log(record),
            SessionCommand::Transfer {
                call_id,
                destination,
            } => self.spawn_transfer(call_id, destination),
            SessionCommand::Close => self.call_token.cancel(),
        }
    }

    async fn connect_recognizer(&mut self) {
        match self.collaborators.recognizer.connect().await {
            Ok(stream) => {
                tracing::debug!(
                    model = %self.collaborators.recognizer.model_name(),
                    "Recognizer connected"
                );
                self.recognizer_audio = Some(stream.audio_tx);
                tokio::spawn(forward_recognizer(
                    stream.events,
                    self.events.clone(),
                    self.call_token.clone(),
                ));
            }
            Err(e) => self.inbox.push_back(SessionEvent::RecognizerFailed {
                error: e.to_string(),
            }),
        }
    }

    fn spawn_retrieval(&self, seq: u64, query: ContextQuery) {
        let retriever = self.collaborators.retriever.clone();
        let events = self.events.clone();
        let token = self.call_token.clone();

        tokio::spawn(async move {
            let started = Instant::now();
            tokio::select! {
                _ = token.cancelled() => {}
                outcome = retriever.retrieve(&query) => {
                    metrics::histogram!("phone_agent_retrieval_latency_seconds")
                        .record(started.elapsed().as_secs_f64());
                    post(
                        &events,
                        SessionEvent::RetrievalCompleted {
                            seq,
                            utterance: query.utterance.clone(),
                            outcome,
                        },
                    )
                    .await;
                }
            }
        });
    }

    /// Runs to the end of the model stream even after an interruption; the
    /// session ignores fragments of a reply it no longer tracks.
    fn spawn_completion(&self, reply_id: u64, messages: Vec<Message>) {
        let model = self.collaborators.model.clone();
        let events = self.events.clone();
        let token = self.call_token.clone();

        tokio::spawn(async move {
            let started = Instant::now();
            let generate = async {
                let mut stream = match model.stream_reply(messages).await {
                    Ok(stream) => stream,
                    Err(error) => {
                        post(&events, SessionEvent::ReplyFailed { reply_id, error }).await;
                        return;
                    }
                };

                let mut first = true;
                while let Some(item) = stream.next().await {
                    match item {
                        Ok(text) => {
                            if first {
                                first = false;
                                metrics::histogram!("phone_agent_first_fragment_latency_seconds")
                                    .record(started.elapsed().as_secs_f64());
                            }
                            post(&events, SessionEvent::ReplyFragment { reply_id, text }).await;
                        }
                        Err(error) => {
                            post(&events, SessionEvent::ReplyFailed { reply_id, error }).await;
                            return;
                        }
                    }
                }
                post(&events, SessionEvent::ReplyCompleted { reply_id }).await;
            };

            tokio::select! {
                _ = token.cancelled() => tracing::trace!(reply_id, "Generation abandoned at call end"),
                _ = generate => {}
            }
        });
    }

    fn spawn_synthesis(&self, key: OrderingKey, generation: u64, text: String) {
        let synthesizer = self.collaborators.synthesizer.clone();
        let events = self.events.clone();
        let token = self.reply_token.clone();

        tokio::spawn(async move {
            let started = Instant::now();
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::trace!(ordering_key = %key, "Synthesis cancelled");
                }
                result = synthesizer.synthesize(&text) => {
                    metrics::histogram!("phone_agent_synthesis_latency_seconds")
                        .record(started.elapsed().as_secs_f64());
                    post(&events, SessionEvent::Synthesized { key, generation, result }).await;
                }
            }
        });
    }

    fn spawn_escalation_log(&self, record: EscalationRecord) {
        let log = self.collaborators.escalation_log.clone();
        tokio::spawn(async move {
            if let Err(e) = log.record(&record).await {
                tracing::warn!(error = %e, caller = %record.caller, "Failed to record escalation");
                metrics::counter!("phone_agent_collaborator_errors_total", "kind" => e.kind())
                    .increment(1);
            }
        });
    }

    fn spawn_transfer(&self, call_id: String, destination: String) {
        let transfer = self.collaborators.transfer.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = transfer.transfer(&call_id, &destination).await;
            post(&events, SessionEvent::TransferCompleted { result }).await;
        });
    }
}

/// Post an event back to the session if it is still running
async fn post(events: &mpsc::WeakSender<SessionEvent>, event: SessionEvent) {
    if let Some(tx) = events.upgrade() {
        let _ = tx.send(event).await;
    }
}

async fn forward_recognizer(
    mut stream: mpsc::Receiver<RecognizerEvent>,
    events: mpsc::WeakSender<SessionEvent>,
    token: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = token.cancelled() => break,
            next = stream.recv() => next,
        };
        let event = match next {
            Some(RecognizerEvent::Interim(text)) => SessionEvent::Interim { text },
            Some(RecognizerEvent::Final(text)) => SessionEvent::Final { text },
            Some(RecognizerEvent::Failed(error)) => SessionEvent::RecognizerFailed { error },
            Some(RecognizerEvent::Closed) | None => break,
        };
        let Some(tx) = events.upgrade() else {
            break;
        };
        if tx.send(event).await.is_err() {
            break;
        }
    }
    tracing::trace!("Recognizer forwarder stopped");
}

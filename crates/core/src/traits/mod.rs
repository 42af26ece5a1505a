//! Collaborator traits for the phone agent
//!
//! Every external service the call session depends on sits behind one of
//! these traits so backends can be swapped and sessions tested with mocks.
//!
//! # Trait Hierarchy
//!
//! ```text
//! Speech:
//!   - SpeechRecognizer: live audio → interim / final transcripts
//!   - SpeechSynthesizer: text fragment → audio payload
//!
//! Language Models:
//!   - LanguageModel: history → lazy stream of reply fragments
//!
//! Retrieval:
//!   - ContextRetriever: utterance + history → context, escalation flag
//!
//! Telephony:
//!   - CallTransfer: hand the live call to a human
//!   - EscalationLog: best-effort record of each hand-off
//! ```

mod llm;
mod retriever;
mod speech;
mod telephony;

pub use llm::{LanguageModel, ReplyStream};
pub use retriever::{ContextQuery, ContextResult, ContextRetriever};
pub use speech::{RecognizerEvent, RecognizerStream, SpeechRecognizer, SpeechSynthesizer};
pub use telephony::{CallTransfer, EscalationLog, EscalationRecord};

//! Escalation Gate
//!
//! Decides, per caller turn, whether the retrieval result sends the call to
//! the language model or to a human. The decision is one-way: once the gate
//! has escalated, every later result is frozen out.

use phone_agent_core::{ContextResult, Error};

/// Routing decision for one turn
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    /// Continue to the language model with this context (possibly empty)
    Reply { context: String },
    /// Hand the call to a human
    Escalate,
    /// Already escalated; the result is ignored
    Frozen,
}

/// One-way escalation latch
#[derive(Debug, Default)]
pub struct EscalationGate {
    escalated: bool,
}

impl EscalationGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route a retrieval outcome
    ///
    /// A failed retrieval degrades to an empty context; it never escalates.
    pub fn route(&mut self, outcome: Result<ContextResult, Error>) -> GateDecision {
        if self.escalated {
            return GateDecision::Frozen;
        }

        match outcome {
            Ok(result) if result.is_escalation => {
                self.escalated = true;
                GateDecision::Escalate
            }
            Ok(result) => GateDecision::Reply {
                context: result.context,
            },
            Err(e) => {
                tracing::warn!(error = %e, "Retrieval failed, continuing without context");
                metrics::counter!("phone_agent_collaborator_errors_total", "kind" => e.kind())
                    .increment(1);
                GateDecision::Reply {
                    context: String::new(),
                }
            }
        }
    }

    pub fn is_escalated(&self) -> bool {
        self.escalated
    }
}

//! Phase/handoff engine.
//!
//! Picks the next step for a session from its current phase and the
//! classified intent. Transitions are first-match in declaration order.

use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::classifier::{ClassificationResult, has_slot};
use crate::rules::{HandoffSpec, PhaseDefinition, RulePackStore, TransitionDefinition};
use crate::session::SessionState;

/// Action label for the say-again branches.
pub const SAY_AGAIN: &str = "SAY_AGAIN";

/// How a decision was reached. The two say-again kinds render the same.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    /// A transition fired.
    Transition,
    /// The intent is not allowed in the current phase.
    OutOfContext,
    /// Allowed, but no transition survived its filters.
    NoTransition,
    /// Nothing applies and the phase has no fallback template.
    NoDecision,
}

/// What to do with this turn.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlowDecision {
    pub kind: DecisionKind,
    pub next_phase: String,
    pub template_id: Option<String>,
    pub action: Option<String>,
    pub handoff: Option<HandoffSpec>,
    pub open_pending_handoff: bool,
    pub commit_pending_handoff: bool,
}

impl FlowDecision {
    fn say_again(kind: DecisionKind, phase: &PhaseDefinition) -> Self {
        Self {
            kind,
            next_phase: phase.id.clone(),
            template_id: phase.fallback_template.clone(),
            action: Some(SAY_AGAIN.to_string()),
            handoff: None,
            open_pending_handoff: false,
            commit_pending_handoff: false,
        }
    }

    fn none(phase: &PhaseDefinition) -> Self {
        Self {
            kind: DecisionKind::NoDecision,
            next_phase: phase.id.clone(),
            template_id: None,
            action: None,
            handoff: None,
            open_pending_handoff: false,
            commit_pending_handoff: false,
        }
    }
}

/// Resolves flow decisions against the rule pack.
pub struct PhaseEngine {
    store: Arc<RulePackStore>,
}

impl PhaseEngine {
    pub fn new(store: Arc<RulePackStore>) -> Self {
        Self { store }
    }

    /// Decide the next step. Never fails.
    pub fn decide(&self, state: &SessionState, classification: &ClassificationResult) -> FlowDecision {
        let phase = self.store.resolve_phase(&state.phase);
        let intent = classification.intent.as_str();

        if !phase.allows(intent) {
            debug!(phase = %phase.id, intent, "Intent out of context for phase");
            return FlowDecision::say_again(DecisionKind::OutOfContext, phase);
        }

        let winner = phase
            .transitions
            .iter()
            .find(|t| t.intent == intent && transition_applies(t, state, classification));

        match winner {
            Some(t) => {
                let decision = FlowDecision {
                    kind: DecisionKind::Transition,
                    next_phase: t.next_phase.clone().unwrap_or_else(|| phase.id.clone()),
                    template_id: t.template.clone(),
                    action: Some(
                        t.action
                            .clone()
                            .or_else(|| t.template.clone())
                            .unwrap_or_else(|| intent.to_string()),
                    ),
                    handoff: t.open_handoff.clone(),
                    open_pending_handoff: t.open_handoff.is_some(),
                    commit_pending_handoff: t.commit_pending_handoff,
                };
                debug!(
                    phase = %phase.id,
                    intent,
                    next_phase = %decision.next_phase,
                    action = decision.action.as_deref().unwrap_or(""),
                    "Transition selected"
                );
                decision
            }
            None if phase.fallback_template.is_some() => {
                debug!(phase = %phase.id, intent, "No transition matched, using phase fallback");
                FlowDecision::say_again(DecisionKind::NoTransition, phase)
            }
            None => FlowDecision::none(phase),
        }
    }
}

fn transition_applies(
    transition: &TransitionDefinition,
    state: &SessionState,
    classification: &ClassificationResult,
) -> bool {
    let needs_pending = transition.requires_pending_handoff || transition.commit_pending_handoff;
    if needs_pending && !state.has_pending_handoff() {
        return false;
    }
    transition
        .required_slots
        .iter()
        .all(|slot| has_slot(&classification.slots, slot))
}

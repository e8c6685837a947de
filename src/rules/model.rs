//! Rule table types as they appear in the JSON configuration.

use serde::{Deserialize, Serialize};

use crate::role::ControllerRole;

// ── Intents ─────────────────────────────────────────────────────────

/// `intents.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntentTable {
    /// Free-form pack version, logged at load.
    #[serde(default)]
    pub version: Option<String>,
    /// Pack-wide minimum score for an intent to win.
    #[serde(default)]
    pub default_threshold: Option<f32>,
    /// Below this winning confidence the fallback classifier is consulted.
    #[serde(default)]
    pub fallback_threshold: Option<f32>,
    #[serde(default)]
    pub intents: Vec<IntentDefinition>,
}

/// One classifiable intent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentDefinition {
    pub id: String,
    /// Slots the intent expects; missing ones soften the score.
    #[serde(default)]
    pub required_slots: Vec<String>,
    /// Phases in which the intent is eligible. Empty means everywhere.
    #[serde(default)]
    pub allowed_phases: Vec<String>,
    #[serde(default)]
    pub rules: Vec<ScoringRuleDefinition>,
    /// Per-intent threshold override.
    #[serde(default)]
    pub min_score: Option<f32>,
}

/// A scoring rule: matches when any keyword or any pattern hits.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScoringRuleDefinition {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default, alias = "patterns")]
    pub regex: Vec<String>,
    #[serde(default)]
    pub boost: f32,
    /// Added on top of `boost` when the intent is expected next.
    #[serde(default)]
    pub expected_boost: f32,
}

// ── Phases ──────────────────────────────────────────────────────────

/// `phases.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhaseTable {
    #[serde(default)]
    pub phases: Vec<PhaseDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseDefinition {
    pub id: String,
    /// Intents accepted in this phase. Empty means any.
    #[serde(default)]
    pub allowed_intents: Vec<String>,
    #[serde(default)]
    pub default_role: Option<ControllerRole>,
    /// Intents that get the expected-next scoring boost.
    #[serde(default)]
    pub expected_next: Vec<String>,
    #[serde(default)]
    pub transitions: Vec<TransitionDefinition>,
    #[serde(default)]
    pub fallback_template: Option<String>,
}

impl PhaseDefinition {
    /// Whether `intent` may be handled in this phase.
    pub fn allows(&self, intent: &str) -> bool {
        self.allowed_intents.is_empty() || self.allowed_intents.iter().any(|i| i == intent)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransitionDefinition {
    /// Triggering intent id.
    pub intent: String,
    #[serde(default)]
    pub required_slots: Vec<String>,
    #[serde(default)]
    pub requires_pending_handoff: bool,
    /// Opens a pending handoff to this target.
    #[serde(default)]
    pub open_handoff: Option<HandoffSpec>,
    #[serde(default)]
    pub commit_pending_handoff: bool,
    #[serde(default)]
    pub next_phase: Option<String>,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub template: Option<String>,
}

/// Target of a handoff as declared by a transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandoffSpec {
    pub role: ControllerRole,
    #[serde(default)]
    pub frequency: Option<String>,
    /// Literal facility (ICAO code). Wins over `airport`.
    #[serde(default)]
    pub facility: Option<String>,
    /// Which end of the flight the target unit belongs to, when the role
    /// alone does not say (arrival tower vs departure tower).
    #[serde(default)]
    pub airport: Option<Airport>,
}

/// One end of the flight plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Airport {
    Origin,
    Destination,
}

// ── Templates ───────────────────────────────────────────────────────

/// `templates.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TemplateTable {
    #[serde(default)]
    pub templates: Vec<TemplateDefinition>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TemplateDefinition {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub phase: Option<String>,
    #[serde(default)]
    pub intent: Option<String>,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub variants: Vec<String>,
    #[serde(default)]
    pub readback_required: bool,
    #[serde(default)]
    pub readback_items: Vec<String>,
}

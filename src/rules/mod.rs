//! Versioned rule pack: intents, phases/transitions and response templates.

pub mod model;
pub mod store;

pub use model::{
    Airport, HandoffSpec, IntentDefinition, IntentTable, PhaseDefinition, PhaseTable,
    ScoringRuleDefinition, TemplateDefinition, TemplateTable, TransitionDefinition,
};
pub use store::{Intent, RulePackStore, ScoringRule};

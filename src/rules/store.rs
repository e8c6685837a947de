//! Rule pack store: compiled, indexed, immutable.
//!
//! Built once from the three rule tables and shared behind an `Arc` by every
//! session. Nothing here mutates after construction. Lookups by id return
//! `Option` and never fail; dangling references are reported at load.

use std::collections::HashMap;
use std::path::Path;

use regex::{Regex, RegexBuilder};
use tracing::{info, warn};

use crate::classifier::{UNKNOWN_INTENT, normalize};
use crate::error::RulePackError;
use crate::role::ControllerRole;
use crate::rules::model::{
    IntentTable, PhaseDefinition, PhaseTable, ScoringRuleDefinition, TemplateDefinition,
    TemplateTable,
};

const INTENTS_FILE: &str = "intents.json";
const PHASES_FILE: &str = "phases.json";
const TEMPLATES_FILE: &str = "templates.json";

const BUILTIN_INTENTS: &str = include_str!("../../rules/intents.json");
const BUILTIN_PHASES: &str = include_str!("../../rules/phases.json");
const BUILTIN_TEMPLATES: &str = include_str!("../../rules/templates.json");

/// A scoring rule with keywords normalized and patterns compiled.
#[derive(Debug, Clone)]
pub struct ScoringRule {
    pub id: Option<String>,
    pub keywords: Vec<String>,
    pub patterns: Vec<Regex>,
    pub boost: f32,
    pub expected_boost: f32,
}

/// An intent ready for scoring.
#[derive(Debug, Clone)]
pub struct Intent {
    pub id: String,
    pub required_slots: Vec<String>,
    pub allowed_phases: Vec<String>,
    pub rules: Vec<ScoringRule>,
    pub min_score: Option<f32>,
}

impl Intent {
    /// Whether the intent is eligible in `phase`.
    pub fn eligible_in(&self, phase: &str) -> bool {
        self.allowed_phases.is_empty() || self.allowed_phases.iter().any(|p| p == phase)
    }
}

/// The immutable rule pack.
#[derive(Debug)]
pub struct RulePackStore {
    version: Option<String>,
    default_threshold: Option<f32>,
    fallback_threshold: Option<f32>,
    intents: Vec<Intent>,
    phases: Vec<PhaseDefinition>,
    templates: Vec<TemplateDefinition>,
    intent_index: HashMap<String, usize>,
    phase_index: HashMap<String, usize>,
    template_index: HashMap<String, usize>,
    role_phases: HashMap<ControllerRole, usize>,
}

impl RulePackStore {
    /// Build the store from parsed tables.
    pub fn from_tables(
        intents: IntentTable,
        phases: PhaseTable,
        templates: TemplateTable,
    ) -> Result<Self, RulePackError> {
        if phases.phases.is_empty() {
            return Err(RulePackError::NoPhases);
        }

        let compiled = intents
            .intents
            .into_iter()
            .map(|def| {
                let rules = def
                    .rules
                    .iter()
                    .map(|rule| compile_rule(&def.id, rule))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Intent {
                    id: def.id,
                    required_slots: def.required_slots,
                    allowed_phases: def.allowed_phases,
                    rules,
                    min_score: def.min_score,
                })
            })
            .collect::<Result<Vec<_>, RulePackError>>()?;

        // First declaration wins on duplicate ids.
        let mut intent_index = HashMap::new();
        for (i, intent) in compiled.iter().enumerate() {
            intent_index.entry(intent.id.clone()).or_insert(i);
        }

        let mut phase_index = HashMap::new();
        let mut role_phases = HashMap::new();
        for (i, phase) in phases.phases.iter().enumerate() {
            phase_index.entry(phase.id.clone()).or_insert(i);
            if let Some(role) = phase.default_role {
                role_phases.entry(role).or_insert(i);
            }
        }

        let mut template_index = HashMap::new();
        for (i, template) in templates.templates.iter().enumerate() {
            if let Some(id) = &template.id {
                template_index.entry(id.clone()).or_insert(i);
            }
        }

        let store = Self {
            version: intents.version,
            default_threshold: intents.default_threshold,
            fallback_threshold: intents.fallback_threshold,
            intents: compiled,
            phases: phases.phases,
            templates: templates.templates,
            intent_index,
            phase_index,
            template_index,
            role_phases,
        };
        store.report_dangling_references();

        info!(
            version = store.version.as_deref().unwrap_or("unversioned"),
            intents = store.intents.len(),
            phases = store.phases.len(),
            templates = store.templates.len(),
            "Rule pack loaded"
        );
        Ok(store)
    }

    /// Parse the three tables from JSON text.
    pub fn from_json(intents: &str, phases: &str, templates: &str) -> Result<Self, RulePackError> {
        Self::from_tables(
            parse_table(INTENTS_FILE, intents)?,
            parse_table(PHASES_FILE, phases)?,
            parse_table(TEMPLATES_FILE, templates)?,
        )
    }

    /// Load `intents.json`, `phases.json` and `templates.json` from `dir`.
    pub fn load_dir(dir: &Path) -> Result<Self, RulePackError> {
        let read = |file: &str| {
            std::fs::read_to_string(dir.join(file)).map_err(|source| RulePackError::Io {
                file: dir.join(file).display().to_string(),
                source,
            })
        };
        Self::from_json(
            &read(INTENTS_FILE)?,
            &read(PHASES_FILE)?,
            &read(TEMPLATES_FILE)?,
        )
    }

    /// The rule pack compiled into the crate.
    pub fn builtin() -> Result<Self, RulePackError> {
        Self::from_json(BUILTIN_INTENTS, BUILTIN_PHASES, BUILTIN_TEMPLATES)
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn default_threshold(&self) -> Option<f32> {
        self.default_threshold
    }

    pub fn fallback_threshold(&self) -> Option<f32> {
        self.fallback_threshold
    }

    /// Intents in declaration order.
    pub fn intents(&self) -> &[Intent] {
        &self.intents
    }

    /// Intent ids a transmission in `phase` may be labelled with.
    ///
    /// The phase's own list when it has one; otherwise every intent eligible
    /// in the phase.
    pub fn candidate_intents(&self, phase: &PhaseDefinition) -> Vec<String> {
        if !phase.allowed_intents.is_empty() {
            return phase.allowed_intents.clone();
        }
        self.intents
            .iter()
            .filter(|intent| intent.eligible_in(&phase.id))
            .map(|intent| intent.id.clone())
            .collect()
    }

    pub fn intent(&self, id: &str) -> Option<&Intent> {
        self.intent_index.get(id).map(|&i| &self.intents[i])
    }

    pub fn phases(&self) -> &[PhaseDefinition] {
        &self.phases
    }

    pub fn phase(&self, id: &str) -> Option<&PhaseDefinition> {
        self.phase_index.get(id).map(|&i| &self.phases[i])
    }

    /// The first declared phase. Construction guarantees one exists.
    pub fn first_phase(&self) -> &PhaseDefinition {
        &self.phases[0]
    }

    /// Look up `id`, degrading to the first declared phase.
    pub fn resolve_phase(&self, id: &str) -> &PhaseDefinition {
        self.phase(id).unwrap_or_else(|| {
            warn!(phase = id, fallback = %self.phases[0].id, "Unknown phase, using first declared phase");
            self.first_phase()
        })
    }

    /// The phase owned by `role`, if the pack maps one.
    pub fn phase_for_role(&self, role: ControllerRole) -> Option<&PhaseDefinition> {
        self.role_phases.get(&role).map(|&i| &self.phases[i])
    }

    /// Templates in declaration order.
    pub fn templates(&self) -> &[TemplateDefinition] {
        &self.templates
    }

    pub fn template(&self, id: &str) -> Option<&TemplateDefinition> {
        self.template_index.get(id).map(|&i| &self.templates[i])
    }

    fn report_dangling_references(&self) {
        for phase in &self.phases {
            if let Some(id) = &phase.fallback_template {
                if self.template(id).is_none() {
                    warn!(phase = %phase.id, template = %id, "Phase fallback template not found");
                }
            }
            for intent in &phase.allowed_intents {
                if intent != UNKNOWN_INTENT && self.intent(intent).is_none() {
                    warn!(phase = %phase.id, intent = %intent, "Allowed intent not declared");
                }
            }
            for transition in &phase.transitions {
                if let Some(next) = &transition.next_phase {
                    if self.phase(next).is_none() {
                        warn!(phase = %phase.id, next = %next, "Transition targets unknown phase");
                    }
                }
                if let Some(id) = &transition.template {
                    if self.template(id).is_none() {
                        warn!(phase = %phase.id, template = %id, "Transition template not found");
                    }
                }
            }
        }
        for intent in &self.intents {
            for phase in &intent.allowed_phases {
                if self.phase(phase).is_none() {
                    warn!(intent = %intent.id, phase = %phase, "Intent references unknown phase");
                }
            }
        }
    }
}

fn parse_table<T: serde::de::DeserializeOwned>(file: &str, raw: &str) -> Result<T, RulePackError> {
    serde_json::from_str(raw).map_err(|source| RulePackError::Parse {
        file: file.to_string(),
        source,
    })
}

fn compile_rule(intent: &str, rule: &ScoringRuleDefinition) -> Result<ScoringRule, RulePackError> {
    let patterns = rule
        .regex
        .iter()
        .map(|pattern| {
            RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .map_err(|source| RulePackError::InvalidPattern {
                    intent: intent.to_string(),
                    pattern: pattern.clone(),
                    source,
                })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(ScoringRule {
        id: rule.id.clone(),
        keywords: rule
            .keywords
            .iter()
            .map(|k| normalize(k))
            .filter(|k| !k.is_empty())
            .collect(),
        patterns,
        boost: rule.boost,
        expected_boost: rule.expected_boost,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTENTS: &str = r#"{
        "version": "test-1",
        "default_threshold": 0.5,
        "intents": [
            {"id": "A", "rules": [{"keywords": ["Hello, World!"], "boost": 0.7}]},
            {"id": "A", "rules": []}
        ]
    }"#;
    const PHASES: &str = r#"{"phases": [
        {"id": "clearance", "default_role": "delivery"},
        {"id": "ground", "default_role": "ground"},
        {"id": "ground_two", "default_role": "ground"}
    ]}"#;
    const TEMPLATES: &str = r#"{"templates": [{"id": "T1", "text": "hi"}]}"#;

    #[test]
    fn builds_indexes() {
        let store = RulePackStore::from_json(INTENTS, PHASES, TEMPLATES).unwrap();
        assert_eq!(store.version(), Some("test-1"));
        assert_eq!(store.default_threshold(), Some(0.5));
        assert!(store.template("T1").is_some());
        assert!(store.template("T2").is_none());
        assert_eq!(store.phase("ground").unwrap().id, "ground");
    }

    #[test]
    fn duplicate_ids_keep_first_declaration() {
        let store = RulePackStore::from_json(INTENTS, PHASES, TEMPLATES).unwrap();
        assert_eq!(store.intent("A").unwrap().rules.len(), 1);
        assert_eq!(
            store.phase_for_role(ControllerRole::Ground).unwrap().id,
            "ground"
        );
    }

    #[test]
    fn keywords_are_normalized() {
        let store = RulePackStore::from_json(INTENTS, PHASES, TEMPLATES).unwrap();
        assert_eq!(store.intent("A").unwrap().rules[0].keywords, vec!["hello world"]);
    }

    #[test]
    fn unknown_phase_resolves_to_first() {
        let store = RulePackStore::from_json(INTENTS, PHASES, TEMPLATES).unwrap();
        assert_eq!(store.resolve_phase("nowhere").id, "clearance");
        assert!(store.phase_for_role(ControllerRole::Center).is_none());
    }

    #[test]
    fn open_phase_offers_every_eligible_intent() {
        let intents = r#"{"intents": [
            {"id": "REQUEST_TAXI", "allowed_phases": ["ground"]},
            {"id": "REPORT_POSITION"},
            {"id": "REQUEST_DESCENT", "allowed_phases": ["center"]}
        ]}"#;
        let phases = r#"{"phases": [
            {"id": "ground"},
            {"id": "center", "allowed_intents": ["REQUEST_DESCENT"]}
        ]}"#;
        let store = RulePackStore::from_json(intents, phases, TEMPLATES).unwrap();
        assert_eq!(
            store.candidate_intents(store.resolve_phase("ground")),
            vec!["REQUEST_TAXI", "REPORT_POSITION"]
        );
        assert_eq!(store.candidate_intents(store.resolve_phase("center")), vec!["REQUEST_DESCENT"]);
    }

    #[test]
    fn invalid_regex_is_a_load_error() {
        let intents = r#"{"intents": [{"id": "BAD", "rules": [{"regex": ["("]}]}]}"#;
        let err = RulePackStore::from_json(intents, PHASES, TEMPLATES).unwrap_err();
        assert!(matches!(err, RulePackError::InvalidPattern { ref intent, .. } if intent == "BAD"));
    }

    #[test]
    fn empty_phase_table_rejected() {
        let err = RulePackStore::from_json(INTENTS, r#"{"phases": []}"#, TEMPLATES).unwrap_err();
        assert!(matches!(err, RulePackError::NoPhases));
    }

    #[test]
    fn malformed_json_names_the_file() {
        let err = RulePackStore::from_json(INTENTS, "{", TEMPLATES).unwrap_err();
        assert!(err.to_string().contains("phases.json"));
    }

    #[test]
    fn load_dir_reads_all_tables() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("intents.json"), INTENTS).unwrap();
        std::fs::write(dir.path().join("phases.json"), PHASES).unwrap();
        std::fs::write(dir.path().join("templates.json"), TEMPLATES).unwrap();
        let store = RulePackStore::load_dir(dir.path()).unwrap();
        assert_eq!(store.phases().len(), 3);
    }

    #[test]
    fn load_dir_missing_table_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = RulePackStore::load_dir(dir.path()).unwrap_err();
        assert!(matches!(err, RulePackError::Io { .. }));
    }

    #[test]
    fn builtin_pack_loads() {
        let store = RulePackStore::builtin().unwrap();
        assert_eq!(store.first_phase().id, "clearance");
        assert!(store.template("HANDOFF_REISSUE").is_some());
        for role in ControllerRole::ALL {
            assert!(store.phase_for_role(role).is_some(), "no phase for {role}");
        }
    }
}

//! Intent classifier: scored rule matching with phase gating.
//!
//! Rules run first and cost nothing. Only when the winning confidence stays
//! under the pack's fallback threshold is the fallback chain consulted, and
//! slots extracted by the rules are always carried into its result.

mod slots;

pub use slots::{SLOT_ALTITUDE, SLOT_FREQUENCY, SLOT_RUNWAY, SLOT_SQUAWK, SlotMap, extract_slots, has_slot, normalize};

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::ENGINE_DEFAULT_THRESHOLD;
use crate::error::FallbackError;
use crate::fallback::ClassifierChain;
use crate::rules::{Intent, RulePackStore};

/// Intent id when nothing cleared its threshold.
pub const UNKNOWN_INTENT: &str = "unknown";

/// Intent id of a pilot checking in after a handoff.
pub const HANDOFF_CHECKIN: &str = "HANDOFF_CHECKIN";

/// Intent id of a pilot reading back an instruction.
pub const READBACK: &str = "READBACK";

/// Multiplier applied when an intent's required slots are not all present.
const MISSING_SLOT_PENALTY: f32 = 0.6;

/// Phase-scoped inputs to classification.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClassificationContext {
    pub phase: String,
    pub expected_next: Vec<String>,
    /// Intent ids a fallback may choose from. Never empty for an open phase.
    pub allowed_intents: Vec<String>,
}

/// Where a classification came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationSource {
    Rules,
    Fallback,
}

/// Why a scoring rule contributed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleMatch {
    pub rule_id: Option<String>,
    pub contribution: f32,
    pub keywords: Vec<String>,
    pub patterns: Vec<String>,
}

/// Outcome of classifying one transmission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub intent: String,
    pub confidence: f32,
    #[serde(default)]
    pub slots: SlotMap,
    #[serde(default)]
    pub matches: Vec<RuleMatch>,
    pub source: ClassificationSource,
}

impl ClassificationResult {
    /// An "unknown" result at confidence 0.
    pub fn unknown(slots: SlotMap) -> Self {
        Self {
            intent: UNKNOWN_INTENT.to_string(),
            confidence: 0.0,
            slots,
            matches: Vec::new(),
            source: ClassificationSource::Rules,
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.intent == UNKNOWN_INTENT
    }
}

/// Scores transmissions against the rule pack's intent table.
pub struct IntentClassifier {
    store: Arc<RulePackStore>,
    engine_threshold: f32,
}

impl IntentClassifier {
    pub fn new(store: Arc<RulePackStore>) -> Self {
        Self {
            store,
            engine_threshold: ENGINE_DEFAULT_THRESHOLD,
        }
    }

    /// Override the engine-level threshold used when neither the intent nor the pack sets one.
    pub fn with_engine_threshold(mut self, threshold: f32) -> Self {
        self.engine_threshold = threshold;
        self
    }

    /// Below this the fallback chain is consulted.
    pub fn fallback_threshold(&self) -> f32 {
        self.store
            .fallback_threshold()
            .or(self.store.default_threshold())
            .unwrap_or(self.engine_threshold)
    }

    /// Classify using rules only. Never fails.
    pub fn classify_rules(&self, transcript: &str, context: &ClassificationContext) -> ClassificationResult {
        let normalized = normalize(transcript);
        let slots = extract_slots(&normalized);

        let mut best: Option<(&Intent, f32, Vec<RuleMatch>)> = None;

        for intent in self.store.intents() {
            if !intent.eligible_in(&context.phase) {
                continue;
            }

            let expected = context.expected_next.iter().any(|i| i == &intent.id);
            let (mut score, matches) = score_intent(intent, transcript, &normalized, expected);
            if matches.is_empty() {
                continue;
            }

            if !intent.required_slots.iter().all(|s| has_slot(&slots, s)) {
                score *= MISSING_SLOT_PENALTY;
            }

            let confidence = score.clamp(0.0, 1.0);
            let threshold = intent
                .min_score
                .or(self.store.default_threshold())
                .unwrap_or(self.engine_threshold);
            if confidence < threshold {
                debug!(intent = %intent.id, confidence, threshold, "Intent below threshold");
                continue;
            }

            // Strictly greater replaces; ties keep the earlier declaration.
            if best.as_ref().is_none_or(|(_, c, _)| confidence > *c) {
                best = Some((intent, confidence, matches));
            }
        }

        match best {
            Some((intent, confidence, matches)) => ClassificationResult {
                intent: intent.id.clone(),
                confidence,
                slots,
                matches,
                source: ClassificationSource::Rules,
            },
            None => ClassificationResult::unknown(slots),
        }
    }

    /// Classify with rules, escalating to `fallbacks` when confidence is insufficient.
    ///
    /// Only cancellation is propagated; a fallback that fails or returns
    /// nothing leaves the rule result in place.
    pub async fn classify(
        &self,
        transcript: &str,
        context: &ClassificationContext,
        fallbacks: &ClassifierChain,
        cancel: &CancellationToken,
    ) -> Result<ClassificationResult, FallbackError> {
        let result = self.classify_rules(transcript, context);
        if result.confidence >= self.fallback_threshold() || fallbacks.is_empty() {
            return Ok(result);
        }

        debug!(
            rule_intent = %result.intent,
            confidence = result.confidence,
            "Rule confidence insufficient, consulting fallback classifier"
        );

        match fallbacks.try_classify(transcript, context, cancel).await? {
            Some(mut delegated) => {
                let extracted = result.slots;
                delegated.slots.extend(extracted);
                delegated.confidence = delegated.confidence.clamp(0.0, 1.0);
                delegated.source = ClassificationSource::Fallback;
                Ok(delegated)
            }
            None => Ok(result),
        }
    }
}

/// Sum the boosts of every matching rule of `intent`.
fn score_intent(
    intent: &Intent,
    raw: &str,
    normalized: &str,
    expected: bool,
) -> (f32, Vec<RuleMatch>) {
    let mut score = 0.0;
    let mut matches = Vec::new();

    for rule in &intent.rules {
        let keywords: Vec<String> = rule
            .keywords
            .iter()
            .filter(|k| normalized.contains(k.as_str()))
            .cloned()
            .collect();
        let patterns: Vec<String> = rule
            .patterns
            .iter()
            .filter(|p| p.is_match(raw))
            .map(|p| p.as_str().to_string())
            .collect();
        if keywords.is_empty() && patterns.is_empty() {
            continue;
        }

        let mut contribution = rule.boost;
        if expected {
            contribution += rule.expected_boost;
        }
        score += contribution;
        matches.push(RuleMatch {
            rule_id: rule.id.clone(),
            contribution,
            keywords,
            patterns,
        });
    }

    (score, matches)
}

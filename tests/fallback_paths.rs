//! Fallback boundaries, atomicity and cancellation.
//!
//! Uses a small rule pack where some intents deliberately have no template,
//! so the generator path and the no-response path can be exercised.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use atc_dialogue::classifier::{ClassificationContext, ClassificationResult, ClassificationSource};
use atc_dialogue::config::EngineConfig;
use atc_dialogue::error::{FallbackError, LlmError, RulePackError};
use atc_dialogue::fallback::{FallbackClassifier, GenerationRequest, ResponseGenerator};
use atc_dialogue::flow::DecisionKind;
use atc_dialogue::llm::{
    CompletionRequest, CompletionResponse, LlmIntentClassifier, LlmProvider, LlmResponder,
};
use atc_dialogue::role::ControllerRole;
use atc_dialogue::rules::RulePackStore;
use atc_dialogue::session::{FlightContext, ResponseSource, SessionController};

const INTENTS: &str = r#"{
    "version": "test",
    "default_threshold": 0.6,
    "intents": [
        {"id": "REQUEST_TAXI", "rules": [{"id": "taxi", "keywords": ["request taxi"], "boost": 0.8}]},
        {"id": "REPORT_POSITION", "rules": [{"id": "position", "keywords": ["position"], "boost": 0.8}]}
    ]
}"#;

const PHASES: &str = r#"{"phases": [
    {"id": "ground", "default_role": "ground",
     "allowed_intents": ["REQUEST_TAXI", "REPORT_POSITION", "unknown"],
     "transitions": [
        {"intent": "REQUEST_TAXI", "template": "TAXI", "action": "ISSUE_TAXI"},
        {"intent": "REPORT_POSITION", "action": "POSITION_NOTED"}
     ]}
]}"#;

/// Same ground phase without an allowed-intent list.
const OPEN_PHASES: &str = r#"{"phases": [
    {"id": "ground", "default_role": "ground",
     "transitions": [
        {"intent": "REQUEST_TAXI", "template": "TAXI", "action": "ISSUE_TAXI"},
        {"intent": "REPORT_POSITION", "action": "POSITION_NOTED"}
     ]}
]}"#;

const TEMPLATES: &str = r#"{"templates": [
    {"id": "TAXI", "text": "{callsign}, taxi to holding point runway {runway}."}
]}"#;

fn store() -> Arc<RulePackStore> {
    Arc::new(RulePackStore::from_json(INTENTS, PHASES, TEMPLATES).unwrap())
}

fn controller() -> SessionController {
    SessionController::new(store(), EngineConfig::default()).with_rng_seed(5)
}

// ── Stub strategies ─────────────────────────────────────────────────

/// Always answers with one intent and no slots.
struct FixedClassifier(&'static str);

#[async_trait]
impl FallbackClassifier for FixedClassifier {
    fn name(&self) -> &str {
        "fixed"
    }

    async fn classify(
        &self,
        _transcript: &str,
        _context: &ClassificationContext,
        _cancel: &CancellationToken,
    ) -> Result<Option<ClassificationResult>, FallbackError> {
        Ok(Some(ClassificationResult {
            intent: self.0.to_string(),
            confidence: 1.4,
            slots: Default::default(),
            matches: vec![],
            source: ClassificationSource::Rules,
        }))
    }
}

struct BrokenClassifier;

#[async_trait]
impl FallbackClassifier for BrokenClassifier {
    fn name(&self) -> &str {
        "broken"
    }

    async fn classify(
        &self,
        _transcript: &str,
        _context: &ClassificationContext,
        _cancel: &CancellationToken,
    ) -> Result<Option<ClassificationResult>, FallbackError> {
        Err(FallbackError::Failed {
            strategy: "broken".into(),
            reason: "model unavailable".into(),
        })
    }
}

/// Returns fixed text and keeps the requests it was given.
struct Canned {
    text: &'static str,
    seen: Mutex<Vec<GenerationRequest>>,
}

impl Canned {
    fn new(text: &'static str) -> Arc<Self> {
        Arc::new(Self {
            text,
            seen: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl ResponseGenerator for Canned {
    fn name(&self) -> &str {
        "canned"
    }

    async fn generate(
        &self,
        request: &GenerationRequest,
        _cancel: &CancellationToken,
    ) -> Result<String, FallbackError> {
        self.seen.lock().unwrap().push(request.clone());
        Ok(self.text.to_string())
    }
}

/// Never answers within a test's lifetime.
struct StalledClassifier;

#[async_trait]
impl FallbackClassifier for StalledClassifier {
    fn name(&self) -> &str {
        "stalled-classifier"
    }

    async fn classify(
        &self,
        _transcript: &str,
        _context: &ClassificationContext,
        _cancel: &CancellationToken,
    ) -> Result<Option<ClassificationResult>, FallbackError> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(None)
    }
}

struct Stalled;

#[async_trait]
impl ResponseGenerator for Stalled {
    fn name(&self) -> &str {
        "stalled"
    }

    async fn generate(
        &self,
        _request: &GenerationRequest,
        _cancel: &CancellationToken,
    ) -> Result<String, FallbackError> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok("too late".into())
    }
}

/// Stub LLM provider (no real API calls).
struct StubLlm(&'static str);

#[async_trait]
impl LlmProvider for StubLlm {
    fn model_name(&self) -> &str {
        "stub"
    }

    async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        Ok(CompletionResponse {
            content: self.0.to_string(),
            input_tokens: 0,
            output_tokens: 0,
        })
    }
}

// ── Atomicity ───────────────────────────────────────────────────────

#[tokio::test]
async fn nothing_rendered_leaves_session_untouched() {
    let mut c = controller();
    let mut f = FlightContext::new("TEST 123");

    c.handle("TEST 123 request taxi", &mut f).await.unwrap().unwrap();
    let state_before = c.state().cloned();
    let flight_before = f.clone();

    let outcome = c.handle("TEST 123 position alpha one", &mut f).await.unwrap();
    assert!(outcome.is_none());
    assert_eq!(c.state().cloned(), state_before);
    assert_eq!(f, flight_before);
}

#[tokio::test]
async fn failed_first_turn_creates_no_session() {
    let mut c = controller();
    let mut f = FlightContext::new("TEST 123");

    assert!(c.handle("TEST 123 position alpha one", &mut f).await.unwrap().is_none());
    assert!(c.state().is_none());
    assert!(f.current_phase.is_none());
    assert!(f.current_unit.is_none());
}

#[tokio::test]
async fn no_transition_and_no_fallback_template_is_no_decision() {
    let mut c = controller().with_response_generator(Canned::new("TEST 123, say again."));
    let mut f = FlightContext::new("TEST 123");

    let turn = c.handle("garbled", &mut f).await.unwrap().unwrap();
    assert_eq!(turn.decision.kind, DecisionKind::NoDecision);
    assert!(turn.decision.action.is_none());
    assert_eq!(turn.text, "TEST 123, say again.");
}

// ── Generator path ──────────────────────────────────────────────────

#[tokio::test]
async fn generator_answers_when_no_template_matches() {
    let canned = Canned::new("  TEST 123, roger.  ");
    let mut c = controller().with_response_generator(canned.clone());
    let mut f = FlightContext::new("TEST 123");

    let turn = c.handle("TEST 123 position alpha one", &mut f).await.unwrap().unwrap();
    assert_eq!(turn.text, "TEST 123, roger.");
    assert_eq!(
        turn.source,
        ResponseSource::Generated {
            strategy: "canned".into()
        }
    );
    assert!(!turn.readback_required);
    assert_eq!(turn.session.last_action.as_deref(), Some("POSITION_NOTED"));
    assert_eq!(turn.session.last_response.as_deref(), Some("TEST 123, roger."));
    assert_eq!(f.current_phase.as_deref(), Some("ground"));

    let seen = canned.seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].role, ControllerRole::Ground);
    assert_eq!(seen[0].transcript, "TEST 123 position alpha one");
    assert_eq!(seen[0].snapshot["classification"]["intent"], "REPORT_POSITION");
    assert_eq!(seen[0].snapshot["slots"]["callsign"], "TEST 123");
}

#[tokio::test]
async fn template_wins_over_generator() {
    let canned = Canned::new("unused");
    let mut c = controller().with_response_generator(canned.clone());
    let mut f = FlightContext {
        runway: Some("09".into()),
        ..FlightContext::new("TEST 123")
    };

    let turn = c.handle("TEST 123 request taxi", &mut f).await.unwrap().unwrap();
    assert_eq!(turn.text, "TEST 123, taxi to holding point runway 09.");
    assert!(canned.seen.lock().unwrap().is_empty());
}

// ── Fallback classifier ─────────────────────────────────────────────

#[tokio::test]
async fn fallback_classifier_keeps_extracted_slots() {
    let mut c = controller().with_fallback_classifier(Arc::new(FixedClassifier("REQUEST_TAXI")));
    let mut f = FlightContext::new("TEST 123");

    let turn = c
        .handle("TEST 123 er looking to go to runway 27R", &mut f)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(turn.classification.intent, "REQUEST_TAXI");
    assert_eq!(turn.classification.source, ClassificationSource::Fallback);
    assert_eq!(turn.classification.confidence, 1.0);
    assert_eq!(turn.classification.slots.get("runway").map(String::as_str), Some("27R"));
    assert_eq!(turn.text, "TEST 123, taxi to holding point runway 27R.");
}

#[tokio::test]
async fn confident_rules_skip_fallback_classifier() {
    let mut c = controller().with_fallback_classifier(Arc::new(FixedClassifier("REPORT_POSITION")));
    let mut f = FlightContext::new("TEST 123");

    let turn = c.handle("TEST 123 request taxi", &mut f).await.unwrap().unwrap();
    assert_eq!(turn.classification.intent, "REQUEST_TAXI");
    assert_eq!(turn.classification.source, ClassificationSource::Rules);
}

#[tokio::test]
async fn failing_classifier_degrades_to_rule_result() {
    let mut c = controller().with_fallback_classifier(Arc::new(BrokenClassifier));
    let mut f = FlightContext::new("TEST 123");

    // Unknown intent, no fallback template, no generator: no response.
    assert!(c.handle("garbled", &mut f).await.unwrap().is_none());
    assert!(c.state().is_none());
}

#[tokio::test]
async fn llm_strategies_plug_into_both_boundaries() {
    let classifier = LlmIntentClassifier::new(Arc::new(StubLlm(
        r#"{"intent": "REPORT_POSITION", "confidence": 0.7}"#,
    )));
    let responder = LlmResponder::new(Arc::new(StubLlm("Controller: TEST 123, position noted.")));
    let mut c = controller()
        .with_fallback_classifier(Arc::new(classifier))
        .with_response_generator(Arc::new(responder));
    let mut f = FlightContext::new("TEST 123");

    let turn = c.handle("TEST 123 we are at alpha one", &mut f).await.unwrap().unwrap();
    assert_eq!(turn.classification.intent, "REPORT_POSITION");
    assert_eq!(turn.text, "TEST 123, position noted.");
    assert_eq!(
        turn.source,
        ResponseSource::Generated {
            strategy: "llm-responder".into()
        }
    );
}

#[tokio::test]
async fn llm_classifier_chooses_from_eligible_intents_when_phase_is_open() {
    let store = Arc::new(RulePackStore::from_json(INTENTS, OPEN_PHASES, TEMPLATES).unwrap());
    let classifier = LlmIntentClassifier::new(Arc::new(StubLlm(
        r#"{"intent":"REPORT_POSITION","confidence":0.9}"#,
    )));
    let mut c = SessionController::new(store, EngineConfig::default())
        .with_fallback_classifier(Arc::new(classifier))
        .with_response_generator(Canned::new("TEST 123, roger."));
    let mut f = FlightContext::new("TEST 123");

    let turn = c
        .handle("TEST 123 we are at alpha one", &mut f)
        .await
        .unwrap()
        .expect("open phase should still reach the fallback classifier");
    assert_eq!(turn.classification.intent, "REPORT_POSITION");
    assert_eq!(turn.classification.source, ClassificationSource::Fallback);
    assert_eq!(turn.session.last_action.as_deref(), Some("POSITION_NOTED"));
}

// ── Cancellation ────────────────────────────────────────────────────

#[tokio::test]
async fn cancel_during_fallback_classification_aborts_turn() {
    let mut c = controller().with_fallback_classifier(Arc::new(StalledClassifier));
    let mut f = FlightContext {
        runway: Some("27L".into()),
        ..FlightContext::new("TEST 123")
    };
    c.handle("TEST 123 request taxi", &mut f).await.unwrap().unwrap();
    let state_before = c.state().cloned();
    let flight_before = f.clone();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    // Nothing matches, so the stalled classifier is consulted and cancelled mid-call.
    let err = c
        .handle_with_cancel("TEST 123 er hmm", &mut f, &cancel)
        .await
        .unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(c.state().cloned(), state_before);
    assert_eq!(f, flight_before);
}

#[tokio::test]
async fn cancel_during_generation_aborts_turn() {
    let mut c = controller().with_response_generator(Arc::new(Stalled));
    let mut f = FlightContext::new("TEST 123");
    c.handle("TEST 123 request taxi", &mut f).await.unwrap().unwrap();
    let state_before = c.state().cloned();
    let flight_before = f.clone();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let err = c
        .handle_with_cancel("TEST 123 position alpha one", &mut f, &cancel)
        .await
        .unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(c.state().cloned(), state_before);
    assert_eq!(f, flight_before);
}

#[tokio::test(start_paused = true)]
async fn stalled_generator_times_out_to_no_response() {
    let config = EngineConfig {
        fallback_timeout: Duration::from_secs(2),
        ..EngineConfig::default()
    };
    let mut c = SessionController::new(store(), config).with_response_generator(Arc::new(Stalled));
    let mut f = FlightContext::new("TEST 123");

    assert!(c.handle("TEST 123 position alpha one", &mut f).await.unwrap().is_none());
    assert!(c.state().is_none());
}

// ── Loading ─────────────────────────────────────────────────────────

#[test]
fn rule_pack_loads_from_directory() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("intents.json"), INTENTS).unwrap();
    std::fs::write(dir.path().join("phases.json"), PHASES).unwrap();
    std::fs::write(dir.path().join("templates.json"), TEMPLATES).unwrap();

    let store = RulePackStore::load_dir(dir.path()).unwrap();
    assert_eq!(store.version(), Some("test"));
    assert_eq!(store.first_phase().id, "ground");
    assert!(store.template("TAXI").is_some());
}

#[test]
fn missing_table_names_the_file() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("intents.json"), INTENTS).unwrap();

    match RulePackStore::load_dir(dir.path()) {
        Err(RulePackError::Io { file, .. }) => assert!(file.ends_with("phases.json"), "{file}"),
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("load should fail without phases.json"),
    }
}

#[test]
fn invalid_pattern_is_rejected_at_load() {
    let intents = r#"{"intents": [{"id": "BROKEN", "rules": [{"regex": ["(unclosed"], "boost": 1.0}]}]}"#;
    match RulePackStore::from_json(intents, PHASES, TEMPLATES) {
        Err(RulePackError::InvalidPattern { intent, pattern, .. }) => {
            assert_eq!(intent, "BROKEN");
            assert_eq!(pattern, "(unclosed");
        }
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("invalid regex should fail to load"),
    }
}

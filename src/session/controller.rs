//! Session controller: one dialogue turn, committed atomically.
//!
//! Per turn:
//! 1. Classify the transmission in the context of the current phase
//! 2. Ask the phase engine for a decision
//! 3. Intercept handoff check-ins addressed to the wrong unit (reissue)
//!    and readbacks that contradict what was issued (correction)
//! 4. Render a template, else ask the generator chain
//! 5. Commit state, or leave it untouched if nothing was produced
//!
//! All work happens on a copy of the session state. The copy replaces the
//! stored state only after a response exists and the turn was not cancelled.

use std::sync::Arc;

use chrono::Utc;
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::classifier::{
    ClassificationContext, ClassificationResult, HANDOFF_CHECKIN, IntentClassifier, READBACK, SLOT_FREQUENCY,
    SLOT_SQUAWK, SlotMap,
};
use crate::config::EngineConfig;
use crate::error::{FallbackError, Result};
use crate::fallback::{
    ClassifierChain, FallbackClassifier, GenerationRequest, GeneratorChain, ResponseGenerator,
};
use crate::flow::{FlowDecision, PhaseEngine};
use crate::frequency::FrequencyResolver;
use crate::role::ControllerRole;
use crate::rules::{HandoffSpec, RulePackStore};
use crate::session::{FlightContext, PendingHandoff, SessionState};
use crate::template::{RenderRequest, TemplateRenderer};

/// Template rendered when a pilot checks in with the wrong unit.
pub const REISSUE_TEMPLATE_ID: &str = "HANDOFF_REISSUE";

/// Action label recorded for a reissued handoff.
pub const REISSUE_ACTION: &str = "HANDOFF_REISSUE";

/// Template rendered when a readback contradicts the instruction; gets a `{correction}` slot.
pub const CORRECTION_TEMPLATE_ID: &str = "READBACK_INCORRECT";

/// Action label recorded for a readback correction.
pub const CORRECTION_ACTION: &str = "READBACK_INCORRECT";

/// How the response text was produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResponseSource {
    Template { template_id: Option<String> },
    Reissue,
    Correction { item: String },
    Generated { strategy: String },
}

/// Result of a committed turn.
#[derive(Debug, Clone, Serialize)]
pub struct TurnResponse {
    pub text: String,
    /// Unit that is speaking.
    pub role: ControllerRole,
    pub readback_required: bool,
    pub readback_items: Vec<String>,
    /// Session state after the commit.
    pub session: SessionState,
    pub classification: ClassificationResult,
    pub decision: FlowDecision,
    pub source: ResponseSource,
}

/// Drives one aircraft's dialogue. Not for concurrent use; see `SessionHandle`.
pub struct SessionController {
    store: Arc<RulePackStore>,
    classifier: IntentClassifier,
    engine: PhaseEngine,
    renderer: TemplateRenderer,
    config: EngineConfig,
    classifiers: ClassifierChain,
    generators: GeneratorChain,
    frequencies: Option<Arc<dyn FrequencyResolver>>,
    rng: StdRng,
    state: Option<SessionState>,
}

impl SessionController {
    pub fn new(store: Arc<RulePackStore>, config: EngineConfig) -> Self {
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            classifier: IntentClassifier::new(Arc::clone(&store))
                .with_engine_threshold(config.default_threshold),
            engine: PhaseEngine::new(Arc::clone(&store)),
            renderer: TemplateRenderer::new(Arc::clone(&store)),
            classifiers: ClassifierChain::new(config.fallback_timeout),
            generators: GeneratorChain::new(config.fallback_timeout),
            frequencies: None,
            rng,
            state: None,
            store,
            config,
        }
    }

    /// Append a fallback classifier to the chain.
    pub fn with_fallback_classifier(mut self, classifier: Arc<dyn FallbackClassifier>) -> Self {
        self.classifiers.push(classifier);
        self
    }

    /// Append a response generator to the chain.
    pub fn with_response_generator(mut self, generator: Arc<dyn ResponseGenerator>) -> Self {
        self.generators.push(generator);
        self
    }

    pub fn with_frequency_resolver(mut self, resolver: Arc<dyn FrequencyResolver>) -> Self {
        self.frequencies = Some(resolver);
        self
    }

    /// Make template variant selection reproducible.
    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Current state; `None` until the first committed turn.
    pub fn state(&self) -> Option<&SessionState> {
        self.state.as_ref()
    }

    /// Handle one transmission without a cancellation signal.
    pub async fn handle(
        &mut self,
        transcript: &str,
        flight: &mut FlightContext,
    ) -> Result<Option<TurnResponse>> {
        self.handle_with_cancel(transcript, flight, &CancellationToken::new())
            .await
    }

    /// Handle one transmission.
    ///
    /// `Ok(None)` means nothing could be said and the session is unchanged.
    /// Cancellation returns an error and also leaves the session unchanged.
    pub async fn handle_with_cancel(
        &mut self,
        transcript: &str,
        flight: &mut FlightContext,
        cancel: &CancellationToken,
    ) -> Result<Option<TurnResponse>> {
        let transcript = transcript.trim();
        if transcript.is_empty() {
            return Ok(None);
        }

        let store = Arc::clone(&self.store);
        let working = match &self.state {
            Some(state) => state.clone(),
            None => self.initial_state(flight),
        };
        let phase = store.resolve_phase(&working.phase);

        let context = ClassificationContext {
            phase: phase.id.clone(),
            expected_next: working.expected_next.clone(),
            allowed_intents: store.candidate_intents(phase),
        };
        let classification = self
            .classifier
            .classify(transcript, &context, &self.classifiers, cancel)
            .await?;
        let decision = self.engine.decide(&working, &classification);

        debug!(
            callsign = %flight.callsign,
            phase = %phase.id,
            intent = %classification.intent,
            confidence = classification.confidence,
            source = ?classification.source,
            decision = ?decision.kind,
            "Transmission classified"
        );

        if classification.intent == HANDOFF_CHECKIN {
            if let Some(pending) = working.pending_handoff.clone() {
                if let Some(mentioned) = ControllerRole::mentioned_in(transcript) {
                    if mentioned != pending.role {
                        info!(
                            callsign = %flight.callsign,
                            expected = %pending.role,
                            mentioned = %mentioned,
                            "Check-in with wrong unit, reissuing handoff"
                        );
                        return self.reissue(working, pending, classification, decision, flight, cancel);
                    }
                }
            }
        }

        if classification.intent == READBACK {
            if let Some((item, issued)) = working.readback_mismatch(&classification.slots) {
                let (item, issued) = (item.to_string(), issued.to_string());
                info!(
                    callsign = %flight.callsign,
                    item = %item,
                    issued = %issued,
                    "Readback contradicts the instruction, correcting"
                );
                return self.correct_readback(working, item, issued, classification, decision, flight, cancel);
            }
        }

        let committing = decision.commit_pending_handoff
            && self.config.allow_handoff_commit
            && working.has_pending_handoff();
        let speaking = match (&working.pending_handoff, committing) {
            (Some(pending), true) => pending.role,
            _ => working.role,
        };
        let slots = self.build_slots(&working, flight, &classification, &decision, speaking);

        let request = RenderRequest {
            phase: &phase.id,
            intent: &classification.intent,
            action: decision.action.as_deref(),
            template_id: decision.template_id.as_deref(),
        };

        let (text, readback_required, readback_items, source) =
            match self.renderer.render(&request, &slots, &mut self.rng) {
                Some(rendered) => (
                    rendered.text,
                    rendered.readback_required,
                    rendered.readback_items,
                    ResponseSource::Template {
                        template_id: rendered.template_id,
                    },
                ),
                None => {
                    let generation = GenerationRequest {
                        transcript: transcript.to_string(),
                        role: speaking,
                        flight: flight.clone(),
                        snapshot: serde_json::json!({
                            "session": &working,
                            "slots": &slots,
                            "classification": &classification,
                            "decision": &decision,
                        }),
                    };
                    match self.generators.try_generate(&generation, cancel).await? {
                        Some(generated) => (
                            generated.text,
                            false,
                            Vec::new(),
                            ResponseSource::Generated {
                                strategy: generated.strategy,
                            },
                        ),
                        None => {
                            debug!(
                                callsign = %flight.callsign,
                                intent = %classification.intent,
                                "No template and no generated response, session unchanged"
                            );
                            return Ok(None);
                        }
                    }
                }
            };

        let issued = if readback_required {
            issued_values(&readback_items, &slots)
        } else {
            SlotMap::new()
        };

        ensure_live(cancel)?;
        let session = self.commit(working, &classification, &decision, committing, &text, issued, flight);

        info!(
            callsign = %flight.callsign,
            intent = %classification.intent,
            action = decision.action.as_deref().unwrap_or(""),
            phase = %session.phase,
            role = %session.role,
            pending_handoff = session.has_pending_handoff(),
            "Turn committed"
        );

        Ok(Some(TurnResponse {
            text,
            role: speaking,
            readback_required,
            readback_items,
            session,
            classification,
            decision,
            source,
        }))
    }

    /// Answer a wrong-unit check-in without touching the pending handoff.
    fn reissue(
        &mut self,
        working: SessionState,
        pending: PendingHandoff,
        classification: ClassificationResult,
        decision: FlowDecision,
        flight: &mut FlightContext,
        cancel: &CancellationToken,
    ) -> Result<Option<TurnResponse>> {
        let mut slots = self.base_slots(&working, flight, &classification, working.role);
        let frequency = self.insert_handoff_slots(
            &mut slots,
            flight,
            pending.role,
            pending.frequency.clone(),
            pending.facility.clone(),
        );

        let (text, readback_required, readback_items) =
            match self.renderer.render_id(REISSUE_TEMPLATE_ID, &slots, &mut self.rng) {
                Some(rendered) => (rendered.text, rendered.readback_required, rendered.readback_items),
                None => {
                    let on_frequency = frequency.map(|f| format!(" on {f}")).unwrap_or_default();
                    (
                        format!(
                            "{}, contact {}{}.",
                            flight.callsign,
                            pending.role.spoken_name(),
                            on_frequency
                        ),
                        false,
                        Vec::new(),
                    )
                }
            };

        ensure_live(cancel)?;
        let session = self.commit_in_place(working, &classification, REISSUE_ACTION, &text, flight);

        Ok(Some(TurnResponse {
            text,
            role: session.role,
            readback_required,
            readback_items,
            session,
            classification,
            decision,
            source: ResponseSource::Reissue,
        }))
    }

    /// Restate the item the pilot read back wrong. Phase and pending handoff stay.
    #[allow(clippy::too_many_arguments)]
    fn correct_readback(
        &mut self,
        working: SessionState,
        item: String,
        issued: String,
        classification: ClassificationResult,
        decision: FlowDecision,
        flight: &mut FlightContext,
        cancel: &CancellationToken,
    ) -> Result<Option<TurnResponse>> {
        let correction = format!("{} {}", spoken_item(&item), issued);
        let mut slots = self.base_slots(&working, flight, &classification, working.role);
        slots.insert("correction".into(), correction.clone());

        let text = match self.renderer.render_id(CORRECTION_TEMPLATE_ID, &slots, &mut self.rng) {
            Some(rendered) => rendered.text,
            None => format!("{}, negative, {}.", flight.callsign, correction),
        };

        ensure_live(cancel)?;
        let session = self.commit_in_place(working, &classification, CORRECTION_ACTION, &text, flight);

        Ok(Some(TurnResponse {
            text,
            role: session.role,
            readback_required: true,
            readback_items: vec![item.clone()],
            session,
            classification,
            decision,
            source: ResponseSource::Correction { item },
        }))
    }

    /// Record a turn that answers without taking a transition.
    fn commit_in_place(
        &mut self,
        mut state: SessionState,
        classification: &ClassificationResult,
        action: &str,
        response: &str,
        flight: &mut FlightContext,
    ) -> SessionState {
        let store = Arc::clone(&self.store);
        state.last_intent = Some(classification.intent.clone());
        state.last_action = Some(action.to_string());
        state.last_response = Some(response.to_string());
        state.updated_at = Utc::now();
        state.refresh_expected(store.resolve_phase(&state.phase));
        write_back(&state, flight);
        self.state = Some(state.clone());
        state
    }

    /// Apply a successful turn to `state` and store it.
    #[allow(clippy::too_many_arguments)]
    fn commit(
        &mut self,
        mut state: SessionState,
        classification: &ClassificationResult,
        decision: &FlowDecision,
        committing: bool,
        response: &str,
        issued: SlotMap,
        flight: &mut FlightContext,
    ) -> SessionState {
        let store = Arc::clone(&self.store);
        let now = Utc::now();

        state.last_intent = Some(classification.intent.clone());
        state.last_action = decision.action.clone();
        state.last_response = Some(response.to_string());
        state.updated_at = now;

        if classification.intent == READBACK {
            state.readback_expected.clear();
        }
        if !issued.is_empty() {
            state.readback_expected = issued;
        }

        if committing {
            if let Some(pending) = state.pending_handoff.take() {
                let facility = pending
                    .facility
                    .or_else(|| flight.facility_for(pending.role).map(str::to_string));
                state.frequency = pending
                    .frequency
                    .or_else(|| self.lookup_frequency(facility.as_deref(), pending.role))
                    .or(state.frequency);
                state.facility = facility.or(state.facility);
                state.role = pending.role;
                state.phase = store
                    .phase(&decision.next_phase)
                    .filter(|p| p.default_role == Some(pending.role))
                    .or_else(|| store.phase_for_role(pending.role))
                    .map(|p| p.id.clone())
                    .unwrap_or_else(|| decision.next_phase.clone());
            }
        } else if decision.next_phase != state.phase {
            state.phase = decision.next_phase.clone();
            if let Some(role) = store.resolve_phase(&state.phase).default_role {
                if role != state.role {
                    state.role = role;
                    let facility = flight.facility_for(role).map(str::to_string);
                    if let Some(frequency) = self.lookup_frequency(facility.as_deref(), role) {
                        state.frequency = Some(frequency);
                    }
                    state.facility = facility.or(state.facility);
                }
            }
        }

        if decision.open_pending_handoff {
            if let Some(spec) = &decision.handoff {
                let facility =
                    handoff_facility(spec, flight).or_else(|| flight.facility_for(spec.role).map(str::to_string));
                let frequency = spec
                    .frequency
                    .clone()
                    .or_else(|| self.lookup_frequency(facility.as_deref(), spec.role));
                state.pending_handoff = Some(PendingHandoff {
                    role: spec.role,
                    frequency,
                    facility,
                    issued_at: now,
                });
            }
        }

        if state.facility.is_none() {
            state.facility = flight.origin.clone();
        }
        state.refresh_expected(store.resolve_phase(&state.phase));
        if let Some(action) = &decision.action {
            state.milestones.record(action);
        }

        write_back(&state, flight);
        self.state = Some(state.clone());
        state
    }

    fn initial_state(&self, flight: &FlightContext) -> SessionState {
        let phase = flight
            .current_phase
            .as_deref()
            .and_then(|id| self.store.phase(id))
            .or_else(|| flight.current_unit.and_then(|role| self.store.phase_for_role(role)))
            .unwrap_or_else(|| self.store.first_phase());
        let role = flight
            .current_unit
            .or(phase.default_role)
            .unwrap_or(ControllerRole::Delivery);
        let facility = flight.facility_for(role).map(str::to_string);
        let frequency = flight
            .current_frequency
            .clone()
            .or_else(|| self.lookup_frequency(facility.as_deref(), role));

        debug!(callsign = %flight.callsign, phase = %phase.id, role = %role, "Initializing session");
        SessionState::new(phase, role, frequency, facility)
    }

    /// Flight plan, session and extracted slots.
    fn base_slots(
        &self,
        state: &SessionState,
        flight: &FlightContext,
        classification: &ClassificationResult,
        speaking: ControllerRole,
    ) -> SlotMap {
        let mut slots = flight.slots();
        if let Some(facility) = &state.facility {
            slots.insert("facility".into(), facility.clone());
        }
        if let Some(frequency) = &state.frequency {
            slots.insert(SLOT_FREQUENCY.into(), frequency.clone());
        }
        slots.insert("role".into(), speaking.spoken_name().to_string());
        for (name, value) in &classification.slots {
            // An assigned squawk is never replaced by what the pilot said.
            if name == SLOT_SQUAWK && slots.contains_key(SLOT_SQUAWK) {
                continue;
            }
            slots.insert(name.clone(), value.clone());
        }
        slots
    }

    fn build_slots(
        &self,
        state: &SessionState,
        flight: &FlightContext,
        classification: &ClassificationResult,
        decision: &FlowDecision,
        speaking: ControllerRole,
    ) -> SlotMap {
        let mut slots = self.base_slots(state, flight, classification, speaking);

        let opening = decision.handoff.as_ref().filter(|_| decision.open_pending_handoff);
        if let Some(spec) = opening {
            self.insert_handoff_slots(
                &mut slots,
                flight,
                spec.role,
                spec.frequency.clone(),
                handoff_facility(spec, flight),
            );
        } else if let Some(pending) = &state.pending_handoff {
            self.insert_handoff_slots(
                &mut slots,
                flight,
                pending.role,
                pending.frequency.clone(),
                pending.facility.clone(),
            );
        }
        slots
    }

    /// Add `handoff_role`, `handoff_frequency` and `handoff_facility`; returns the frequency.
    fn insert_handoff_slots(
        &self,
        slots: &mut SlotMap,
        flight: &FlightContext,
        role: ControllerRole,
        frequency: Option<String>,
        facility: Option<String>,
    ) -> Option<String> {
        let facility = facility.or_else(|| flight.facility_for(role).map(str::to_string));
        let frequency = frequency.or_else(|| self.lookup_frequency(facility.as_deref(), role));

        slots.insert("handoff_role".into(), role.spoken_name().to_string());
        if let Some(frequency) = &frequency {
            slots.insert("handoff_frequency".into(), frequency.clone());
        }
        if let Some(facility) = facility {
            slots.insert("handoff_facility".into(), facility);
        }
        frequency
    }

    fn lookup_frequency(&self, facility: Option<&str>, role: ControllerRole) -> Option<String> {
        let resolver = self.frequencies.as_ref()?;
        resolver.frequency_for(facility?, role)
    }
}

/// Facility named by a `HandoffSpec`, literally or by airport.
fn handoff_facility(spec: &HandoffSpec, flight: &FlightContext) -> Option<String> {
    spec.facility
        .clone()
        .or_else(|| spec.airport.and_then(|airport| flight.airport(airport)).map(str::to_string))
}

/// Non-blank values of `items` as they were rendered.
fn issued_values(items: &[String], slots: &SlotMap) -> SlotMap {
    items
        .iter()
        .filter_map(|item| {
            let value = slots.get(item)?.trim();
            (!value.is_empty()).then(|| (item.clone(), value.to_string()))
        })
        .collect()
}

/// How a readback item is named when restating it.
fn spoken_item(item: &str) -> String {
    match item {
        "handoff_frequency" => "frequency".to_string(),
        "initial_climb" => "climb".to_string(),
        "arrival_runway" => "runway".to_string(),
        other => other.replace('_', " "),
    }
}

fn ensure_live(cancel: &CancellationToken) -> std::result::Result<(), FallbackError> {
    if cancel.is_cancelled() {
        Err(FallbackError::Cancelled)
    } else {
        Ok(())
    }
}

/// Push phase, unit and frequency onto the caller's flight context.
fn write_back(state: &SessionState, flight: &mut FlightContext) {
    flight.current_phase = Some(state.phase.clone());
    flight.current_unit = Some(state.role);
    flight.current_frequency = state.frequency.clone();
}

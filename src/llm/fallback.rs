//! Fallback strategies backed by a chat model.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::classifier::{ClassificationContext, ClassificationResult, ClassificationSource, UNKNOWN_INTENT};
use crate::error::FallbackError;
use crate::fallback::{FallbackClassifier, GenerationRequest, ResponseGenerator};
use crate::llm::{ChatMessage, CompletionRequest, LlmProvider};
use crate::role::ControllerRole;

const CLASSIFIER_NAME: &str = "llm-classifier";
const RESPONDER_NAME: &str = "llm-responder";

const CLASSIFY_PROMPT: &str = r#"You label pilot radio transmissions for an air traffic control simulator.

Pick exactly one intent id from the allowed list, or "unknown" if none fits.
Prefer intents listed as expected next when the transmission is ambiguous.

Respond with ONLY a JSON object, no other text:
{"intent": "<intent id>", "confidence": <0.0 to 1.0>}"#;

/// Labels a transmission with one of the phase's allowed intents.
pub struct LlmIntentClassifier {
    llm: Arc<dyn LlmProvider>,
}

impl LlmIntentClassifier {
    pub fn new(llm: Arc<dyn LlmProvider>) -> Self {
        Self { llm }
    }
}

#[derive(Debug, Deserialize)]
struct LabelResponse {
    #[serde(default)]
    intent: String,
    #[serde(default)]
    confidence: Option<f32>,
}

#[async_trait]
impl FallbackClassifier for LlmIntentClassifier {
    fn name(&self) -> &str {
        CLASSIFIER_NAME
    }

    async fn classify(
        &self,
        transcript: &str,
        context: &ClassificationContext,
        _cancel: &CancellationToken,
    ) -> Result<Option<ClassificationResult>, FallbackError> {
        if context.allowed_intents.is_empty() {
            return Ok(None);
        }

        let user = format!(
            "PHASE: {}\nALLOWED: {}\nEXPECTED_NEXT: {}\nPILOT: {}",
            context.phase,
            context.allowed_intents.join(", "),
            context.expected_next.join(", "),
            transcript
        );
        let request = CompletionRequest::new(vec![ChatMessage::system(CLASSIFY_PROMPT), ChatMessage::user(user)])
            .with_temperature(0.0)
            .with_max_tokens(64);

        let response = self.llm.complete(request).await?;
        debug!(
            model = self.llm.model_name(),
            input_tokens = response.input_tokens,
            output_tokens = response.output_tokens,
            "Classifier completion received"
        );

        let json = extract_json_object(&response.content);
        let label: LabelResponse = match serde_json::from_str(&json) {
            Ok(label) => label,
            Err(e) => {
                warn!(error = %e, content = %response.content, "Unparseable classifier response");
                return Ok(None);
            }
        };

        let Some(intent) = context
            .allowed_intents
            .iter()
            .find(|allowed| allowed.eq_ignore_ascii_case(label.intent.trim()))
        else {
            if label.intent.trim() != UNKNOWN_INTENT {
                debug!(intent = %label.intent, phase = %context.phase, "Classifier chose an intent outside the phase");
            }
            return Ok(None);
        };

        Ok(Some(ClassificationResult {
            intent: intent.clone(),
            confidence: label.confidence.unwrap_or(0.5).clamp(0.0, 1.0),
            slots: Default::default(),
            matches: vec![],
            source: ClassificationSource::Fallback,
        }))
    }
}

/// Writes a controller transmission when no template covers the turn.
pub struct LlmResponder {
    llm: Arc<dyn LlmProvider>,
}

impl LlmResponder {
    pub fn new(llm: Arc<dyn LlmProvider>) -> Self {
        Self { llm }
    }
}

fn system_prompt(role: ControllerRole) -> String {
    format!(
        "You are {} in an air traffic control simulator. Reply with one short, standard \
         phraseology transmission addressed to the aircraft by callsign. Use only facts from \
         CONTEXT_JSON. Never invent clearances, frequencies or squawk codes. If the pilot's \
         request cannot be handled, ask them to say again.",
        role.spoken_name()
    )
}

#[async_trait]
impl ResponseGenerator for LlmResponder {
    fn name(&self) -> &str {
        RESPONDER_NAME
    }

    async fn generate(
        &self,
        request: &GenerationRequest,
        _cancel: &CancellationToken,
    ) -> Result<String, FallbackError> {
        let context = serde_json::json!({
            "flight": request.flight,
            "session": request.snapshot,
        });
        let user = format!(
            "CONTEXT_JSON\n{}\nPILOT: {}",
            serde_json::to_string_pretty(&context).map_err(crate::error::LlmError::from)?,
            request.transcript
        );
        let completion = CompletionRequest::new(vec![
            ChatMessage::system(system_prompt(request.role)),
            ChatMessage::user(user),
        ])
        .with_temperature(0.3)
        .with_max_tokens(120);

        let response = self.llm.complete(completion).await?;
        debug!(
            model = self.llm.model_name(),
            role = %request.role,
            output_tokens = response.output_tokens,
            "Generated controller response"
        );
        Ok(clean_transmission(&response.content))
    }
}

/// Strip quoting and speaker labels models like to add.
fn clean_transmission(text: &str) -> String {
    let mut line = text.lines().find(|l| !l.trim().is_empty()).unwrap_or("").trim();
    for prefix in ["ATC:", "Controller:", "CONTROLLER:"] {
        if let Some(rest) = line.strip_prefix(prefix) {
            line = rest.trim();
        }
    }
    line.trim_matches('"').trim().to_string()
}

/// Pull a JSON object out of a model reply that may be fenced or chatty.
fn extract_json_object(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.starts_with('{') {
        return trimmed.to_string();
    }

    for fence in ["```json", "```"] {
        if let Some(start) = trimmed.find(fence) {
            let after = &trimmed[start + fence.len()..];
            if let Some(end) = after.find("```") {
                let inner = after[..end].trim();
                if inner.starts_with('{') {
                    return inner.to_string();
                }
            }
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && end > start
    {
        return trimmed[start..=end].to_string();
    }

    trimmed.to_string()
}

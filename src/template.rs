//! Template renderer.
//!
//! Resolves a template by id, else by (phase, intent, action) in declaration
//! order, picks its literal text or a random variant, and fills `{slot}`
//! tokens. Missing slots render as empty text.
//!
//! A `[...]` segment is optional: it renders only when every token inside it
//! has a value, so `contact {handoff_role}[ on {handoff_frequency}].` reads
//! naturally whether or not a frequency is known.

use std::sync::{Arc, LazyLock};

use rand::Rng;
use rand::seq::SliceRandom;
use regex::Regex;
use serde::Serialize;

use crate::classifier::SlotMap;
use crate::rules::{RulePackStore, TemplateDefinition};

static TOKEN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\{([^{}]*)\}").expect("valid regex"));
static OPTIONAL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\[([^\[\]]*)\]").expect("valid regex"));
static MULTI_SPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r" {2,}").expect("valid regex"));

/// Which template to render.
#[derive(Debug, Clone, Default)]
pub struct RenderRequest<'a> {
    pub phase: &'a str,
    pub intent: &'a str,
    pub action: Option<&'a str>,
    pub template_id: Option<&'a str>,
}

/// A rendered response with its readback requirements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenderedTemplate {
    pub template_id: Option<String>,
    pub text: String,
    pub readback_required: bool,
    pub readback_items: Vec<String>,
}

pub struct TemplateRenderer {
    store: Arc<RulePackStore>,
}

impl TemplateRenderer {
    pub fn new(store: Arc<RulePackStore>) -> Self {
        Self { store }
    }

    /// Resolve and render, or `None` when nothing resolves or the result is blank.
    pub fn render<R: Rng + ?Sized>(
        &self,
        request: &RenderRequest<'_>,
        slots: &SlotMap,
        rng: &mut R,
    ) -> Option<RenderedTemplate> {
        let template = self.resolve(request)?;
        render_template(template, slots, rng)
    }

    /// Render the template with `id` only.
    pub fn render_id<R: Rng + ?Sized>(
        &self,
        id: &str,
        slots: &SlotMap,
        rng: &mut R,
    ) -> Option<RenderedTemplate> {
        render_template(self.store.template(id)?, slots, rng)
    }

    fn resolve(&self, request: &RenderRequest<'_>) -> Option<&TemplateDefinition> {
        if let Some(template) = request.template_id.and_then(|id| self.store.template(id)) {
            return Some(template);
        }
        self.store.templates().iter().find(|t| {
            field_matches(t.phase.as_deref(), Some(request.phase))
                && field_matches(t.intent.as_deref(), Some(request.intent))
                && field_matches(t.action.as_deref(), request.action)
                && t.phase.is_some()
                && t.intent.is_some()
        })
    }
}

fn field_matches(declared: Option<&str>, requested: Option<&str>) -> bool {
    match (declared, requested) {
        (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
        (None, None) => true,
        _ => false,
    }
}

fn render_template<R: Rng + ?Sized>(
    template: &TemplateDefinition,
    slots: &SlotMap,
    rng: &mut R,
) -> Option<RenderedTemplate> {
    let raw = match template.text.as_deref() {
        Some(text) => text,
        None => template.variants.choose(rng)?.as_str(),
    };

    let text = fill_tokens(raw, slots);
    if text.is_empty() {
        return None;
    }

    Some(RenderedTemplate {
        template_id: template.id.clone(),
        text,
        readback_required: template.readback_required,
        readback_items: template.readback_items.clone(),
    })
}

/// Replace every `{name}` with the slot value (case-insensitive key), collapse spaces, trim.
///
/// Optional `[...]` segments are kept only when all of their tokens resolve.
pub fn fill_tokens(text: &str, slots: &SlotMap) -> String {
    let resolved = OPTIONAL.replace_all(text, |caps: &regex::Captures<'_>| {
        let inner = &caps[1];
        let complete = TOKEN
            .captures_iter(inner)
            .all(|token| lookup(slots, &token[1]).is_some_and(|v| !v.trim().is_empty()));
        if complete { inner.to_string() } else { String::new() }
    });
    let filled = TOKEN.replace_all(&resolved, |caps: &regex::Captures<'_>| {
        lookup(slots, &caps[1]).cloned().unwrap_or_default()
    });
    MULTI_SPACE.replace_all(&filled, " ").trim().to_string()
}

fn lookup<'a>(slots: &'a SlotMap, name: &str) -> Option<&'a String> {
    let name = name.trim();
    slots.get(name).or_else(|| {
        slots
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    })
}

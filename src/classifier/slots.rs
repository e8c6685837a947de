//! Text normalization and intent-independent slot extraction.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;

/// Named values extracted from a transmission or supplied by flight context.
pub type SlotMap = BTreeMap<String, String>;

pub const SLOT_RUNWAY: &str = "runway";
pub const SLOT_FREQUENCY: &str = "frequency";
pub const SLOT_ALTITUDE: &str = "altitude";
pub const SLOT_SQUAWK: &str = "squawk";

static DISALLOWED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-z0-9 .]").expect("valid regex"));
static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("valid regex"));

static RUNWAY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\brunway\s+(\d{1,2}[lrc]?)\b").expect("valid regex"));
static FREQUENCY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(\d{3}\.\d{1,3})\b").expect("valid regex"));
static SQUAWK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bsquawk(?:ing)?\s+([0-7]{4})\b").expect("valid regex"));
static ALTITUDE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(?:flight level|fl)\s*(\d+)\b").expect("valid regex"));

/// Lower-case, blank out everything outside `[a-z0-9 .]`, collapse whitespace, trim.
pub fn normalize(text: &str) -> String {
    let lowered = text.to_lowercase();
    let replaced = DISALLOWED.replace_all(&lowered, " ");
    WHITESPACE.replace_all(&replaced, " ").trim().to_string()
}

/// Pull runway, frequency, altitude and squawk out of already-normalized text.
///
/// Runways must be written as digits ("27L"); spoken forms are left to the
/// flight plan.
pub fn extract_slots(normalized: &str) -> SlotMap {
    let mut slots = SlotMap::new();

    if let Some(caps) = RUNWAY.captures(normalized) {
        slots.insert(SLOT_RUNWAY.to_string(), caps[1].to_uppercase());
    }
    if let Some(caps) = FREQUENCY.captures(normalized) {
        slots.insert(SLOT_FREQUENCY.to_string(), caps[1].to_string());
    }
    if let Some(caps) = ALTITUDE.captures(normalized) {
        slots.insert(SLOT_ALTITUDE.to_string(), format!("FL{}", &caps[1]));
    }
    if let Some(caps) = SQUAWK.captures(normalized) {
        slots.insert(SLOT_SQUAWK.to_string(), caps[1].to_string());
    }

    slots
}

/// Whether `slots` holds a non-blank value for `name`.
pub fn has_slot(slots: &SlotMap, name: &str) -> bool {
    slots.get(name).is_some_and(|v| !v.trim().is_empty())
}

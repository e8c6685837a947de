//! Per-aircraft session state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::classifier::{HANDOFF_CHECKIN, SLOT_FREQUENCY, SLOT_RUNWAY, SlotMap};
use crate::role::ControllerRole;
use crate::rules::PhaseDefinition;

/// A handoff that has been issued but not yet checked in on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingHandoff {
    pub role: ControllerRole,
    pub frequency: Option<String>,
    pub facility: Option<String>,
    pub issued_at: DateTime<Utc>,
}

/// Progress flags set by action labels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Milestones {
    pub clearance_issued: bool,
    pub taxi_issued: bool,
    pub takeoff_cleared: bool,
    pub airborne: bool,
    #[serde(default)]
    pub landing_cleared: bool,
    /// A MAYDAY or PAN was acknowledged.
    #[serde(default)]
    pub emergency: bool,
}

impl Milestones {
    /// Set the flag corresponding to `action`, if any.
    pub fn record(&mut self, action: &str) {
        match action {
            "ISSUE_CLEARANCE" => self.clearance_issued = true,
            "ISSUE_TAXI" | "TAXI_CLEARANCE" => self.taxi_issued = true,
            "CLEARED_FOR_TAKEOFF" | "TAKEOFF_CLEARANCE" => self.takeoff_cleared = true,
            "RADAR_CONTACT" | "AIRBORNE" => self.airborne = true,
            "CLEARED_TO_LAND" => self.landing_cleared = true,
            "MAYDAY_ACK" | "PAN_ACK" => self.emergency = true,
            _ => {}
        }
    }
}

/// Dialogue state for one flight. Owned by exactly one session controller.
///
/// Invariant: while `pending_handoff` is set, `expected_next` contains
/// `HANDOFF_CHECKIN`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: Uuid,
    pub phase: String,
    pub role: ControllerRole,
    pub frequency: Option<String>,
    pub facility: Option<String>,
    pub last_action: Option<String>,
    pub last_response: Option<String>,
    pub last_intent: Option<String>,
    pub updated_at: DateTime<Utc>,
    pub milestones: Milestones,
    pub expected_next: Vec<String>,
    pub pending_handoff: Option<PendingHandoff>,
    /// Values the last readback-required instruction issued, by readback item.
    #[serde(default)]
    pub readback_expected: SlotMap,
}

impl SessionState {
    /// Fresh state positioned in `phase`.
    pub fn new(
        phase: &PhaseDefinition,
        role: ControllerRole,
        frequency: Option<String>,
        facility: Option<String>,
    ) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            phase: phase.id.clone(),
            role,
            frequency,
            facility,
            last_action: None,
            last_response: None,
            last_intent: None,
            updated_at: Utc::now(),
            milestones: Milestones::default(),
            expected_next: phase.expected_next.clone(),
            pending_handoff: None,
            readback_expected: SlotMap::new(),
        }
    }

    pub fn has_pending_handoff(&self) -> bool {
        self.pending_handoff.is_some()
    }

    /// First readback item the pilot got wrong, with the value that was issued.
    ///
    /// Only items the transmission actually mentions are compared.
    pub fn readback_mismatch(&self, heard: &SlotMap) -> Option<(&str, &str)> {
        self.readback_expected.iter().find_map(|(item, issued)| {
            let key = match item.as_str() {
                "handoff_frequency" => SLOT_FREQUENCY,
                "arrival_runway" => SLOT_RUNWAY,
                other => other,
            };
            let said = heard.get(key)?;
            (!same_value(said, issued)).then_some((item.as_str(), issued.as_str()))
        })
    }

    /// Reset expected-next intents from `phase`, keeping HANDOFF_CHECKIN while a handoff is pending.
    pub fn refresh_expected(&mut self, phase: &PhaseDefinition) {
        self.expected_next = phase.expected_next.clone();
        if self.has_pending_handoff() && !self.expected_next.iter().any(|i| i == HANDOFF_CHECKIN) {
            self.expected_next.push(HANDOFF_CHECKIN.to_string());
        }
    }
}

/// Numeric values compare as numbers ("121.9" == "121.900"); others ignore case and spaces.
fn same_value(a: &str, b: &str) -> bool {
    if let (Ok(x), Ok(y)) = (a.trim().parse::<f64>(), b.trim().parse::<f64>()) {
        return (x - y).abs() < 1e-6;
    }
    let squash = |s: &str| s.split_whitespace().collect::<String>().to_ascii_lowercase();
    squash(a) == squash(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn phase(expected: &[&str]) -> PhaseDefinition {
        PhaseDefinition {
            id: "clearance".into(),
            allowed_intents: vec![],
            default_role: Some(ControllerRole::Delivery),
            expected_next: expected.iter().map(|s| s.to_string()).collect(),
            transitions: vec![],
            fallback_template: None,
        }
    }

    #[test]
    fn new_state_takes_phase_expectations() {
        let state = SessionState::new(&phase(&["REQUEST_IFR_CLEARANCE"]), ControllerRole::Delivery, None, None);
        assert_eq!(state.phase, "clearance");
        assert_eq!(state.expected_next, vec!["REQUEST_IFR_CLEARANCE"]);
        assert!(!state.has_pending_handoff());
    }

    #[test]
    fn pending_handoff_keeps_checkin_expected() {
        let p = phase(&["READBACK"]);
        let mut state = SessionState::new(&p, ControllerRole::Delivery, None, None);
        state.pending_handoff = Some(PendingHandoff {
            role: ControllerRole::Ground,
            frequency: None,
            facility: None,
            issued_at: Utc::now(),
        });
        state.refresh_expected(&p);
        assert_eq!(state.expected_next, vec!["READBACK", HANDOFF_CHECKIN]);

        // No duplicate on a second refresh.
        state.refresh_expected(&p);
        assert_eq!(state.expected_next.len(), 2);

        state.pending_handoff = None;
        state.refresh_expected(&p);
        assert_eq!(state.expected_next, vec!["READBACK"]);
    }

    #[test]
    fn milestones_follow_actions() {
        let mut m = Milestones::default();
        m.record("ISSUE_CLEARANCE");
        assert!(m.clearance_issued);
        assert!(!m.taxi_issued);
        m.record("ISSUE_TAXI");
        m.record("CLEARED_FOR_TAKEOFF");
        m.record("RADAR_CONTACT");
        assert_eq!(
            m,
            Milestones {
                clearance_issued: true,
                taxi_issued: true,
                takeoff_cleared: true,
                airborne: true,
                landing_cleared: false,
                emergency: false,
            }
        );
        m.record("SAY_AGAIN");
        m.record("PAN_ACK");
        m.record("CLEARED_TO_LAND");
        assert!(m.emergency && m.landing_cleared);
    }

    #[test]
    fn readback_mismatch_compares_mentioned_items_only() {
        let mut state = SessionState::new(&phase(&[]), ControllerRole::Delivery, None, None);
        state.readback_expected.insert("squawk".into(), "4521".into());
        state.readback_expected.insert("handoff_frequency".into(), "121.9".into());

        let heard = |pairs: &[(&str, &str)]| -> SlotMap {
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
        };
        assert_eq!(state.readback_mismatch(&heard(&[])), None);
        assert_eq!(state.readback_mismatch(&heard(&[("squawk", "4521"), ("frequency", "121.900")])), None);
        assert_eq!(
            state.readback_mismatch(&heard(&[("squawk", "4512")])),
            Some(("squawk", "4521"))
        );
        assert_eq!(
            state.readback_mismatch(&heard(&[("frequency", "121.8")])),
            Some(("handoff_frequency", "121.9"))
        );
    }

    #[test]
    fn state_serde_roundtrip() {
        let state = SessionState::new(&phase(&[]), ControllerRole::Delivery, Some("121.900".into()), Some("EGLL".into()));
        let json = serde_json::to_string(&state).unwrap();
        let parsed: SessionState = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, state);
    }
}

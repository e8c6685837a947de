//! Flight context: the aircraft/flight-plan data a session reads and writes back.

use serde::{Deserialize, Serialize};

use crate::classifier::SlotMap;
use crate::role::ControllerRole;
use crate::rules::Airport;

/// Flight-plan and aircraft data owned by the caller.
///
/// The session reads plan fields for template slots and writes the current
/// phase, unit and frequency back after every committed turn.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlightContext {
    pub callsign: String,
    pub origin: Option<String>,
    pub destination: Option<String>,
    /// Departure runway.
    pub runway: Option<String>,
    /// Landing runway at the destination.
    #[serde(default)]
    pub arrival_runway: Option<String>,
    pub sid: Option<String>,
    /// Initial climb, e.g. "5000 feet" or "FL070".
    pub initial_climb: Option<String>,
    pub cruise_level: Option<String>,
    pub squawk: Option<String>,
    /// ATIS information letter.
    pub atis: Option<String>,
    pub aircraft_type: Option<String>,

    pub current_phase: Option<String>,
    pub current_unit: Option<ControllerRole>,
    pub current_frequency: Option<String>,
}

impl FlightContext {
    pub fn new(callsign: impl Into<String>) -> Self {
        Self {
            callsign: callsign.into(),
            ..Default::default()
        }
    }

    /// Airport whose `role` position handles this flight.
    ///
    /// Approach belongs to the destination; every other position to the origin.
    pub fn facility_for(&self, role: ControllerRole) -> Option<&str> {
        match role {
            ControllerRole::Approach => self.destination.as_deref().or(self.origin.as_deref()),
            _ => self.origin.as_deref(),
        }
    }

    pub fn airport(&self, airport: Airport) -> Option<&str> {
        match airport {
            Airport::Origin => self.origin.as_deref(),
            Airport::Destination => self.destination.as_deref(),
        }
    }

    /// Plan fields as template slots. Absent fields are omitted.
    pub fn slots(&self) -> SlotMap {
        let mut slots = SlotMap::new();
        slots.insert("callsign".into(), self.callsign.clone());
        let optional = [
            ("origin", &self.origin),
            ("destination", &self.destination),
            ("runway", &self.runway),
            ("arrival_runway", &self.arrival_runway),
            ("sid", &self.sid),
            ("initial_climb", &self.initial_climb),
            ("cruise_level", &self.cruise_level),
            ("squawk", &self.squawk),
            ("atis", &self.atis),
            ("aircraft_type", &self.aircraft_type),
        ];
        for (name, value) in optional {
            if let Some(value) = value {
                slots.insert(name.to_string(), value.clone());
            }
        }
        slots
    }
}

//! Facility/role frequency lookup.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::role::ControllerRole;

/// Resolves the published frequency of a controller position at an airport.
pub trait FrequencyResolver: Send + Sync {
    fn frequency_for(&self, airport: &str, role: ControllerRole) -> Option<String>;
}

/// One airport entry: MHz per position, `null` when unpublished.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AirportFrequencies {
    #[serde(default, alias = "delivery")]
    pub clearance: Option<f64>,
    #[serde(default)]
    pub ground: Option<f64>,
    #[serde(default)]
    pub tower: Option<f64>,
    #[serde(default)]
    pub departure: Option<f64>,
    #[serde(default)]
    pub center: Option<f64>,
    #[serde(default)]
    pub approach: Option<f64>,
}

impl AirportFrequencies {
    fn get(&self, role: ControllerRole) -> Option<f64> {
        match role {
            ControllerRole::Delivery => self.clearance,
            ControllerRole::Ground => self.ground,
            ControllerRole::Tower => self.tower,
            ControllerRole::Departure => self.departure,
            ControllerRole::Center => self.center,
            ControllerRole::Approach => self.approach,
        }
    }

    fn set(&mut self, role: ControllerRole, mhz: f64) {
        let slot = match role {
            ControllerRole::Delivery => &mut self.clearance,
            ControllerRole::Ground => &mut self.ground,
            ControllerRole::Tower => &mut self.tower,
            ControllerRole::Departure => &mut self.departure,
            ControllerRole::Center => &mut self.center,
            ControllerRole::Approach => &mut self.approach,
        };
        *slot = Some(mhz);
    }
}

/// Airport frequency table keyed by ICAO ident: `{"EGLL": {"ground": 121.7, ...}}`.
#[derive(Debug, Clone, Default)]
pub struct FrequencyTable {
    airports: HashMap<String, AirportFrequencies>,
}

impl FrequencyTable {
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let parsed: HashMap<String, AirportFrequencies> =
            serde_json::from_str(raw).map_err(|e| ConfigError::ParseError(format!("frequency table: {e}")))?;
        Ok(Self {
            airports: parsed
                .into_iter()
                .map(|(icao, freqs)| (icao.trim().to_ascii_uppercase(), freqs))
                .collect(),
        })
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let table = Self::from_json(&raw)?;
        tracing::info!(path = %path.display(), airports = table.len(), "Frequency table loaded");
        Ok(table)
    }

    pub fn insert(&mut self, airport: &str, role: ControllerRole, mhz: f64) {
        self.airports
            .entry(airport.trim().to_ascii_uppercase())
            .or_default()
            .set(role, mhz);
    }

    pub fn len(&self) -> usize {
        self.airports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.airports.is_empty()
    }
}

impl FrequencyResolver for FrequencyTable {
    fn frequency_for(&self, airport: &str, role: ControllerRole) -> Option<String> {
        self.airports
            .get(&airport.trim().to_ascii_uppercase())
            .and_then(|freqs| freqs.get(role))
            .map(format_mhz)
    }
}

/// `121.7` → "121.7", `118.505` → "118.505", `121.0` → "121.0".
pub fn format_mhz(mhz: f64) -> String {
    let fixed = format!("{mhz:.3}");
    let trimmed = fixed.trim_end_matches('0');
    if trimmed.ends_with('.') {
        format!("{trimmed}0")
    } else {
        trimmed.to_string()
    }
}

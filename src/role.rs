//! Controller roles.
//!
//! Roles are a closed set; which phase a role owns is rule-pack data
//! (see `RulePackStore::phase_for_role`).

use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// An ATC controller position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControllerRole {
    #[serde(alias = "clearance")]
    Delivery,
    Ground,
    Tower,
    Departure,
    Center,
    Approach,
}

/// Role keywords as they appear in a normalized transmission.
static ROLE_KEYWORD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(ground|tower|departure|center|centre|approach|delivery|clearance)\b")
        .expect("role keyword regex is valid")
});

/// Words of a transmission that can hold the station being called.
const STATION_CALL_WORDS: usize = 3;

impl ControllerRole {
    pub const ALL: [ControllerRole; 6] = [
        Self::Delivery,
        Self::Ground,
        Self::Tower,
        Self::Departure,
        Self::Center,
        Self::Approach,
    ];

    /// Stable lowercase identifier.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Delivery => "delivery",
            Self::Ground => "ground",
            Self::Tower => "tower",
            Self::Departure => "departure",
            Self::Center => "center",
            Self::Approach => "approach",
        }
    }

    /// Name as spoken on frequency ("Ground", "Tower", ...).
    pub fn spoken_name(&self) -> &'static str {
        match self {
            Self::Delivery => "Delivery",
            Self::Ground => "Ground",
            Self::Tower => "Tower",
            Self::Departure => "Departure",
            Self::Center => "Center",
            Self::Approach => "Approach",
        }
    }

    /// The role named in the station call that opens `text`, if any.
    ///
    /// Only the leading call counts: the text before the first comma, and at
    /// most its first three words. "ready for departure" later in the
    /// transmission is a request, not an address. "clearance" is read as
    /// delivery.
    pub fn mentioned_in(text: &str) -> Option<ControllerRole> {
        let leading = text.split(',').next().unwrap_or_default();
        let call = leading
            .split_whitespace()
            .take(STATION_CALL_WORDS)
            .collect::<Vec<_>>()
            .join(" ");
        ROLE_KEYWORD
            .find(&call)
            .and_then(|m| m.as_str().parse().ok())
    }
}

impl FromStr for ControllerRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "delivery" | "clearance" | "del" | "clr" => Ok(Self::Delivery),
            "ground" | "gnd" => Ok(Self::Ground),
            "tower" | "twr" => Ok(Self::Tower),
            "departure" | "dep" => Ok(Self::Departure),
            "center" | "centre" | "ctr" => Ok(Self::Center),
            "approach" | "app" | "apch" => Ok(Self::Approach),
            other => Err(format!("unknown controller role: {other}")),
        }
    }
}

impl std::fmt::Display for ControllerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clearance_reads_as_delivery() {
        assert_eq!("clearance".parse::<ControllerRole>().unwrap(), ControllerRole::Delivery);
        let parsed: ControllerRole = serde_json::from_str("\"clearance\"").unwrap();
        assert_eq!(parsed, ControllerRole::Delivery);
    }

    #[test]
    fn display_matches_serde() {
        for role in ControllerRole::ALL {
            let json = serde_json::to_string(&role).unwrap();
            assert_eq!(format!("\"{role}\""), json);
        }
    }

    #[test]
    fn mentioned_in_reads_the_station_call() {
        assert_eq!(
            ControllerRole::mentioned_in("Ground, TEST 123 with you"),
            Some(ControllerRole::Ground)
        );
        assert_eq!(
            ControllerRole::mentioned_in("tower test 123 told to call ground"),
            Some(ControllerRole::Tower)
        );
        assert_eq!(
            ControllerRole::mentioned_in("London Centre, TEST 123"),
            Some(ControllerRole::Center)
        );
        assert_eq!(ControllerRole::mentioned_in("TEST 123 with you"), None);
    }

    #[test]
    fn roles_after_the_station_call_are_ignored() {
        assert_eq!(
            ControllerRole::mentioned_in("TEST 123 with you, ready for departure"),
            None
        );
        assert_eq!(
            ControllerRole::mentioned_in("test 123 with you ready for departure"),
            None
        );
        assert_eq!(
            ControllerRole::mentioned_in("Edinburgh Tower, TEST 123, established ILS"),
            Some(ControllerRole::Tower)
        );
    }

    #[test]
    fn mentioned_in_requires_word_boundary() {
        assert_eq!(ControllerRole::mentioned_in("background noise"), None);
    }

    #[test]
    fn unknown_role_rejected() {
        assert!("ramp".parse::<ControllerRole>().is_err());
    }
}

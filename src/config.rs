//! Configuration types.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Threshold used when neither the intent nor the rule pack declares one.
pub const ENGINE_DEFAULT_THRESHOLD: f32 = 0.6;

/// Dialogue engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Engine-level minimum confidence for an intent to win.
    pub default_threshold: f32,
    /// Whether a HANDOFF_CHECKIN turn may commit a pending handoff.
    pub allow_handoff_commit: bool,
    /// Directory holding `intents.json`, `phases.json` and `templates.json`.
    /// The built-in pack is used when unset.
    pub rule_pack_dir: Option<PathBuf>,
    /// Airport frequency table (JSON).
    pub frequency_table: Option<PathBuf>,
    /// Seed for template variant selection.
    pub rng_seed: Option<u64>,
    /// Upper bound on a single fallback call.
    pub fallback_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_threshold: ENGINE_DEFAULT_THRESHOLD,
            allow_handoff_commit: true,
            rule_pack_dir: None,
            frequency_table: None,
            rng_seed: None,
            fallback_timeout: Duration::from_secs(8),
        }
    }
}

impl EngineConfig {
    /// Build a config from `ATC_*` environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let default_threshold =
            parse_env("ATC_DEFAULT_THRESHOLD")?.unwrap_or(defaults.default_threshold);
        if !(0.0..=1.0).contains(&default_threshold) {
            return Err(ConfigError::InvalidValue {
                key: "ATC_DEFAULT_THRESHOLD".into(),
                message: format!("{default_threshold} is outside 0.0..=1.0"),
            });
        }

        let fallback_timeout = parse_env::<u64>("ATC_FALLBACK_TIMEOUT_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.fallback_timeout);

        Ok(Self {
            default_threshold,
            allow_handoff_commit: parse_env("ATC_ALLOW_HANDOFF_COMMIT")?
                .unwrap_or(defaults.allow_handoff_commit),
            rule_pack_dir: std::env::var_os("ATC_RULE_PACK_DIR").map(PathBuf::from),
            frequency_table: std::env::var_os("ATC_FREQUENCY_TABLE").map(PathBuf::from),
            rng_seed: parse_env("ATC_RNG_SEED")?,
            fallback_timeout,
        })
    }
}

fn parse_env<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if raw.trim().is_empty() => Ok(None),
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            }),
        Err(_) => Ok(None),
    }
}

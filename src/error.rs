//! Error types for the dialogue engine.
//!
//! The engine itself fails soft: lookups degrade to the next fallback and a
//! turn that produces nothing returns `Ok(None)`. The variants here cover
//! load-time problems, the fallback boundaries, and cancellation.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Rule pack error: {0}")]
    RulePack(#[from] RulePackError),

    #[error("Fallback error: {0}")]
    Fallback(#[from] FallbackError),

    #[error("Session task for {callsign} is no longer running")]
    SessionClosed { callsign: String },
}

impl Error {
    /// Whether this error is a cancelled turn.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Fallback(FallbackError::Cancelled))
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Rule pack loading errors. Raised only at load time.
#[derive(Debug, thiserror::Error)]
pub enum RulePackError {
    #[error("Failed to read rule table {file}: {source}")]
    Io {
        file: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse rule table {file}: {source}")]
    Parse {
        file: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid pattern {pattern:?} in intent {intent}: {source}")]
    InvalidPattern {
        intent: String,
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("Rule pack declares no phases")]
    NoPhases,
}

/// Errors raised at the fallback classifier / response generator boundary.
#[derive(Debug, thiserror::Error)]
pub enum FallbackError {
    #[error("Turn cancelled")]
    Cancelled,

    #[error("Fallback strategy {strategy} failed: {reason}")]
    Failed { strategy: String, reason: String },

    #[error("Fallback strategy {strategy} timed out after {timeout:?}")]
    Timeout { strategy: String, timeout: Duration },

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for the engine.
pub type Result<T> = std::result::Result<T, Error>;

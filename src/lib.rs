//! ATC dialogue: deterministic controller for pilot radio exchanges.

pub mod classifier;
pub mod config;
pub mod error;
pub mod fallback;
pub mod flow;
pub mod frequency;
pub mod llm;
pub mod role;
pub mod rules;
pub mod session;
pub mod template;

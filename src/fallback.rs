//! Fallback strategies for the two points where rules are not enough.
//!
//! Each boundary holds an ordered chain of strategies. The chain tries them
//! in order and stops at the first one that produces something; an empty
//! chain simply produces nothing. Every call is raced against the turn's
//! cancellation token and a timeout.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::classifier::{ClassificationContext, ClassificationResult};
use crate::error::FallbackError;
use crate::role::ControllerRole;
use crate::session::FlightContext;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(8);

/// Classifies a transmission the rules could not place confidently.
#[async_trait]
pub trait FallbackClassifier: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Return `None` to defer to the rule result.
    async fn classify(
        &self,
        transcript: &str,
        context: &ClassificationContext,
        cancel: &CancellationToken,
    ) -> Result<Option<ClassificationResult>, FallbackError>;
}

/// Everything a generative responder gets to see.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationRequest {
    pub transcript: String,
    pub role: ControllerRole,
    pub flight: FlightContext,
    /// Session state, slots, classification and decision as JSON.
    pub snapshot: serde_json::Value,
}

/// Produces a response when no template rendered.
#[async_trait]
pub trait ResponseGenerator: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Empty text counts as failure.
    async fn generate(
        &self,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<String, FallbackError>;
}

/// Ordered fallback classifiers.
#[derive(Clone)]
pub struct ClassifierChain {
    strategies: Vec<Arc<dyn FallbackClassifier>>,
    timeout: Duration,
}

impl Default for ClassifierChain {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

impl ClassifierChain {
    pub fn new(timeout: Duration) -> Self {
        Self {
            strategies: Vec::new(),
            timeout,
        }
    }

    pub fn push(&mut self, strategy: Arc<dyn FallbackClassifier>) {
        self.strategies.push(strategy);
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    /// First non-`None` classification, or `None` if every strategy deferred or failed.
    pub async fn try_classify(
        &self,
        transcript: &str,
        context: &ClassificationContext,
        cancel: &CancellationToken,
    ) -> Result<Option<ClassificationResult>, FallbackError> {
        for strategy in &self.strategies {
            let attempt = guarded(
                strategy.name(),
                self.timeout,
                cancel,
                strategy.classify(transcript, context, cancel),
            )
            .await;

            match attempt {
                Ok(Some(result)) => {
                    debug!(
                        strategy = strategy.name(),
                        intent = %result.intent,
                        confidence = result.confidence,
                        "Fallback classifier answered"
                    );
                    return Ok(Some(result));
                }
                Ok(None) => debug!(strategy = strategy.name(), "Fallback classifier deferred"),
                Err(FallbackError::Cancelled) => return Err(FallbackError::Cancelled),
                Err(e) => warn!(strategy = strategy.name(), error = %e, "Fallback classifier failed"),
            }
        }
        Ok(None)
    }
}

/// Ordered response generators.
#[derive(Clone)]
pub struct GeneratorChain {
    strategies: Vec<Arc<dyn ResponseGenerator>>,
    timeout: Duration,
}

impl Default for GeneratorChain {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

/// Text produced by a generator, tagged with the generator's name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generated {
    pub strategy: String,
    pub text: String,
}

impl GeneratorChain {
    pub fn new(timeout: Duration) -> Self {
        Self {
            strategies: Vec::new(),
            timeout,
        }
    }

    pub fn push(&mut self, strategy: Arc<dyn ResponseGenerator>) {
        self.strategies.push(strategy);
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    /// First non-empty response, or `None`.
    pub async fn try_generate(
        &self,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<Option<Generated>, FallbackError> {
        for strategy in &self.strategies {
            let attempt = guarded(
                strategy.name(),
                self.timeout,
                cancel,
                strategy.generate(request, cancel),
            )
            .await;

            match attempt {
                Ok(text) if !text.trim().is_empty() => {
                    return Ok(Some(Generated {
                        strategy: strategy.name().to_string(),
                        text: text.trim().to_string(),
                    }));
                }
                Ok(_) => debug!(strategy = strategy.name(), "Generator returned empty text"),
                Err(FallbackError::Cancelled) => return Err(FallbackError::Cancelled),
                Err(e) => warn!(strategy = strategy.name(), error = %e, "Response generator failed"),
            }
        }
        Ok(None)
    }
}

/// Run `fut` unless `cancel` fires first or `timeout` elapses.
async fn guarded<T, F>(
    strategy: &str,
    timeout: Duration,
    cancel: &CancellationToken,
    fut: F,
) -> Result<T, FallbackError>
where
    F: Future<Output = Result<T, FallbackError>>,
{
    if cancel.is_cancelled() {
        return Err(FallbackError::Cancelled);
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(FallbackError::Cancelled),
        outcome = tokio::time::timeout(timeout, fut) => match outcome {
            Ok(result) => result,
            Err(_) => Err(FallbackError::Timeout {
                strategy: strategy.to_string(),
                timeout,
            }),
        },
    }
}

//! One task per aircraft.
//!
//! The controller is not safe for concurrent turns, so each aircraft's
//! controller lives inside its own task and transmissions reach it over a
//! channel. Turns are processed one at a time in receipt order.

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};
use crate::session::{FlightContext, SessionController, SessionState, TurnResponse};

/// Pending turns per aircraft before senders wait.
const SESSION_QUEUE_DEPTH: usize = 32;

enum Command {
    Turn {
        transcript: String,
        cancel: CancellationToken,
        reply: oneshot::Sender<Result<Option<TurnResponse>>>,
    },
    Snapshot {
        reply: oneshot::Sender<(Option<SessionState>, FlightContext)>,
    },
}

/// Cloneable handle to an aircraft's session task.
#[derive(Clone)]
pub struct SessionHandle {
    callsign: String,
    tx: mpsc::Sender<Command>,
}

impl SessionHandle {
    /// Move `controller` and `flight` into a new task. The task stops when
    /// the last handle is dropped.
    pub fn spawn(mut controller: SessionController, mut flight: FlightContext) -> Self {
        let (tx, mut rx) = mpsc::channel(SESSION_QUEUE_DEPTH);
        let callsign = flight.callsign.clone();

        tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                match command {
                    Command::Turn {
                        transcript,
                        cancel,
                        reply,
                    } => {
                        let outcome = controller
                            .handle_with_cancel(&transcript, &mut flight, &cancel)
                            .await;
                        let _ = reply.send(outcome);
                    }
                    Command::Snapshot { reply } => {
                        let _ = reply.send((controller.state().cloned(), flight.clone()));
                    }
                }
            }
            debug!(callsign = %flight.callsign, "Session task finished");
        });

        Self { callsign, tx }
    }

    pub fn callsign(&self) -> &str {
        &self.callsign
    }

    /// Submit a transmission and wait for its turn to finish.
    pub async fn transmit(&self, transcript: impl Into<String>) -> Result<Option<TurnResponse>> {
        self.transmit_with_cancel(transcript, CancellationToken::new())
            .await
    }

    pub async fn transmit_with_cancel(
        &self,
        transcript: impl Into<String>,
        cancel: CancellationToken,
    ) -> Result<Option<TurnResponse>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Turn {
                transcript: transcript.into(),
                cancel,
                reply,
            })
            .await
            .map_err(|_| self.closed())?;
        rx.await.map_err(|_| self.closed())?
    }

    /// Current session state and flight context.
    pub async fn snapshot(&self) -> Result<(Option<SessionState>, FlightContext)> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Snapshot { reply })
            .await
            .map_err(|_| self.closed())?;
        rx.await.map_err(|_| self.closed())
    }

    fn closed(&self) -> Error {
        Error::SessionClosed {
            callsign: self.callsign.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::EngineConfig;
    use crate::rules::RulePackStore;

    fn handle() -> SessionHandle {
        let store = Arc::new(RulePackStore::builtin().unwrap());
        let controller = SessionController::new(store, EngineConfig::default()).with_rng_seed(3);
        SessionHandle::spawn(controller, FlightContext::new("TEST 123"))
    }

    #[tokio::test]
    async fn turns_run_in_order() {
        let session = handle();
        let first = session.transmit("Delivery, TEST 123, request IFR clearance");
        let second = session.transmit("Cleared to EGPH, squawk 4521, TEST 123");
        let (first, second) = tokio::join!(first, second);
        let first = first.unwrap().unwrap();
        let second = second.unwrap().unwrap();
        assert_eq!(first.session.last_action.as_deref(), Some("ISSUE_CLEARANCE"));
        assert!(second.session.has_pending_handoff());

        let (state, flight) = session.snapshot().await.unwrap();
        assert_eq!(state.unwrap(), second.session);
        assert_eq!(flight.current_phase.as_deref(), Some("clearance"));
    }

    #[tokio::test]
    async fn snapshot_before_any_turn_is_empty() {
        let session = handle();
        let (state, flight) = session.snapshot().await.unwrap();
        assert!(state.is_none());
        assert_eq!(flight.callsign, "TEST 123");
        assert_eq!(session.callsign(), "TEST 123");
    }
}

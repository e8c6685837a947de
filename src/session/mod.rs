//! Per-aircraft dialogue sessions.

pub mod actor;
pub mod controller;
pub mod flight;
pub mod state;

pub use actor::SessionHandle;
pub use controller::{CORRECTION_TEMPLATE_ID, REISSUE_TEMPLATE_ID, ResponseSource, SessionController, TurnResponse};
pub use flight::FlightContext;
pub use state::{Milestones, PendingHandoff, SessionState};

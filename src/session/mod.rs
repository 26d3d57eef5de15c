//! Per-connection session state

pub mod liveness;
pub mod state;

pub use liveness::{LivenessAction, LivenessMonitor};
pub use state::{CloseReason, SessionEvent, SessionPhase, SessionState};

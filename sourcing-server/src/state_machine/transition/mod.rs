//! Pure state transition functions.
//!
//! Transitions take the current state and a target state and return the new
//! state plus the effects the engine has to materialize. They perform no I/O.
//!
//! - `request`: Request lifecycle (Open -> Processing -> Processed/Withdrawn)
//! - `data_sourcing`: pipeline progress and the administrative override

mod data_sourcing;
mod request;

pub use data_sourcing::{advance_pipeline, override_state, pipeline_transition};
pub use request::request_transition;

use thiserror::Error;

use super::effect::Effect;
use super::state::{DataSourcingState, RequestState};

/// Result of a state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionResult<S> {
    /// The new state after the transition.
    pub state: S,
    /// Effects to materialize.
    pub effects: Vec<Effect>,
}

impl<S> TransitionResult<S> {
    pub fn new(state: S, effects: Vec<Effect>) -> Self {
        Self { state, effects }
    }
}

/// A transition the state machine refuses to perform.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("request cannot move from {from} to {to}")]
    Request { from: RequestState, to: RequestState },

    #[error("data sourcing cannot move forward from {from} to {to}")]
    Pipeline {
        from: DataSourcingState,
        to: DataSourcingState,
    },
}

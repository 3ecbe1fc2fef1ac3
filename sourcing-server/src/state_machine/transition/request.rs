//! Request lifecycle transitions.

use super::{TransitionError, TransitionResult};
use crate::state_machine::effect::Effect;
use crate::state_machine::state::RequestState;

/// Move a request from `from` to `to`.
///
/// Legal edges are Open -> Processing, Processing -> Processed and
/// Processing -> Withdrawn. Everything else, including self-loops and any
/// edge leaving a terminal state, is rejected.
pub fn request_transition(
    from: RequestState,
    to: RequestState,
) -> Result<TransitionResult<RequestState>, TransitionError> {
    use RequestState::*;

    let effects = match (from, to) {
        (Open, Processing) => vec![
            Effect::AssignDataSourcing,
            Effect::NotifyProcessing,
            Effect::log_info("Request set to Processing"),
        ],
        (Processing, Processed) => vec![Effect::log_info("Request set to Processed")],
        (Processing, Withdrawn) => vec![
            Effect::NotifyWithdrawn,
            Effect::log_info("Request withdrawn"),
        ],
        _ => return Err(TransitionError::Request { from, to }),
    };

    Ok(TransitionResult::new(to, effects))
}

//! Data sourcing pipeline transitions and the administrative override.

use super::{TransitionError, TransitionResult};
use crate::state_machine::effect::Effect;
use crate::state_machine::state::DataSourcingState;

fn entry_effects(from: DataSourcingState, to: DataSourcingState, message: String) -> Vec<Effect> {
    let mut effects = Vec::new();
    if to.is_terminal() {
        effects.push(Effect::CloseAssociatedRequests);
    }
    if to == DataSourcingState::NonSourceable && from != DataSourcingState::NonSourceable {
        effects.push(Effect::NotifyNonSourceable);
    }
    effects.push(Effect::log_info(message));
    effects
}

/// Forward-only pipeline move. Skipping intermediate states is allowed;
/// `NonSourceable` is reachable from every non-terminal state.
pub fn pipeline_transition(
    from: DataSourcingState,
    to: DataSourcingState,
) -> Result<TransitionResult<DataSourcingState>, TransitionError> {
    if from.is_terminal() || to.pipeline_rank() <= from.pipeline_rank() {
        return Err(TransitionError::Pipeline { from, to });
    }
    Ok(TransitionResult::new(
        to,
        entry_effects(from, to, format!("Data sourcing advanced from {} to {}", from, to)),
    ))
}

/// Move to the next pipeline state.
pub fn advance_pipeline(
    from: DataSourcingState,
) -> Result<TransitionResult<DataSourcingState>, TransitionError> {
    match from.next() {
        Some(to) => pipeline_transition(from, to),
        None => Err(TransitionError::Pipeline { from, to: from }),
    }
}

/// Privileged override. Accepts every target, including backwards moves.
pub fn override_state(
    from: DataSourcingState,
    to: DataSourcingState,
) -> TransitionResult<DataSourcingState> {
    TransitionResult::new(
        to,
        entry_effects(
            from,
            to,
            format!("Data sourcing state overridden from {} to {}", from, to),
        ),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn arb_ds_state() -> impl Strategy<Value = DataSourcingState> {
        prop_oneof![
            Just(DataSourcingState::Initialized),
            Just(DataSourcingState::DocumentSourcing),
            Just(DataSourcingState::DataVerification),
            Just(DataSourcingState::Done),
            Just(DataSourcingState::NonSourceable),
        ]
    }

    #[test]
    fn test_advance_walks_the_pipeline() {
        let mut state = DataSourcingState::Initialized;
        for expected in [
            DataSourcingState::DocumentSourcing,
            DataSourcingState::DataVerification,
            DataSourcingState::Done,
        ] {
            state = advance_pipeline(state).unwrap().state;
            assert_eq!(state, expected);
        }
        assert!(advance_pipeline(state).is_err());
    }

    #[test]
    fn test_pipeline_may_skip_states() {
        let result =
            pipeline_transition(DataSourcingState::Initialized, DataSourcingState::DataVerification)
                .unwrap();
        assert_eq!(result.state, DataSourcingState::DataVerification);
        assert!(!result.effects.contains(&Effect::CloseAssociatedRequests));
    }

    #[test]
    fn test_entering_terminal_state_closes_requests() {
        let done =
            pipeline_transition(DataSourcingState::DataVerification, DataSourcingState::Done)
                .unwrap();
        assert!(done.effects.contains(&Effect::CloseAssociatedRequests));

        let non_sourceable = pipeline_transition(
            DataSourcingState::DocumentSourcing,
            DataSourcingState::NonSourceable,
        )
        .unwrap();
        assert!(non_sourceable
            .effects
            .contains(&Effect::CloseAssociatedRequests));
    }

    #[test]
    fn test_only_entering_non_sourceable_notifies() {
        let entered = pipeline_transition(
            DataSourcingState::Initialized,
            DataSourcingState::NonSourceable,
        )
        .unwrap();
        assert!(entered.effects.contains(&Effect::NotifyNonSourceable));

        let overridden =
            override_state(DataSourcingState::Done, DataSourcingState::NonSourceable);
        assert!(overridden.effects.contains(&Effect::NotifyNonSourceable));

        let unchanged = override_state(
            DataSourcingState::NonSourceable,
            DataSourcingState::NonSourceable,
        );
        assert!(!unchanged.effects.contains(&Effect::NotifyNonSourceable));
        assert!(!override_state(DataSourcingState::Initialized, DataSourcingState::Done)
            .effects
            .contains(&Effect::NotifyNonSourceable));
    }

    #[test]
    fn test_pipeline_rejects_backwards_move() {
        let err = pipeline_transition(
            DataSourcingState::DataVerification,
            DataSourcingState::DocumentSourcing,
        )
        .unwrap_err();
        assert_eq!(
            err,
            TransitionError::Pipeline {
                from: DataSourcingState::DataVerification,
                to: DataSourcingState::DocumentSourcing,
            }
        );
    }

    #[test]
    fn test_override_can_move_backwards() {
        let result = override_state(DataSourcingState::Done, DataSourcingState::Initialized);
        assert_eq!(result.state, DataSourcingState::Initialized);
        assert!(!result.effects.contains(&Effect::CloseAssociatedRequests));
    }

    proptest! {
        /// The pipeline path only ever increases the pipeline rank.
        #[test]
        fn pipeline_path_is_monotonic(
            from in arb_ds_state(),
            to in arb_ds_state(),
        ) {
            if let Ok(result) = pipeline_transition(from, to) {
                prop_assert!(result.state.pipeline_rank() > from.pipeline_rank());
            }
        }

        /// The override accepts every pair, so it is not monotonic.
        #[test]
        fn override_accepts_every_target(
            from in arb_ds_state(),
            to in arb_ds_state(),
        ) {
            prop_assert_eq!(override_state(from, to).state, to);
        }
    }
}

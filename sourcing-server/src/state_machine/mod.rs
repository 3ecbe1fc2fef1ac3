//! Explicit state machine for the request and data sourcing lifecycle.
//!
//! The design separates:
//! - **State**: What the system knows (`Request`, `DataSourcing`)
//! - **Effects**: What has to happen alongside a state change (`Effect`)
//! - **Transition**: Pure functions `(State, Target) -> (State, Vec<Effect>)`
//!
//! The engine loads state from the repository, runs the pure transition,
//! materializes the effects into one atomic commit and relays transition
//! messages to the event channel once that commit succeeded.

pub mod effect;
pub mod engine;
pub mod state;
pub mod transition;

pub use effect::*;
pub use engine::{BulkRequestOutcome, DataSourcingPatch, SourcingEngine};
pub use state::*;
pub use transition::*;

pub mod admin;
pub mod config;
pub mod error;
pub mod history;
pub mod ledger;
pub mod messaging;
pub mod notifier;
pub mod reconciler;
pub mod repository;
pub mod roles;
pub mod state_machine;

use std::sync::Arc;

pub use error::SourcingError;
pub use ledger::CreditsLedger;
pub use repository::DeadLetterRepository;
pub use state_machine::SourcingEngine;

/// Version reported by `/health` and in the role service user agent.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Shared state of the operator API.
pub struct AppState {
    pub engine: Arc<SourcingEngine>,
    pub ledger: Arc<CreditsLedger>,
    pub dead_letters: Arc<dyn DeadLetterRepository>,
    /// Bearer token for the operator API. None disables it.
    pub status_auth_token: Option<String>,
}

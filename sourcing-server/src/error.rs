//! Error taxonomy for domain operations.

use sourcing_core::{RequestId, SourcingTriple, UserId};
use thiserror::Error;

use crate::repository::RepositoryError;
use crate::state_machine::transition::TransitionError;

/// Errors returned by engine operations and queries.
#[derive(Debug, Error)]
pub enum SourcingError {
    /// Illegal transition. Never retried.
    #[error("state conflict: {0}")]
    StateConflict(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("user {user_id} already has active request {existing} for {triple}")]
    DuplicateRequest {
        user_id: UserId,
        existing: RequestId,
        triple: SourcingTriple,
    },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error(transparent)]
    Repository(RepositoryError),
}

impl SourcingError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// True for errors a caller may retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Repository(RepositoryError::Storage { .. })
        )
    }
}

impl From<TransitionError> for SourcingError {
    fn from(err: TransitionError) -> Self {
        Self::StateConflict(err.to_string())
    }
}

impl From<RepositoryError> for SourcingError {
    fn from(err: RepositoryError) -> Self {
        match err {
            // A lost compare-and-set or a uniqueness violation is a conflict
            // with another writer.
            RepositoryError::Conflict { what } => Self::StateConflict(what),
            other => Self::Repository(other),
        }
    }
}

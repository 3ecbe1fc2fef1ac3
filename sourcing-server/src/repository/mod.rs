//! Repository abstraction for persistence.
//!
//! This module defines the traits that abstract storage of requests, data
//! sourcing units, the billing ledger and dead letters. Implementations
//! provide the backend (in-memory or SQLite); everything above this layer
//! only talks to the traits.

mod memory;
pub mod sqlite;

pub use memory::InMemoryRepository;
pub use sqlite::SqliteRepository;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sourcing_core::{
    CompanyId, DataSourcingId, Envelope, FrameworkFilter, ReportingPeriod, RequestId,
    SourcingTriple, UserId,
};
use thiserror::Error;
use uuid::Uuid;

use crate::ledger::{BilledLedgerEntry, CreditsTransaction};
use crate::messaging::DeadLetter;
use crate::state_machine::state::{
    DataSourcing, DataSourcingRevision, Request, RequestRevision, RequestState,
};

/// Errors from a storage backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RepositoryError {
    /// The backend failed. Retrying may succeed.
    #[error("storage error during {operation}: {message}")]
    Storage {
        operation: &'static str,
        message: String,
    },

    /// Stored data could not be decoded.
    #[error("corrupt data: {what}")]
    Corruption { what: String },

    /// A compare-and-set or uniqueness guard rejected the write.
    #[error("conflict: {what}")]
    Conflict { what: String },
}

impl RepositoryError {
    pub fn storage(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Storage {
            operation,
            message: message.into(),
        }
    }

    pub fn corruption(what: impl Into<String>) -> Self {
        Self::Corruption { what: what.into() }
    }

    pub fn conflict(what: impl Into<String>) -> Self {
        Self::Conflict { what: what.into() }
    }
}

/// Filter for `find_requests`. `None` fields and an empty `states` list
/// match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestQuery {
    pub user_id: Option<UserId>,
    pub company_id: Option<CompanyId>,
    #[serde(default)]
    pub framework: FrameworkFilter,
    pub reporting_period: Option<ReportingPeriod>,
    #[serde(default)]
    pub states: Vec<RequestState>,
}

impl RequestQuery {
    pub fn matches(&self, request: &Request) -> bool {
        self.user_id.map_or(true, |id| request.user_id == id)
            && self
                .company_id
                .map_or(true, |id| request.triple.company_id == id)
            && self.framework.matches(&request.triple.framework)
            && self
                .reporting_period
                .as_ref()
                .map_or(true, |period| &request.triple.reporting_period == period)
            && (self.states.is_empty() || self.states.contains(&request.state))
    }

    /// Active requests of `user` for `triple`.
    pub fn active_for(user_id: UserId, triple: &SourcingTriple) -> Self {
        Self {
            user_id: Some(user_id),
            company_id: Some(triple.company_id),
            framework: FrameworkFilter::Specific(triple.framework.clone()),
            reporting_period: Some(triple.reporting_period.clone()),
            states: vec![RequestState::Open, RequestState::Processing],
        }
    }
}

/// Insert or compare-and-set update of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestWrite {
    pub request: Request,
    /// `None` inserts a new request. `Some(version)` updates only if the
    /// stored request is still at `version`.
    pub expected: Option<i64>,
}

impl RequestWrite {
    /// Insert `request` as its first stored version.
    pub fn insert(mut request: Request) -> Self {
        request.version = 1;
        Self {
            request,
            expected: None,
        }
    }

    /// Update of a request that was loaded at `request.version`. The written
    /// request carries the next version.
    pub fn update(mut request: Request) -> Self {
        let expected = request.version;
        request.version = expected + 1;
        Self {
            request,
            expected: Some(expected),
        }
    }
}

/// Insert or compare-and-set update of a data sourcing unit.
///
/// `associated_requests` is recomputed from the stored requests when the
/// commit is applied, so concurrent assignments never lose each other.
/// The stored `version` is set by the repository: 1 on insert, one past
/// `expected` on update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSourcingWrite {
    pub data_sourcing: DataSourcing,
    /// `None` inserts. `Some(version)` updates only if the stored unit is
    /// still at `version`.
    pub expected: Option<i64>,
}

impl DataSourcingWrite {
    pub fn insert(mut data_sourcing: DataSourcing) -> Self {
        data_sourcing.version = 1;
        Self {
            data_sourcing,
            expected: None,
        }
    }

    /// Update of a unit loaded at `data_sourcing.version`.
    pub fn update(mut data_sourcing: DataSourcing) -> Self {
        let expected = data_sourcing.version;
        data_sourcing.version = expected + 1;
        Self {
            data_sourcing,
            expected: Some(expected),
        }
    }
}

/// Version stored by a write with the given guard.
pub(crate) fn next_version(expected: Option<i64>) -> i64 {
    expected.map_or(1, |version| version + 1)
}

/// A transition message persisted alongside the state change that caused it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxMessage {
    pub queue: String,
    pub envelope: Envelope,
}

impl OutboxMessage {
    pub fn message_id(&self) -> Uuid {
        self.envelope.message_id
    }
}

/// Everything one engine operation writes. Applied atomically: request
/// writes first, then data sourcing writes (each appending one revision),
/// then outbox messages.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Commit {
    pub requests: Vec<RequestWrite>,
    pub data_sourcings: Vec<DataSourcingWrite>,
    pub outbox: Vec<OutboxMessage>,
}

impl Commit {
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty() && self.data_sourcings.is_empty() && self.outbox.is_empty()
    }
}

/// Storage for requests, data sourcing units and their revision logs.
/// Commits also write the outbox.
#[async_trait]
pub trait SourcingRepository: OutboxRepository {
    async fn get_request(&self, id: RequestId) -> Result<Option<Request>, RepositoryError>;

    /// Requests matching `query`, oldest first.
    async fn find_requests(&self, query: &RequestQuery) -> Result<Vec<Request>, RepositoryError>;

    async fn requests_for_data_sourcing(
        &self,
        id: DataSourcingId,
    ) -> Result<Vec<Request>, RepositoryError>;

    async fn get_data_sourcing(
        &self,
        id: DataSourcingId,
    ) -> Result<Option<DataSourcing>, RepositoryError>;

    /// The non-terminal unit for `triple`, if any.
    async fn find_active_data_sourcing(
        &self,
        triple: &SourcingTriple,
    ) -> Result<Option<DataSourcing>, RepositoryError>;

    /// Units where `company` is document collector or data extractor.
    async fn assigned_data_sourcings(
        &self,
        company: CompanyId,
    ) -> Result<Vec<DataSourcing>, RepositoryError>;

    /// Priority per triple, taken from its non-terminal unit or else from
    /// its most recently modified one. Triples without a unit are omitted.
    async fn priorities_by_triples(
        &self,
        triples: &[SourcingTriple],
    ) -> Result<Vec<(SourcingTriple, i32)>, RepositoryError>;

    /// Revision log of a unit, oldest first. Empty for unknown ids.
    async fn data_sourcing_history(
        &self,
        id: DataSourcingId,
    ) -> Result<Vec<DataSourcingRevision>, RepositoryError>;

    /// Revision log of a request, oldest first. Empty for unknown ids.
    async fn request_history(
        &self,
        id: RequestId,
    ) -> Result<Vec<RequestRevision>, RepositoryError>;

    /// Apply `commit` atomically and return the stored units.
    ///
    /// Fails with `RepositoryError::Conflict` when a compare-and-set guard
    /// does not hold, when a user would hold two active requests for the same
    /// triple, or when two non-terminal units would share a triple. Nothing
    /// is written in that case.
    async fn commit(&self, commit: Commit) -> Result<Vec<DataSourcing>, RepositoryError>;
}

/// The transition outbox. A message stays pending until a consumer has
/// settled it (handled or dead-lettered), so anything still queued in memory
/// when the process stops is published again on the next start.
#[async_trait]
pub trait OutboxRepository: Send + Sync {
    /// Outbox messages not yet marked dispatched, oldest first.
    async fn pending_outbox(&self) -> Result<Vec<OutboxMessage>, RepositoryError>;

    /// Mark a message settled. Unknown ids are ignored.
    async fn mark_dispatched(&self, message_id: Uuid) -> Result<(), RepositoryError>;
}

/// Storage for billed entries and credit transactions.
#[async_trait]
pub trait LedgerRepository: Send + Sync {
    /// Insert `entry` unless its (billed company, data sourcing) key exists.
    /// Returns true if a row was inserted.
    async fn insert_billed_entry_if_absent(
        &self,
        entry: &BilledLedgerEntry,
    ) -> Result<bool, RepositoryError>;

    /// Delete the entry for the key if present. Returns true if a row was
    /// deleted.
    async fn delete_billed_entry_if_present(
        &self,
        billed_company_id: CompanyId,
        data_sourcing_id: DataSourcingId,
    ) -> Result<bool, RepositoryError>;

    async fn billed_entries_for_company(
        &self,
        company: CompanyId,
    ) -> Result<Vec<BilledLedgerEntry>, RepositoryError>;

    /// Number of organizations billed for one unit.
    async fn billed_entry_count(
        &self,
        data_sourcing_id: DataSourcingId,
    ) -> Result<usize, RepositoryError>;

    async fn append_transaction(
        &self,
        transaction: &CreditsTransaction,
    ) -> Result<(), RepositoryError>;

    /// Transactions of `company`, oldest first.
    async fn transactions_for_company(
        &self,
        company: CompanyId,
    ) -> Result<Vec<CreditsTransaction>, RepositoryError>;
}

/// Storage for messages the channel gave up on.
#[async_trait]
pub trait DeadLetterRepository: Send + Sync {
    async fn record_dead_letter(&self, letter: &DeadLetter) -> Result<(), RepositoryError>;

    /// Dead letters, oldest first.
    async fn dead_letters(&self) -> Result<Vec<DeadLetter>, RepositoryError>;
}

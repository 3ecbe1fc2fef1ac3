//! SQLite implementation of the repository traits.
//!
//! This provides persistent storage that survives service restarts.
//!
//! # Schema Versioning
//!
//! The database has a `schema_version` table that tracks the schema version.
//! When the schema needs to change, increment `CURRENT_SCHEMA_VERSION` and add
//! a migration in `run_migrations()`. Migrations run sequentially from the
//! current version to the target version.
//!
//! # Uniqueness
//!
//! Two partial unique indexes carry the storage-level invariants: one active
//! (Open or Processing) request per user and triple, and one non-terminal
//! data sourcing unit per triple. Violations surface as
//! `RepositoryError::Conflict`.

mod ledger;
mod sourcing;


use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use serde::de::DeserializeOwned;
use sourcing_core::{CompanyId, DataSourcingId, RequestId, SourcingTriple};
use tracing::warn;
use uuid::Uuid;

use super::{
    Commit, DeadLetterRepository, LedgerRepository, OutboxMessage, OutboxRepository,
    RepositoryError, RequestQuery, SourcingRepository,
};
use crate::ledger::{BilledLedgerEntry, CreditsTransaction};
use crate::messaging::DeadLetter;
use crate::state_machine::state::{
    DataSourcing, DataSourcingRevision, Request, RequestRevision,
};

/// Current schema version. Increment this when making schema changes and add
/// corresponding migration logic in `run_migrations()`.
const CURRENT_SCHEMA_VERSION: i64 = 4;

/// SQLite-backed repository.
///
/// Uses `tokio::task::spawn_blocking` to run synchronous rusqlite operations
/// without blocking the async runtime.
pub struct SqliteRepository {
    pub(crate) conn: Arc<Mutex<Connection>>,
}

impl SqliteRepository {
    /// Open (or create) the database at `path` and run pending migrations.
    ///
    /// # Durability
    ///
    /// The database is configured with:
    /// - `journal_mode = WAL` for better concurrency and crash safety
    /// - `synchronous = FULL` so committed transitions survive power loss
    /// - `busy_timeout = 5000ms` to handle concurrent access gracefully
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, RepositoryError> {
        let path_ref = path.as_ref();
        let path_str = path_ref.to_string_lossy();
        let is_in_memory = path_str == ":memory:";

        if !is_in_memory && !path_str.is_empty() {
            if let Some(parent) = path_ref.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        RepositoryError::storage(
                            "create database directory",
                            format!("{}: {}", parent.display(), e),
                        )
                    })?;
                }
            }
        }

        let conn = Connection::open(path_ref)
            .map_err(|e| RepositoryError::storage("open database", e.to_string()))?;

        // SQLite can silently keep DELETE mode on filesystems without shared
        // memory support, so check what we actually got. In-memory databases
        // report "memory".
        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))
            .map_err(|e| RepositoryError::storage("set journal_mode", e.to_string()))?;

        let journal_mode_ok = journal_mode.eq_ignore_ascii_case("wal")
            || (is_in_memory && journal_mode.eq_ignore_ascii_case("memory"));

        if !journal_mode_ok {
            return Err(RepositoryError::storage(
                "configure journal_mode",
                format!(
                    "Failed to enable WAL mode: SQLite returned '{}' instead of 'wal'",
                    journal_mode
                ),
            ));
        }

        conn.execute_batch(
            r#"
            PRAGMA synchronous = FULL;
            PRAGMA busy_timeout = 5000;
            "#,
        )
        .map_err(|e| RepositoryError::storage("configure pragmas", e.to_string()))?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS schema_version (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                version INTEGER NOT NULL
            );
            "#,
        )
        .map_err(|e| RepositoryError::storage("create schema_version table", e.to_string()))?;

        let current_version: i64 = conn
            .query_row(
                "SELECT version FROM schema_version WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| RepositoryError::storage("get schema version", e.to_string()))?
            .unwrap_or(0);

        Self::run_migrations(&conn, current_version)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create a new in-memory SQLite repository (for testing).
    pub fn new_in_memory() -> Result<Self, RepositoryError> {
        Self::new(":memory:")
    }

    /// Run migrations from `from_version` to `CURRENT_SCHEMA_VERSION`.
    fn run_migrations(conn: &Connection, from_version: i64) -> Result<(), RepositoryError> {
        if from_version > CURRENT_SCHEMA_VERSION {
            return Err(RepositoryError::storage(
                "schema version",
                format!(
                    "Database schema version {} is newer than supported version {}. \
                     Please upgrade the application.",
                    from_version, CURRENT_SCHEMA_VERSION
                ),
            ));
        }

        if from_version == CURRENT_SCHEMA_VERSION {
            return Ok(());
        }

        // Version 1: requests, data sourcing units, revision logs and outbox.
        if from_version < 1 {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS requests (
                    id TEXT PRIMARY KEY,
                    user_id TEXT NOT NULL,
                    company_id TEXT NOT NULL,
                    framework TEXT NOT NULL,
                    reporting_period TEXT NOT NULL,
                    state TEXT NOT NULL,
                    data_sourcing_id TEXT,
                    request_json TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE UNIQUE INDEX IF NOT EXISTS idx_requests_active_per_user
                    ON requests(user_id, company_id, framework, reporting_period)
                    WHERE state IN ('Open', 'Processing');
                CREATE INDEX IF NOT EXISTS idx_requests_data_sourcing
                    ON requests(data_sourcing_id) WHERE data_sourcing_id IS NOT NULL;

                CREATE TABLE IF NOT EXISTS data_sourcings (
                    id TEXT PRIMARY KEY,
                    company_id TEXT NOT NULL,
                    framework TEXT NOT NULL,
                    reporting_period TEXT NOT NULL,
                    state TEXT NOT NULL,
                    priority INTEGER NOT NULL,
                    document_collector TEXT,
                    data_extractor TEXT,
                    data_sourcing_json TEXT NOT NULL,
                    last_modified_at TEXT NOT NULL
                );

                CREATE UNIQUE INDEX IF NOT EXISTS idx_data_sourcings_active_triple
                    ON data_sourcings(company_id, framework, reporting_period)
                    WHERE state NOT IN ('Done', 'NonSourceable');
                CREATE INDEX IF NOT EXISTS idx_data_sourcings_triple
                    ON data_sourcings(company_id, framework, reporting_period);
                CREATE INDEX IF NOT EXISTS idx_data_sourcings_collector
                    ON data_sourcings(document_collector) WHERE document_collector IS NOT NULL;
                CREATE INDEX IF NOT EXISTS idx_data_sourcings_extractor
                    ON data_sourcings(data_extractor) WHERE data_extractor IS NOT NULL;

                CREATE TABLE IF NOT EXISTS request_revisions (
                    revision INTEGER PRIMARY KEY AUTOINCREMENT,
                    request_id TEXT NOT NULL,
                    snapshot_json TEXT NOT NULL,
                    recorded_at TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_request_revisions_lookup
                    ON request_revisions(request_id, revision);

                CREATE TABLE IF NOT EXISTS data_sourcing_revisions (
                    revision INTEGER PRIMARY KEY AUTOINCREMENT,
                    data_sourcing_id TEXT NOT NULL,
                    snapshot_json TEXT NOT NULL,
                    recorded_at TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_data_sourcing_revisions_lookup
                    ON data_sourcing_revisions(data_sourcing_id, revision);

                CREATE TABLE IF NOT EXISTS outbox (
                    seq INTEGER PRIMARY KEY AUTOINCREMENT,
                    message_id TEXT NOT NULL UNIQUE,
                    queue TEXT NOT NULL,
                    envelope_json TEXT NOT NULL,
                    dispatched INTEGER NOT NULL DEFAULT 0
                );
                CREATE INDEX IF NOT EXISTS idx_outbox_pending
                    ON outbox(dispatched) WHERE dispatched = 0;
                "#,
            )
            .map_err(|e| RepositoryError::storage("migration v1", e.to_string()))?;
        }

        // Version 2: billing ledger. The composite primary key is the
        // serialization point for concurrent reconciler actions.
        if from_version < 2 {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS billed_entries (
                    billed_company_id TEXT NOT NULL,
                    data_sourcing_id TEXT NOT NULL,
                    requested_company_id TEXT NOT NULL,
                    requested_framework TEXT NOT NULL,
                    requested_reporting_period TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    PRIMARY KEY (billed_company_id, data_sourcing_id)
                );
                CREATE INDEX IF NOT EXISTS idx_billed_entries_data_sourcing
                    ON billed_entries(data_sourcing_id);

                CREATE TABLE IF NOT EXISTS credit_transactions (
                    seq INTEGER PRIMARY KEY AUTOINCREMENT,
                    id TEXT NOT NULL UNIQUE,
                    company_id TEXT NOT NULL,
                    amount TEXT NOT NULL,
                    reason TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_credit_transactions_company
                    ON credit_transactions(company_id, seq);
                "#,
            )
            .map_err(|e| RepositoryError::storage("migration v2", e.to_string()))?;
        }

        // Version 3: dead letters for the operator API.
        if from_version < 3 {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS dead_letters (
                    seq INTEGER PRIMARY KEY AUTOINCREMENT,
                    queue TEXT NOT NULL,
                    message_id TEXT NOT NULL,
                    letter_json TEXT NOT NULL,
                    dead_lettered_at TEXT NOT NULL
                );
                "#,
            )
            .map_err(|e| RepositoryError::storage("migration v3", e.to_string()))?;
        }

        // Version 4: optimistic concurrency. Rows written before this carry
        // version 0, which matches the serde default of their snapshots.
        if from_version < 4 {
            conn.execute_batch(
                r#"
                ALTER TABLE requests ADD COLUMN version INTEGER NOT NULL DEFAULT 0;
                ALTER TABLE data_sourcings ADD COLUMN version INTEGER NOT NULL DEFAULT 0;
                "#,
            )
            .map_err(|e| RepositoryError::storage("migration v4", e.to_string()))?;
        }

        conn.execute(
            "INSERT OR REPLACE INTO schema_version (id, version) VALUES (1, ?1)",
            params![CURRENT_SCHEMA_VERSION],
        )
        .map_err(|e| RepositoryError::storage("update schema version", e.to_string()))?;

        Ok(())
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, operation: &'static str, f: F) -> Result<T, RepositoryError>
    where
        F: FnOnce(&mut Connection) -> Result<T, RepositoryError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| {
                warn!("SQLite connection mutex poisoned during {}", operation);
                RepositoryError::storage(operation, "connection mutex poisoned")
            })?;
            f(&mut *guard)
        })
        .await
        .map_err(|e| RepositoryError::storage(operation, e.to_string()))?
    }
}

// =============================================================================
// Conversion helpers
// =============================================================================

/// Timestamps are stored as fixed-width RFC 3339 so text order is time order.
pub(super) fn timestamp_to_sql(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(super) fn timestamp_from_sql(value: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|_| RepositoryError::corruption(format!("timestamp '{}'", value)))
}

pub(super) fn from_json<T: DeserializeOwned>(
    json: &str,
    what: &'static str,
) -> Result<T, RepositoryError> {
    serde_json::from_str(json).map_err(|_| RepositoryError::corruption(what))
}

pub(super) fn to_json<T: serde::Serialize>(
    value: &T,
    operation: &'static str,
) -> Result<String, RepositoryError> {
    serde_json::to_string(value).map_err(|e| RepositoryError::storage(operation, e.to_string()))
}

pub(super) fn parse_uuid(value: &str, what: &'static str) -> Result<Uuid, RepositoryError> {
    Uuid::parse_str(value).map_err(|_| RepositoryError::corruption(what))
}

/// Map a rusqlite error, turning constraint violations into conflicts.
pub(super) fn write_error(operation: &'static str, err: rusqlite::Error) -> RepositoryError {
    match &err {
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.code == ErrorCode::ConstraintViolation =>
        {
            RepositoryError::conflict(format!("{}: {}", operation, err))
        }
        _ => RepositoryError::storage(operation, err.to_string()),
    }
}

pub(super) fn read_error(operation: &'static str) -> impl Fn(rusqlite::Error) -> RepositoryError {
    move |e| RepositoryError::storage(operation, e.to_string())
}

// =============================================================================
// Trait implementations
// =============================================================================

#[async_trait]
impl SourcingRepository for SqliteRepository {
    async fn get_request(&self, id: RequestId) -> Result<Option<Request>, RepositoryError> {
        self.get_request_impl(id).await
    }

    async fn find_requests(&self, query: &RequestQuery) -> Result<Vec<Request>, RepositoryError> {
        self.find_requests_impl(query.clone()).await
    }

    async fn requests_for_data_sourcing(
        &self,
        id: DataSourcingId,
    ) -> Result<Vec<Request>, RepositoryError> {
        self.requests_for_data_sourcing_impl(id).await
    }

    async fn get_data_sourcing(
        &self,
        id: DataSourcingId,
    ) -> Result<Option<DataSourcing>, RepositoryError> {
        self.get_data_sourcing_impl(id).await
    }

    async fn find_active_data_sourcing(
        &self,
        triple: &SourcingTriple,
    ) -> Result<Option<DataSourcing>, RepositoryError> {
        self.find_active_data_sourcing_impl(triple.clone()).await
    }

    async fn assigned_data_sourcings(
        &self,
        company: CompanyId,
    ) -> Result<Vec<DataSourcing>, RepositoryError> {
        self.assigned_data_sourcings_impl(company).await
    }

    async fn priorities_by_triples(
        &self,
        triples: &[SourcingTriple],
    ) -> Result<Vec<(SourcingTriple, i32)>, RepositoryError> {
        self.priorities_by_triples_impl(triples.to_vec()).await
    }

    async fn data_sourcing_history(
        &self,
        id: DataSourcingId,
    ) -> Result<Vec<DataSourcingRevision>, RepositoryError> {
        self.data_sourcing_history_impl(id).await
    }

    async fn request_history(
        &self,
        id: RequestId,
    ) -> Result<Vec<RequestRevision>, RepositoryError> {
        self.request_history_impl(id).await
    }

    async fn commit(&self, commit: Commit) -> Result<Vec<DataSourcing>, RepositoryError> {
        self.commit_impl(commit).await
    }
}

#[async_trait]
impl OutboxRepository for SqliteRepository {
    async fn pending_outbox(&self) -> Result<Vec<OutboxMessage>, RepositoryError> {
        self.pending_outbox_impl().await
    }

    async fn mark_dispatched(&self, message_id: Uuid) -> Result<(), RepositoryError> {
        self.mark_dispatched_impl(message_id).await
    }
}

#[async_trait]
impl LedgerRepository for SqliteRepository {
    async fn insert_billed_entry_if_absent(
        &self,
        entry: &BilledLedgerEntry,
    ) -> Result<bool, RepositoryError> {
        self.insert_billed_entry_impl(entry.clone()).await
    }

    async fn delete_billed_entry_if_present(
        &self,
        billed_company_id: CompanyId,
        data_sourcing_id: DataSourcingId,
    ) -> Result<bool, RepositoryError> {
        self.delete_billed_entry_impl(billed_company_id, data_sourcing_id)
            .await
    }

    async fn billed_entries_for_company(
        &self,
        company: CompanyId,
    ) -> Result<Vec<BilledLedgerEntry>, RepositoryError> {
        self.billed_entries_for_company_impl(company).await
    }

    async fn billed_entry_count(
        &self,
        data_sourcing_id: DataSourcingId,
    ) -> Result<usize, RepositoryError> {
        self.billed_entry_count_impl(data_sourcing_id).await
    }

    async fn append_transaction(
        &self,
        transaction: &CreditsTransaction,
    ) -> Result<(), RepositoryError> {
        self.append_transaction_impl(transaction.clone()).await
    }

    async fn transactions_for_company(
        &self,
        company: CompanyId,
    ) -> Result<Vec<CreditsTransaction>, RepositoryError> {
        self.transactions_for_company_impl(company).await
    }
}

#[async_trait]
impl DeadLetterRepository for SqliteRepository {
    async fn record_dead_letter(&self, letter: &DeadLetter) -> Result<(), RepositoryError> {
        self.record_dead_letter_impl(letter.clone()).await
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>, RepositoryError> {
        self.dead_letters_impl().await
    }
}

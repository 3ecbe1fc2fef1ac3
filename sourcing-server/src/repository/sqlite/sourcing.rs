//! Request, data sourcing and outbox operations for the SQLite repository.
//!
//! Entities are stored as JSON snapshots next to the indexed columns that
//! queries and the uniqueness indexes need. Every write appends a revision
//! row inside the same transaction.

use std::collections::BTreeSet;

use rusqlite::{params, Connection, OptionalExtension};
use sourcing_core::{CompanyId, DataSourcingId, RequestId, SourcingTriple};
use uuid::Uuid;

use super::super::{
    next_version, Commit, DataSourcingWrite, OutboxMessage, RepositoryError, RequestQuery,
    RequestWrite,
};
use super::{
    from_json, parse_uuid, read_error, timestamp_from_sql, timestamp_to_sql, to_json, write_error,
    SqliteRepository,
};
use crate::state_machine::state::{
    DataSourcing, DataSourcingRevision, Request, RequestRevision,
};

const TERMINAL_STATES_SQL: &str = "('Done', 'NonSourceable')";

// =============================================================================
// Synchronous helpers (run inside spawn_blocking)
// =============================================================================

fn load_request(conn: &Connection, id: RequestId) -> Result<Option<Request>, RepositoryError> {
    let json: Option<String> = conn
        .query_row(
            "SELECT request_json FROM requests WHERE id = ?1",
            params![id.to_string()],
            |row| row.get(0),
        )
        .optional()
        .map_err(read_error("get_request"))?;
    json.map(|json| from_json(&json, "request JSON")).transpose()
}

fn load_data_sourcing(
    conn: &Connection,
    id: DataSourcingId,
) -> Result<Option<DataSourcing>, RepositoryError> {
    let json: Option<String> = conn
        .query_row(
            "SELECT data_sourcing_json FROM data_sourcings WHERE id = ?1",
            params![id.to_string()],
            |row| row.get(0),
        )
        .optional()
        .map_err(read_error("get_data_sourcing"))?;
    json.map(|json| from_json(&json, "data sourcing JSON"))
        .transpose()
}

/// Run a query returning one JSON column and decode every row.
fn query_json_rows<T: serde::de::DeserializeOwned>(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
    operation: &'static str,
    what: &'static str,
) -> Result<Vec<T>, RepositoryError> {
    let mut stmt = conn.prepare(sql).map_err(read_error(operation))?;
    let rows = stmt
        .query_map(params, |row| row.get::<_, String>(0))
        .map_err(read_error(operation))?
        .collect::<Result<Vec<String>, _>>()
        .map_err(read_error(operation))?;
    rows.iter().map(|json| from_json(json, what)).collect()
}

fn associated_request_ids(
    conn: &Connection,
    id: DataSourcingId,
) -> Result<BTreeSet<RequestId>, RepositoryError> {
    let mut stmt = conn
        .prepare("SELECT id FROM requests WHERE data_sourcing_id = ?1")
        .map_err(read_error("associated requests"))?;
    let ids = stmt
        .query_map(params![id.to_string()], |row| row.get::<_, String>(0))
        .map_err(read_error("associated requests"))?
        .collect::<Result<Vec<String>, _>>()
        .map_err(read_error("associated requests"))?;
    ids.iter()
        .map(|id| parse_uuid(id, "request id").map(RequestId))
        .collect()
}

fn write_request(conn: &Connection, write: &RequestWrite) -> Result<(), RepositoryError> {
    let mut request = write.request.clone();
    request.version = next_version(write.expected);
    let json = to_json(&request, "serialize request")?;
    let data_sourcing_id = request.data_sourcing_id.map(|id| id.to_string());

    match write.expected {
        None => {
            conn.execute(
                "INSERT INTO requests (id, user_id, company_id, framework, reporting_period,
                                       state, data_sourcing_id, request_json, created_at,
                                       version)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    request.id.to_string(),
                    request.user_id.to_string(),
                    request.triple.company_id.to_string(),
                    request.triple.framework.as_str(),
                    request.triple.reporting_period.as_str(),
                    request.state.as_str(),
                    data_sourcing_id,
                    json,
                    timestamp_to_sql(&request.created_at),
                    request.version,
                ],
            )
            .map_err(|e| write_error("insert request", e))?;
        }
        Some(expected) => {
            let changed = conn
                .execute(
                    "UPDATE requests
                     SET state = ?1, data_sourcing_id = ?2, request_json = ?3, version = ?4
                     WHERE id = ?5 AND version = ?6",
                    params![
                        request.state.as_str(),
                        data_sourcing_id,
                        json,
                        request.version,
                        request.id.to_string(),
                        expected,
                    ],
                )
                .map_err(|e| write_error("update request", e))?;
            if changed == 0 {
                return Err(RepositoryError::conflict(format!(
                    "request {} is no longer at version {}",
                    request.id, expected
                )));
            }
        }
    }

    conn.execute(
        "INSERT INTO request_revisions (request_id, snapshot_json, recorded_at)
         VALUES (?1, ?2, ?3)",
        params![
            request.id.to_string(),
            json,
            timestamp_to_sql(&request.last_modified_at)
        ],
    )
    .map_err(|e| write_error("insert request revision", e))?;

    Ok(())
}

fn write_data_sourcing(
    conn: &Connection,
    write: &DataSourcingWrite,
) -> Result<DataSourcing, RepositoryError> {
    let mut unit = write.data_sourcing.clone();
    unit.version = next_version(write.expected);
    unit.associated_requests = associated_request_ids(conn, unit.id)?;

    let json = to_json(&unit, "serialize data sourcing")?;
    let collector = unit.document_collector.map(|id| id.to_string());
    let extractor = unit.data_extractor.map(|id| id.to_string());
    let modified = timestamp_to_sql(&unit.last_modified_at);

    match write.expected {
        None => {
            conn.execute(
                "INSERT INTO data_sourcings (id, company_id, framework, reporting_period, state,
                                             priority, document_collector, data_extractor,
                                             data_sourcing_json, last_modified_at, version)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    unit.id.to_string(),
                    unit.triple.company_id.to_string(),
                    unit.triple.framework.as_str(),
                    unit.triple.reporting_period.as_str(),
                    unit.state.as_str(),
                    unit.priority,
                    collector,
                    extractor,
                    json,
                    modified,
                    unit.version,
                ],
            )
            .map_err(|e| write_error("insert data sourcing", e))?;
        }
        Some(expected) => {
            let changed = conn
                .execute(
                    "UPDATE data_sourcings
                     SET state = ?1, priority = ?2, document_collector = ?3, data_extractor = ?4,
                         data_sourcing_json = ?5, last_modified_at = ?6, version = ?7
                     WHERE id = ?8 AND version = ?9",
                    params![
                        unit.state.as_str(),
                        unit.priority,
                        collector,
                        extractor,
                        json,
                        modified,
                        unit.version,
                        unit.id.to_string(),
                        expected,
                    ],
                )
                .map_err(|e| write_error("update data sourcing", e))?;
            if changed == 0 {
                return Err(RepositoryError::conflict(format!(
                    "data sourcing {} is no longer at version {}",
                    unit.id, expected
                )));
            }
        }
    }

    conn.execute(
        "INSERT INTO data_sourcing_revisions (data_sourcing_id, snapshot_json, recorded_at)
         VALUES (?1, ?2, ?3)",
        params![unit.id.to_string(), json, modified],
    )
    .map_err(|e| write_error("insert data sourcing revision", e))?;

    Ok(unit)
}

fn insert_outbox(conn: &Connection, message: &OutboxMessage) -> Result<(), RepositoryError> {
    let json = to_json(&message.envelope, "serialize envelope")?;
    conn.execute(
        "INSERT INTO outbox (message_id, queue, envelope_json, dispatched) VALUES (?1, ?2, ?3, 0)",
        params![message.message_id().to_string(), message.queue, json],
    )
    .map_err(|e| write_error("insert outbox message", e))?;
    Ok(())
}

// =============================================================================
// Async implementations
// =============================================================================

impl SqliteRepository {
    pub(super) async fn get_request_impl(
        &self,
        id: RequestId,
    ) -> Result<Option<Request>, RepositoryError> {
        self.with_conn("get_request", move |conn| load_request(conn, id))
            .await
    }

    pub(super) async fn find_requests_impl(
        &self,
        query: RequestQuery,
    ) -> Result<Vec<Request>, RepositoryError> {
        self.with_conn("find_requests", move |conn| {
            let framework = match &query.framework {
                sourcing_core::FrameworkFilter::Unrestricted => None,
                sourcing_core::FrameworkFilter::Specific(framework) => {
                    Some(framework.as_str().to_string())
                }
            };
            let candidates: Vec<Request> = query_json_rows(
                conn,
                "SELECT request_json FROM requests
                 WHERE (?1 IS NULL OR user_id = ?1)
                   AND (?2 IS NULL OR company_id = ?2)
                   AND (?3 IS NULL OR framework = ?3)
                   AND (?4 IS NULL OR reporting_period = ?4)
                 ORDER BY created_at, id",
                params![
                    query.user_id.map(|id| id.to_string()),
                    query.company_id.map(|id| id.to_string()),
                    framework,
                    query.reporting_period.as_ref().map(|p| p.as_str().to_string()),
                ],
                "find_requests",
                "request JSON",
            )?;
            Ok(candidates
                .into_iter()
                .filter(|request| query.matches(request))
                .collect())
        })
        .await
    }

    pub(super) async fn requests_for_data_sourcing_impl(
        &self,
        id: DataSourcingId,
    ) -> Result<Vec<Request>, RepositoryError> {
        self.with_conn("requests_for_data_sourcing", move |conn| {
            query_json_rows(
                conn,
                "SELECT request_json FROM requests WHERE data_sourcing_id = ?1
                 ORDER BY created_at, id",
                params![id.to_string()],
                "requests_for_data_sourcing",
                "request JSON",
            )
        })
        .await
    }

    pub(super) async fn get_data_sourcing_impl(
        &self,
        id: DataSourcingId,
    ) -> Result<Option<DataSourcing>, RepositoryError> {
        self.with_conn("get_data_sourcing", move |conn| {
            load_data_sourcing(conn, id)
        })
        .await
    }

    pub(super) async fn find_active_data_sourcing_impl(
        &self,
        triple: SourcingTriple,
    ) -> Result<Option<DataSourcing>, RepositoryError> {
        self.with_conn("find_active_data_sourcing", move |conn| {
            let sql = format!(
                "SELECT data_sourcing_json FROM data_sourcings
                 WHERE company_id = ?1 AND framework = ?2 AND reporting_period = ?3
                   AND state NOT IN {}",
                TERMINAL_STATES_SQL
            );
            let mut units: Vec<DataSourcing> = query_json_rows(
                conn,
                &sql,
                params![
                    triple.company_id.to_string(),
                    triple.framework.as_str(),
                    triple.reporting_period.as_str(),
                ],
                "find_active_data_sourcing",
                "data sourcing JSON",
            )?;
            Ok(units.pop())
        })
        .await
    }

    pub(super) async fn assigned_data_sourcings_impl(
        &self,
        company: CompanyId,
    ) -> Result<Vec<DataSourcing>, RepositoryError> {
        self.with_conn("assigned_data_sourcings", move |conn| {
            query_json_rows(
                conn,
                "SELECT data_sourcing_json FROM data_sourcings
                 WHERE document_collector = ?1 OR data_extractor = ?1
                 ORDER BY last_modified_at, id",
                params![company.to_string()],
                "assigned_data_sourcings",
                "data sourcing JSON",
            )
        })
        .await
    }

    pub(super) async fn priorities_by_triples_impl(
        &self,
        triples: Vec<SourcingTriple>,
    ) -> Result<Vec<(SourcingTriple, i32)>, RepositoryError> {
        self.with_conn("priorities_by_triples", move |conn| {
            let sql = format!(
                "SELECT priority FROM data_sourcings
                 WHERE company_id = ?1 AND framework = ?2 AND reporting_period = ?3
                 ORDER BY (state NOT IN {}) DESC, last_modified_at DESC
                 LIMIT 1",
                TERMINAL_STATES_SQL
            );
            let mut stmt = conn
                .prepare(&sql)
                .map_err(read_error("priorities_by_triples"))?;
            let mut out = Vec::new();
            for triple in triples {
                let priority: Option<i32> = stmt
                    .query_row(
                        params![
                            triple.company_id.to_string(),
                            triple.framework.as_str(),
                            triple.reporting_period.as_str(),
                        ],
                        |row| row.get(0),
                    )
                    .optional()
                    .map_err(read_error("priorities_by_triples"))?;
                if let Some(priority) = priority {
                    out.push((triple, priority));
                }
            }
            Ok(out)
        })
        .await
    }

    pub(super) async fn data_sourcing_history_impl(
        &self,
        id: DataSourcingId,
    ) -> Result<Vec<DataSourcingRevision>, RepositoryError> {
        self.with_conn("data_sourcing_history", move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT revision, snapshot_json, recorded_at FROM data_sourcing_revisions
                     WHERE data_sourcing_id = ?1 ORDER BY revision",
                )
                .map_err(read_error("data_sourcing_history"))?;
            let rows = stmt
                .query_map(params![id.to_string()], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })
                .map_err(read_error("data_sourcing_history"))?
                .collect::<Result<Vec<_>, _>>()
                .map_err(read_error("data_sourcing_history"))?;

            rows.into_iter()
                .map(|(revision, json, recorded_at)| {
                    Ok(DataSourcingRevision {
                        revision,
                        snapshot: from_json(&json, "data sourcing revision JSON")?,
                        recorded_at: timestamp_from_sql(&recorded_at)?,
                    })
                })
                .collect()
        })
        .await
    }

    pub(super) async fn request_history_impl(
        &self,
        id: RequestId,
    ) -> Result<Vec<RequestRevision>, RepositoryError> {
        self.with_conn("request_history", move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT revision, snapshot_json, recorded_at FROM request_revisions
                     WHERE request_id = ?1 ORDER BY revision",
                )
                .map_err(read_error("request_history"))?;
            let rows = stmt
                .query_map(params![id.to_string()], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })
                .map_err(read_error("request_history"))?
                .collect::<Result<Vec<_>, _>>()
                .map_err(read_error("request_history"))?;

            rows.into_iter()
                .map(|(revision, json, recorded_at)| {
                    Ok(RequestRevision {
                        revision,
                        snapshot: from_json(&json, "request revision JSON")?,
                        recorded_at: timestamp_from_sql(&recorded_at)?,
                    })
                })
                .collect()
        })
        .await
    }

    pub(super) async fn commit_impl(
        &self,
        commit: Commit,
    ) -> Result<Vec<DataSourcing>, RepositoryError> {
        self.with_conn("commit", move |conn| {
            // Dropping the transaction on an early return rolls it back.
            let tx = conn.transaction().map_err(read_error("begin commit"))?;

            for write in &commit.requests {
                write_request(&tx, write)?;
            }
            let mut stored = Vec::with_capacity(commit.data_sourcings.len());
            for write in &commit.data_sourcings {
                stored.push(write_data_sourcing(&tx, write)?);
            }
            for message in &commit.outbox {
                insert_outbox(&tx, message)?;
            }

            tx.commit().map_err(|e| write_error("commit", e))?;
            Ok(stored)
        })
        .await
    }

    pub(super) async fn pending_outbox_impl(&self) -> Result<Vec<OutboxMessage>, RepositoryError> {
        self.with_conn("pending_outbox", |conn| {
            let mut stmt = conn
                .prepare("SELECT queue, envelope_json FROM outbox WHERE dispatched = 0 ORDER BY seq")
                .map_err(read_error("pending_outbox"))?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })
                .map_err(read_error("pending_outbox"))?
                .collect::<Result<Vec<_>, _>>()
                .map_err(read_error("pending_outbox"))?;

            rows.into_iter()
                .map(|(queue, json)| {
                    Ok(OutboxMessage {
                        queue,
                        envelope: from_json(&json, "outbox envelope JSON")?,
                    })
                })
                .collect()
        })
        .await
    }

    pub(super) async fn mark_dispatched_impl(&self, message_id: Uuid) -> Result<(), RepositoryError> {
        self.with_conn("mark_dispatched", move |conn| {
            conn.execute(
                "UPDATE outbox SET dispatched = 1 WHERE message_id = ?1",
                params![message_id.to_string()],
            )
            .map_err(|e| write_error("mark_dispatched", e))?;
            Ok(())
        })
        .await
    }
}

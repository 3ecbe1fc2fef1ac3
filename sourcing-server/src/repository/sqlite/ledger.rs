//! Billing ledger and dead letter operations for the SQLite repository.
//!
//! Billed entry writes are single conditional statements on the composite
//! key, so redelivered or concurrent reconciler actions need no locking:
//! - `INSERT OR IGNORE` creates the entry only if absent
//! - `DELETE ... WHERE key` removes it only if present

use std::str::FromStr;

use rusqlite::params;
use rust_decimal::Decimal;
use sourcing_core::{CompanyId, DataSourcingId, TransactionId};

use super::super::RepositoryError;
use super::{
    from_json, parse_uuid, read_error, timestamp_from_sql, timestamp_to_sql, to_json, write_error,
    SqliteRepository,
};
use crate::ledger::{BilledLedgerEntry, CreditsTransaction};
use crate::messaging::DeadLetter;

impl SqliteRepository {
    pub(super) async fn insert_billed_entry_impl(
        &self,
        entry: BilledLedgerEntry,
    ) -> Result<bool, RepositoryError> {
        self.with_conn("insert_billed_entry", move |conn| {
            let inserted = conn
                .execute(
                    "INSERT OR IGNORE INTO billed_entries
                        (billed_company_id, data_sourcing_id, requested_company_id,
                         requested_framework, requested_reporting_period, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        entry.billed_company_id.to_string(),
                        entry.data_sourcing_id.to_string(),
                        entry.requested_company_id.to_string(),
                        entry.requested_framework.as_str(),
                        entry.requested_reporting_period.as_str(),
                        timestamp_to_sql(&entry.created_at),
                    ],
                )
                .map_err(|e| write_error("insert_billed_entry", e))?;
            Ok(inserted > 0)
        })
        .await
    }

    pub(super) async fn delete_billed_entry_impl(
        &self,
        billed_company_id: CompanyId,
        data_sourcing_id: DataSourcingId,
    ) -> Result<bool, RepositoryError> {
        self.with_conn("delete_billed_entry", move |conn| {
            let deleted = conn
                .execute(
                    "DELETE FROM billed_entries
                     WHERE billed_company_id = ?1 AND data_sourcing_id = ?2",
                    params![billed_company_id.to_string(), data_sourcing_id.to_string()],
                )
                .map_err(|e| write_error("delete_billed_entry", e))?;
            Ok(deleted > 0)
        })
        .await
    }

    pub(super) async fn billed_entries_for_company_impl(
        &self,
        company: CompanyId,
    ) -> Result<Vec<BilledLedgerEntry>, RepositoryError> {
        self.with_conn("billed_entries_for_company", move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT billed_company_id, data_sourcing_id, requested_company_id,
                            requested_framework, requested_reporting_period, created_at
                     FROM billed_entries
                     WHERE billed_company_id = ?1
                     ORDER BY created_at, data_sourcing_id",
                )
                .map_err(read_error("billed_entries_for_company"))?;
            let rows = stmt
                .query_map(params![company.to_string()], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                })
                .map_err(read_error("billed_entries_for_company"))?
                .collect::<Result<Vec<_>, _>>()
                .map_err(read_error("billed_entries_for_company"))?;

            rows.into_iter()
                .map(|(billed, ds, requested, framework, period, created_at)| {
                    Ok(BilledLedgerEntry {
                        billed_company_id: CompanyId(parse_uuid(&billed, "billed company id")?),
                        data_sourcing_id: DataSourcingId(parse_uuid(&ds, "data sourcing id")?),
                        requested_company_id: CompanyId(parse_uuid(
                            &requested,
                            "requested company id",
                        )?),
                        requested_framework: framework.into(),
                        requested_reporting_period: period.into(),
                        created_at: timestamp_from_sql(&created_at)?,
                    })
                })
                .collect()
        })
        .await
    }

    pub(super) async fn billed_entry_count_impl(
        &self,
        data_sourcing_id: DataSourcingId,
    ) -> Result<usize, RepositoryError> {
        self.with_conn("billed_entry_count", move |conn| {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM billed_entries WHERE data_sourcing_id = ?1",
                    params![data_sourcing_id.to_string()],
                    |row| row.get(0),
                )
                .map_err(read_error("billed_entry_count"))?;
            usize::try_from(count)
                .map_err(|_| RepositoryError::corruption(format!("billed entry count {}", count)))
        })
        .await
    }

    pub(super) async fn append_transaction_impl(
        &self,
        transaction: CreditsTransaction,
    ) -> Result<(), RepositoryError> {
        self.with_conn("append_transaction", move |conn| {
            conn.execute(
                "INSERT INTO credit_transactions (id, company_id, amount, reason, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    transaction.id.to_string(),
                    transaction.company_id.to_string(),
                    transaction.amount.to_string(),
                    transaction.reason,
                    timestamp_to_sql(&transaction.created_at),
                ],
            )
            .map_err(|e| write_error("append_transaction", e))?;
            Ok(())
        })
        .await
    }

    pub(super) async fn transactions_for_company_impl(
        &self,
        company: CompanyId,
    ) -> Result<Vec<CreditsTransaction>, RepositoryError> {
        self.with_conn("transactions_for_company", move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, amount, reason, created_at FROM credit_transactions
                     WHERE company_id = ?1 ORDER BY seq",
                )
                .map_err(read_error("transactions_for_company"))?;
            let rows = stmt
                .query_map(params![company.to_string()], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                })
                .map_err(read_error("transactions_for_company"))?
                .collect::<Result<Vec<_>, _>>()
                .map_err(read_error("transactions_for_company"))?;

            rows.into_iter()
                .map(|(id, amount, reason, created_at)| {
                    Ok(CreditsTransaction {
                        id: TransactionId(parse_uuid(&id, "transaction id")?),
                        company_id: company,
                        amount: Decimal::from_str(&amount).map_err(|_| {
                            RepositoryError::corruption(format!("amount '{}'", amount))
                        })?,
                        reason,
                        created_at: timestamp_from_sql(&created_at)?,
                    })
                })
                .collect()
        })
        .await
    }

    pub(super) async fn record_dead_letter_impl(
        &self,
        letter: DeadLetter,
    ) -> Result<(), RepositoryError> {
        let json = to_json(&letter, "serialize dead letter")?;
        self.with_conn("record_dead_letter", move |conn| {
            conn.execute(
                "INSERT INTO dead_letters (queue, message_id, letter_json, dead_lettered_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    letter.queue,
                    letter.envelope.message_id.to_string(),
                    json,
                    timestamp_to_sql(&letter.dead_lettered_at),
                ],
            )
            .map_err(|e| write_error("record_dead_letter", e))?;
            Ok(())
        })
        .await
    }

    pub(super) async fn dead_letters_impl(&self) -> Result<Vec<DeadLetter>, RepositoryError> {
        self.with_conn("dead_letters", |conn| {
            let mut stmt = conn
                .prepare("SELECT letter_json FROM dead_letters ORDER BY seq")
                .map_err(read_error("dead_letters"))?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(read_error("dead_letters"))?
                .collect::<Result<Vec<_>, _>>()
                .map_err(read_error("dead_letters"))?;
            rows.iter()
                .map(|json| from_json(json, "dead letter JSON"))
                .collect()
        })
        .await
    }
}

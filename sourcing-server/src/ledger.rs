//! Credits ledger.
//!
//! Balances are recomputed on every read from posted transactions and the
//! billed entries maintained by the reconciler. Nothing is cached.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sourcing_core::{
    CompanyId, DataSourcingId, Framework, ReportingPeriod, TransactionId,
};
use tracing::info;

use crate::error::SourcingError;
use crate::repository::{LedgerRepository, RepositoryError};

/// One organization billed for one data sourcing unit.
///
/// Identity is the (billed company, data sourcing) pair; the remaining fields
/// are a snapshot taken when the entry was created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BilledLedgerEntry {
    pub billed_company_id: CompanyId,
    pub data_sourcing_id: DataSourcingId,
    pub requested_company_id: CompanyId,
    pub requested_framework: Framework,
    pub requested_reporting_period: ReportingPeriod,
    pub created_at: DateTime<Utc>,
}

/// An append-only credit movement. Positive amounts add credits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreditsTransaction {
    pub id: TransactionId,
    pub company_id: CompanyId,
    pub amount: Decimal,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

/// Round to one fractional digit, halves toward positive infinity.
///
/// `0.05` becomes `0.1` and `-0.05` becomes `0.0`.
pub fn round_balance(value: Decimal) -> Decimal {
    let ten = Decimal::TEN;
    let half = Decimal::new(5, 1);
    let mut rounded = (value * ten + half).floor() / ten;
    rounded.rescale(1);
    rounded
}

/// Balance queries and transaction posting.
pub struct CreditsLedger {
    repo: Arc<dyn LedgerRepository>,
    data_sourcing_cost: Decimal,
}

impl CreditsLedger {
    pub fn new(repo: Arc<dyn LedgerRepository>, data_sourcing_cost: Decimal) -> Self {
        Self {
            repo,
            data_sourcing_cost,
        }
    }

    /// Sum of transactions minus the implied debt of every billed entry.
    ///
    /// Each unit costs `data_sourcing_cost`, split evenly between all
    /// organizations billed for it.
    pub async fn balance(&self, company: CompanyId) -> Result<Decimal, RepositoryError> {
        let credited: Decimal = self
            .repo
            .transactions_for_company(company)
            .await?
            .iter()
            .map(|tx| tx.amount)
            .sum();

        let mut debt = Decimal::ZERO;
        for entry in self.repo.billed_entries_for_company(company).await? {
            let billed = self.repo.billed_entry_count(entry.data_sourcing_id).await?;
            // The entry itself is always counted; max(1) keeps a racing
            // delete from dividing by zero.
            let share = Decimal::from(billed.max(1) as u64);
            debt += self.data_sourcing_cost / share;
        }

        Ok(round_balance(credited - debt))
    }

    pub async fn post_transaction(
        &self,
        company: CompanyId,
        amount: Decimal,
        reason: impl Into<String>,
    ) -> Result<CreditsTransaction, SourcingError> {
        let reason = reason.into();
        if reason.trim().is_empty() {
            return Err(SourcingError::InvalidInput(
                "a transaction needs a reason".to_string(),
            ));
        }

        let transaction = CreditsTransaction {
            id: TransactionId::random(),
            company_id: company,
            amount,
            reason,
            created_at: Utc::now(),
        };
        self.repo.append_transaction(&transaction).await?;
        info!(
            "Posted transaction {} of {} for company {}",
            transaction.id, amount, company
        );
        Ok(transaction)
    }

    pub async fn transactions(
        &self,
        company: CompanyId,
    ) -> Result<Vec<CreditsTransaction>, RepositoryError> {
        self.repo.transactions_for_company(company).await
    }

    pub async fn billed_entries(
        &self,
        company: CompanyId,
    ) -> Result<Vec<BilledLedgerEntry>, RepositoryError> {
        self.repo.billed_entries_for_company(company).await
    }
}

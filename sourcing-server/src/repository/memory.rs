//! In-memory implementation of the repository traits.
//!
//! All data is held behind one `RwLock` and lost on restart. A commit is
//! applied to copies of the affected maps and swapped in only after every
//! guard held, which gives the same all-or-nothing behavior as the SQLite
//! transaction.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use sourcing_core::{CompanyId, DataSourcingId, RequestId, SourcingTriple};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    next_version, Commit, DeadLetterRepository, LedgerRepository, OutboxMessage,
    OutboxRepository, RepositoryError, RequestQuery, SourcingRepository,
};
use crate::ledger::{BilledLedgerEntry, CreditsTransaction};
use crate::messaging::DeadLetter;
use crate::state_machine::state::{
    DataSourcing, DataSourcingRevision, Request, RequestRevision,
};

#[derive(Default)]
struct Inner {
    requests: HashMap<RequestId, Request>,
    data_sourcings: HashMap<DataSourcingId, DataSourcing>,
    request_revisions: Vec<RequestRevision>,
    data_sourcing_revisions: Vec<DataSourcingRevision>,
    next_revision: i64,
    /// Outbox messages with their dispatched flag, in commit order.
    outbox: Vec<(OutboxMessage, bool)>,
    billed: BTreeMap<(CompanyId, DataSourcingId), BilledLedgerEntry>,
    transactions: Vec<CreditsTransaction>,
    dead_letters: Vec<DeadLetter>,
}

impl Inner {
    fn take_revision(&mut self) -> i64 {
        self.next_revision += 1;
        self.next_revision
    }
}

/// In-memory repository.
pub struct InMemoryRepository {
    inner: RwLock<Inner>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }
}

impl Default for InMemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

fn sorted_requests<'a>(requests: impl Iterator<Item = &'a Request>) -> Vec<Request> {
    let mut out: Vec<Request> = requests.cloned().collect();
    out.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
    out
}

#[async_trait]
impl SourcingRepository for InMemoryRepository {
    async fn get_request(&self, id: RequestId) -> Result<Option<Request>, RepositoryError> {
        let inner = self.inner.read().await;
        Ok(inner.requests.get(&id).cloned())
    }

    async fn find_requests(&self, query: &RequestQuery) -> Result<Vec<Request>, RepositoryError> {
        let inner = self.inner.read().await;
        Ok(sorted_requests(
            inner.requests.values().filter(|r| query.matches(r)),
        ))
    }

    async fn requests_for_data_sourcing(
        &self,
        id: DataSourcingId,
    ) -> Result<Vec<Request>, RepositoryError> {
        let inner = self.inner.read().await;
        Ok(sorted_requests(
            inner
                .requests
                .values()
                .filter(|r| r.data_sourcing_id == Some(id)),
        ))
    }

    async fn get_data_sourcing(
        &self,
        id: DataSourcingId,
    ) -> Result<Option<DataSourcing>, RepositoryError> {
        let inner = self.inner.read().await;
        Ok(inner.data_sourcings.get(&id).cloned())
    }

    async fn find_active_data_sourcing(
        &self,
        triple: &SourcingTriple,
    ) -> Result<Option<DataSourcing>, RepositoryError> {
        let inner = self.inner.read().await;
        Ok(inner
            .data_sourcings
            .values()
            .find(|ds| &ds.triple == triple && !ds.state.is_terminal())
            .cloned())
    }

    async fn assigned_data_sourcings(
        &self,
        company: CompanyId,
    ) -> Result<Vec<DataSourcing>, RepositoryError> {
        let inner = self.inner.read().await;
        let mut out: Vec<DataSourcing> = inner
            .data_sourcings
            .values()
            .filter(|ds| ds.is_assigned_to(company))
            .cloned()
            .collect();
        out.sort_by_key(|ds| (ds.last_modified_at, ds.id));
        Ok(out)
    }

    async fn priorities_by_triples(
        &self,
        triples: &[SourcingTriple],
    ) -> Result<Vec<(SourcingTriple, i32)>, RepositoryError> {
        let inner = self.inner.read().await;
        let mut out = Vec::new();
        for triple in triples {
            let best = inner
                .data_sourcings
                .values()
                .filter(|ds| &ds.triple == triple)
                .max_by_key(|ds| (!ds.state.is_terminal(), ds.last_modified_at));
            if let Some(ds) = best {
                out.push((triple.clone(), ds.priority));
            }
        }
        Ok(out)
    }

    async fn data_sourcing_history(
        &self,
        id: DataSourcingId,
    ) -> Result<Vec<DataSourcingRevision>, RepositoryError> {
        let inner = self.inner.read().await;
        Ok(inner
            .data_sourcing_revisions
            .iter()
            .filter(|rev| rev.snapshot.id == id)
            .cloned()
            .collect())
    }

    async fn request_history(
        &self,
        id: RequestId,
    ) -> Result<Vec<RequestRevision>, RepositoryError> {
        let inner = self.inner.read().await;
        Ok(inner
            .request_revisions
            .iter()
            .filter(|rev| rev.snapshot.id == id)
            .cloned()
            .collect())
    }

    async fn commit(&self, commit: Commit) -> Result<Vec<DataSourcing>, RepositoryError> {
        let mut inner = self.inner.write().await;

        let mut requests = inner.requests.clone();
        let mut written_requests = Vec::with_capacity(commit.requests.len());
        for write in &commit.requests {
            let id = write.request.id;
            match (write.expected, requests.get(&id)) {
                (None, Some(_)) => {
                    return Err(RepositoryError::conflict(format!(
                        "request {} already exists",
                        id
                    )))
                }
                (Some(expected), Some(stored)) if stored.version != expected => {
                    return Err(RepositoryError::conflict(format!(
                        "request {} is at version {} but {} was expected",
                        id, stored.version, expected
                    )))
                }
                (Some(_), None) => {
                    return Err(RepositoryError::conflict(format!(
                        "request {} does not exist",
                        id
                    )))
                }
                _ => {}
            }
            let mut request = write.request.clone();
            request.version = next_version(write.expected);
            requests.insert(id, request.clone());
            written_requests.push(request);
        }

        for written in &written_requests {
            if !written.state.is_active() {
                continue;
            }
            let duplicate = requests.values().any(|other| {
                other.id != written.id
                    && other.state.is_active()
                    && other.user_id == written.user_id
                    && other.triple == written.triple
            });
            if duplicate {
                return Err(RepositoryError::conflict(format!(
                    "user {} already has an active request for {}",
                    written.user_id, written.triple
                )));
            }
        }

        let mut data_sourcings = inner.data_sourcings.clone();
        let mut stored_units = Vec::with_capacity(commit.data_sourcings.len());
        for write in &commit.data_sourcings {
            let id = write.data_sourcing.id;
            match (write.expected, data_sourcings.get(&id)) {
                (None, Some(_)) => {
                    return Err(RepositoryError::conflict(format!(
                        "data sourcing {} already exists",
                        id
                    )))
                }
                (Some(expected), Some(stored)) if stored.version != expected => {
                    return Err(RepositoryError::conflict(format!(
                        "data sourcing {} is at version {} but {} was expected",
                        id, stored.version, expected
                    )))
                }
                (Some(_), None) => {
                    return Err(RepositoryError::conflict(format!(
                        "data sourcing {} does not exist",
                        id
                    )))
                }
                _ => {}
            }

            let mut unit = write.data_sourcing.clone();
            unit.version = next_version(write.expected);
            unit.associated_requests = requests
                .values()
                .filter(|r| r.data_sourcing_id == Some(id))
                .map(|r| r.id)
                .collect();

            if !unit.state.is_terminal() {
                let clash = data_sourcings.values().any(|other| {
                    other.id != id && other.triple == unit.triple && !other.state.is_terminal()
                });
                if clash {
                    return Err(RepositoryError::conflict(format!(
                        "another non-terminal data sourcing exists for {}",
                        unit.triple
                    )));
                }
            }

            data_sourcings.insert(id, unit.clone());
            stored_units.push(unit);
        }

        // Every guard held; apply.
        inner.requests = requests;
        inner.data_sourcings = data_sourcings;
        for request in written_requests {
            let revision = inner.take_revision();
            inner.request_revisions.push(RequestRevision {
                revision,
                recorded_at: request.last_modified_at,
                snapshot: request,
            });
        }
        for unit in &stored_units {
            let revision = inner.take_revision();
            inner.data_sourcing_revisions.push(DataSourcingRevision {
                revision,
                recorded_at: unit.last_modified_at,
                snapshot: unit.clone(),
            });
        }
        for message in commit.outbox {
            inner.outbox.push((message, false));
        }

        Ok(stored_units)
    }
}

#[async_trait]
impl OutboxRepository for InMemoryRepository {
    async fn pending_outbox(&self) -> Result<Vec<OutboxMessage>, RepositoryError> {
        let inner = self.inner.read().await;
        Ok(inner
            .outbox
            .iter()
            .filter(|(_, dispatched)| !dispatched)
            .map(|(message, _)| message.clone())
            .collect())
    }

    async fn mark_dispatched(&self, message_id: Uuid) -> Result<(), RepositoryError> {
        let mut inner = self.inner.write().await;
        for (message, dispatched) in inner.outbox.iter_mut() {
            if message.message_id() == message_id {
                *dispatched = true;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerRepository for InMemoryRepository {
    async fn insert_billed_entry_if_absent(
        &self,
        entry: &BilledLedgerEntry,
    ) -> Result<bool, RepositoryError> {
        let mut inner = self.inner.write().await;
        let key = (entry.billed_company_id, entry.data_sourcing_id);
        if inner.billed.contains_key(&key) {
            return Ok(false);
        }
        inner.billed.insert(key, entry.clone());
        Ok(true)
    }

    async fn delete_billed_entry_if_present(
        &self,
        billed_company_id: CompanyId,
        data_sourcing_id: DataSourcingId,
    ) -> Result<bool, RepositoryError> {
        let mut inner = self.inner.write().await;
        Ok(inner
            .billed
            .remove(&(billed_company_id, data_sourcing_id))
            .is_some())
    }

    async fn billed_entries_for_company(
        &self,
        company: CompanyId,
    ) -> Result<Vec<BilledLedgerEntry>, RepositoryError> {
        let inner = self.inner.read().await;
        let mut out: Vec<BilledLedgerEntry> = inner
            .billed
            .values()
            .filter(|entry| entry.billed_company_id == company)
            .cloned()
            .collect();
        out.sort_by_key(|entry| (entry.created_at, entry.data_sourcing_id));
        Ok(out)
    }

    async fn billed_entry_count(
        &self,
        data_sourcing_id: DataSourcingId,
    ) -> Result<usize, RepositoryError> {
        let inner = self.inner.read().await;
        Ok(inner
            .billed
            .keys()
            .filter(|(_, ds)| *ds == data_sourcing_id)
            .count())
    }

    async fn append_transaction(
        &self,
        transaction: &CreditsTransaction,
    ) -> Result<(), RepositoryError> {
        let mut inner = self.inner.write().await;
        inner.transactions.push(transaction.clone());
        Ok(())
    }

    async fn transactions_for_company(
        &self,
        company: CompanyId,
    ) -> Result<Vec<CreditsTransaction>, RepositoryError> {
        let inner = self.inner.read().await;
        Ok(inner
            .transactions
            .iter()
            .filter(|tx| tx.company_id == company)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl DeadLetterRepository for InMemoryRepository {
    async fn record_dead_letter(&self, letter: &DeadLetter) -> Result<(), RepositoryError> {
        let mut inner = self.inner.write().await;
        inner.dead_letters.push(letter.clone());
        Ok(())
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>, RepositoryError> {
        let inner = self.inner.read().await;
        Ok(inner.dead_letters.clone())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use sourcing_core::UserId;

    use super::*;
    use crate::repository::{DataSourcingWrite, RequestWrite};
    use crate::state_machine::state::{DataSourcingState, RequestState, DEFAULT_PRIORITY};

    fn triple() -> SourcingTriple {
        SourcingTriple::new(CompanyId::random(), "sfdr", "2026")
    }

    fn insert_request(request: &Request) -> Commit {
        Commit {
            requests: vec![RequestWrite::insert(request.clone())],
            ..Commit::default()
        }
    }

    #[tokio::test]
    async fn test_request_insert_then_get() {
        let repo = InMemoryRepository::new();
        let request = Request::open(triple(), UserId::random(), None, Utc::now());
        repo.commit(insert_request(&request)).await.unwrap();

        let stored = repo.get_request(request.id).await.unwrap().unwrap();
        assert_eq!(stored.version, 1);
        assert_eq!(Request { version: 0, ..stored }, request);
        assert_eq!(repo.request_history(request.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_compare_and_set_rejects_stale_version() {
        let repo = InMemoryRepository::new();
        let request = Request::open(triple(), UserId::random(), None, Utc::now());
        repo.commit(insert_request(&request)).await.unwrap();
        let loaded = repo.get_request(request.id).await.unwrap().unwrap();

        let mut processing = loaded.clone();
        processing.state = RequestState::Processing;
        let write = RequestWrite::update(processing);
        repo.commit(Commit {
            requests: vec![write.clone()],
            ..Commit::default()
        })
        .await
        .unwrap();

        // Same write again: the stored request has moved past version 1.
        let err = repo
            .commit(Commit {
                requests: vec![write],
                ..Commit::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict { .. }));
        assert_eq!(repo.request_history(request.id).await.unwrap().len(), 2);
        assert_eq!(repo.get_request(request.id).await.unwrap().unwrap().version, 2);
    }

    #[tokio::test]
    async fn test_unit_write_from_stale_read_is_rejected_even_in_same_state() {
        let repo = InMemoryRepository::new();
        let unit = DataSourcing::initialized(triple(), Utc::now());
        repo.commit(Commit {
            data_sourcings: vec![DataSourcingWrite::insert(unit.clone())],
            ..Commit::default()
        })
        .await
        .unwrap();
        let loaded = repo.get_data_sourcing(unit.id).await.unwrap().unwrap();

        let mut documented = loaded.clone();
        documented.document_ids.insert("doc-1".to_string());
        let stored = repo
            .commit(Commit {
                data_sourcings: vec![DataSourcingWrite::update(documented)],
                ..Commit::default()
            })
            .await
            .unwrap();
        assert_eq!(stored[0].version, 2);

        // Still Initialized, but written from the version-1 read.
        let mut stale = loaded;
        stale.priority = 3;
        let err = repo
            .commit(Commit {
                data_sourcings: vec![DataSourcingWrite::update(stale)],
                ..Commit::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict { .. }));
        let current = repo.get_data_sourcing(unit.id).await.unwrap().unwrap();
        assert!(current.document_ids.contains("doc-1"));
        assert_eq!(current.priority, DEFAULT_PRIORITY);
    }

    #[tokio::test]
    async fn test_second_active_unit_for_triple_is_rejected_atomically() {
        let repo = InMemoryRepository::new();
        let triple = triple();
        let first = DataSourcing::initialized(triple.clone(), Utc::now());
        repo.commit(Commit {
            data_sourcings: vec![DataSourcingWrite::insert(first)],
            ..Commit::default()
        })
        .await
        .unwrap();

        let request = Request::open(triple.clone(), UserId::random(), None, Utc::now());
        let second = DataSourcing::initialized(triple.clone(), Utc::now());
        let err = repo
            .commit(Commit {
                requests: vec![RequestWrite::insert(request.clone())],
                data_sourcings: vec![DataSourcingWrite::insert(second)],
                ..Commit::default()
            })
            .await
            .unwrap_err();

        assert!(matches!(err, RepositoryError::Conflict { .. }));
        // The request half of the commit was not applied either.
        assert_eq!(repo.get_request(request.id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_terminal_unit_frees_the_triple() {
        let repo = InMemoryRepository::new();
        let triple = triple();
        let mut done = DataSourcing::initialized(triple.clone(), Utc::now());
        done.state = DataSourcingState::Done;
        let fresh = DataSourcing::initialized(triple.clone(), Utc::now());

        repo.commit(Commit {
            data_sourcings: vec![
                DataSourcingWrite::insert(done),
                DataSourcingWrite::insert(fresh.clone()),
            ],
            ..Commit::default()
        })
        .await
        .unwrap();

        let active = repo.find_active_data_sourcing(&triple).await.unwrap();
        assert_eq!(active.map(|ds| ds.id), Some(fresh.id));
    }

    #[tokio::test]
    async fn test_billed_entry_insert_and_delete_are_conditional() {
        let repo = InMemoryRepository::new();
        let entry = BilledLedgerEntry {
            billed_company_id: CompanyId::random(),
            data_sourcing_id: DataSourcingId::random(),
            requested_company_id: CompanyId::random(),
            requested_framework: "sfdr".into(),
            requested_reporting_period: "2026".into(),
            created_at: Utc::now(),
        };

        assert!(repo.insert_billed_entry_if_absent(&entry).await.unwrap());
        assert!(!repo.insert_billed_entry_if_absent(&entry).await.unwrap());
        assert_eq!(repo.billed_entry_count(entry.data_sourcing_id).await.unwrap(), 1);

        assert!(repo
            .delete_billed_entry_if_present(entry.billed_company_id, entry.data_sourcing_id)
            .await
            .unwrap());
        assert!(!repo
            .delete_billed_entry_if_present(entry.billed_company_id, entry.data_sourcing_id)
            .await
            .unwrap());
    }
}

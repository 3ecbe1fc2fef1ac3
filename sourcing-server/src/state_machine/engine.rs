//! State machine engine.
//!
//! Every operation follows the same shape: load the current state, run the
//! pure transition, turn the effects into one `Commit` (entity writes guarded
//! by compare-and-set, revision rows, outbox messages), apply it atomically,
//! and only then relay the outbox to the event channel and emit log effects.
//! Outbox rows stay pending after the relay; the consumer marks them
//! dispatched once it has settled the delivery.
//!
//! Entity writes are guarded on the version that was read. A commit that
//! loses a race (version check or a uniqueness index) is re-planned from
//! fresh state a bounded number of times. Re-planning runs the transition
//! again, so a request that moved on in the meantime fails with a state
//! conflict and a unit patched in the meantime keeps the patch.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sourcing_core::{
    CompanyId, DataSourcingId, DataSourcingSetToNonSourceable, Framework, ReportingPeriod,
    RequestId, RequestSetToProcessing, RequestSetToWithdrawn, SourcingTriple, TransitionMessage,
    UserId,
};
use tracing::{debug, info, warn};

use super::effect::{emit_log, Effect, LogLevel};
use super::state::{
    DataSourcing, DataSourcingRevision, DataSourcingState, Request, RequestPriority, RequestState,
};
use super::transition::{self, request_transition, TransitionResult};
use crate::error::SourcingError;
use crate::history::{build_request_history, RequestHistoryEntry};
use crate::messaging::EventChannel;
use crate::repository::{
    Commit, DataSourcingWrite, OutboxMessage, RepositoryError, RequestQuery, RequestWrite,
    SourcingRepository,
};

/// Attempts per operation before a lost race is reported as a conflict.
const MAX_COMMIT_ATTEMPTS: u32 = 3;

/// Administrative patch of a data sourcing unit. `None` leaves a field as is.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSourcingPatch {
    /// Applied with override semantics.
    pub state: Option<DataSourcingState>,
    pub document_ids: Option<BTreeSet<String>>,
    pub expected_publication_dates: Option<BTreeSet<NaiveDate>>,
    pub next_attempt_date: Option<NaiveDate>,
    pub document_collector: Option<CompanyId>,
    pub data_extractor: Option<CompanyId>,
    pub admin_comment: Option<String>,
    pub priority: Option<i32>,
}

impl DataSourcingPatch {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// Result of a bulk submission. Every triple of the product lands in
/// exactly one list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkRequestOutcome {
    /// Requests created by this submission.
    pub accepted: Vec<Request>,
    /// Triples with a blank framework or reporting period.
    pub invalid: Vec<SourcingTriple>,
    /// Triples the user already holds an Open or Processing request for.
    pub already_requested: Vec<SourcingTriple>,
}

/// Writes of one operation plus the log effects to emit once committed.
#[derive(Default)]
struct Plan {
    commit: Commit,
    logs: Vec<(LogLevel, String)>,
}

impl Plan {
    fn log(&mut self, level: LogLevel, message: impl Into<String>) {
        self.logs.push((level, message.into()));
    }
}

/// Drives requests and data sourcing units through their lifecycles.
pub struct SourcingEngine {
    repo: Arc<dyn SourcingRepository>,
    channel: Arc<dyn EventChannel>,
}

impl SourcingEngine {
    pub fn new(repo: Arc<dyn SourcingRepository>, channel: Arc<dyn EventChannel>) -> Self {
        Self { repo, channel }
    }

    // =========================================================================
    // Requests
    // =========================================================================

    /// Create an Open request.
    ///
    /// Fails with `DuplicateRequest` if the user already holds an Open or
    /// Processing request for the same triple.
    pub async fn submit_request(
        &self,
        user_id: UserId,
        triple: SourcingTriple,
        member_comment: Option<String>,
    ) -> Result<Request, SourcingError> {
        if triple.framework.as_str().trim().is_empty()
            || triple.reporting_period.as_str().trim().is_empty()
        {
            return Err(SourcingError::InvalidInput(format!(
                "framework and reporting period are required, got {}",
                triple
            )));
        }

        if let Some(existing) = self.active_request(user_id, &triple).await? {
            return Err(SourcingError::DuplicateRequest {
                user_id,
                existing: existing.id,
                triple,
            });
        }

        let member_comment = member_comment.filter(|comment| !comment.trim().is_empty());
        let write = RequestWrite::insert(Request::open(triple, user_id, member_comment, Utc::now()));
        let request = write.request.clone();
        let commit = Commit {
            requests: vec![write],
            ..Commit::default()
        };

        match self.repo.commit(commit).await {
            Ok(_) => {
                info!(
                    "Request {} submitted by user {} for {}",
                    request.id, user_id, request.triple
                );
                Ok(request)
            }
            // Lost against a concurrent submission of the same user.
            Err(RepositoryError::Conflict { what }) => {
                match self.active_request(user_id, &request.triple).await? {
                    Some(existing) => Err(SourcingError::DuplicateRequest {
                        user_id,
                        existing: existing.id,
                        triple: request.triple,
                    }),
                    None => Err(SourcingError::StateConflict(what)),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Submit one request per triple of `companies` x `frameworks` x
    /// `periods` for `user_id`.
    ///
    /// Fails with `InvalidInput` if any of the sets is empty. Triples with a
    /// blank framework or period are reported as invalid and triples the user
    /// already actively requested as already requested; the rest are created
    /// in one commit.
    pub async fn submit_bulk_request(
        &self,
        user_id: UserId,
        companies: BTreeSet<CompanyId>,
        frameworks: BTreeSet<Framework>,
        periods: BTreeSet<ReportingPeriod>,
        member_comment: Option<String>,
    ) -> Result<BulkRequestOutcome, SourcingError> {
        if companies.is_empty() || frameworks.is_empty() || periods.is_empty() {
            return Err(SourcingError::InvalidInput(
                "companies, frameworks and reporting periods must not be empty".to_string(),
            ));
        }
        let member_comment = member_comment.filter(|comment| !comment.trim().is_empty());

        let mut attempt = 1;
        loop {
            let now = Utc::now();
            let mut outcome = BulkRequestOutcome::default();
            let mut plan = Plan::default();
            for company in &companies {
                for framework in &frameworks {
                    for period in &periods {
                        let triple =
                            SourcingTriple::new(*company, framework.clone(), period.clone());
                        if framework.as_str().trim().is_empty() || period.as_str().trim().is_empty()
                        {
                            outcome.invalid.push(triple);
                        } else if self.active_request(user_id, &triple).await?.is_some() {
                            outcome.already_requested.push(triple);
                        } else {
                            let write = RequestWrite::insert(Request::open(
                                triple,
                                user_id,
                                member_comment.clone(),
                                now,
                            ));
                            outcome.accepted.push(write.request.clone());
                            plan.commit.requests.push(write);
                        }
                    }
                }
            }
            plan.log(
                LogLevel::Info,
                format!(
                    "Bulk request by user {}: {} accepted, {} invalid, {} already requested",
                    user_id,
                    outcome.accepted.len(),
                    outcome.invalid.len(),
                    outcome.already_requested.len()
                ),
            );

            match self.apply(plan).await {
                Ok(_) => return Ok(outcome),
                // A concurrent submission of the same user took one of the triples.
                Err(RepositoryError::Conflict { what }) if attempt < MAX_COMMIT_ATTEMPTS => {
                    warn!(
                        "Bulk request by user {} lost a concurrent write (attempt {}): {}",
                        user_id, attempt, what
                    );
                    attempt += 1;
                }
                Err(RepositoryError::Conflict { what }) => {
                    return Err(SourcingError::StateConflict(what))
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Set the priority of a request. Allowed in every state.
    pub async fn patch_request_priority(
        &self,
        id: RequestId,
        priority: RequestPriority,
        admin_comment: Option<String>,
    ) -> Result<Request, SourcingError> {
        let mut attempt = 1;
        loop {
            let mut updated = self.get_request(id).await?;
            updated.priority = priority;
            updated.last_modified_at = Utc::now();
            if let Some(comment) = &admin_comment {
                updated.admin_comment = Some(comment.clone());
            }
            let write = RequestWrite::update(updated);
            let stored = write.request.clone();

            let mut plan = Plan::default();
            plan.log(
                LogLevel::Info,
                format!("Request {}: priority set to {}", id, priority),
            );
            plan.commit.requests.push(write);

            match self.apply(plan).await {
                Ok(_) => return Ok(stored),
                Err(RepositoryError::Conflict { what }) if attempt < MAX_COMMIT_ATTEMPTS => {
                    warn!(
                        "Request {} lost a concurrent write (attempt {}): {}",
                        id, attempt, what
                    );
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Move a request to `target`.
    ///
    /// Processing folds the request into the non-terminal unit of its triple,
    /// creating one if needed. Processing and Withdrawn each publish one
    /// transition message after the commit.
    pub async fn patch_request_state(
        &self,
        id: RequestId,
        target: RequestState,
        admin_comment: Option<String>,
    ) -> Result<Request, SourcingError> {
        let mut attempt = 1;
        loop {
            let (plan, updated) = self
                .plan_request_state(id, target, admin_comment.as_deref())
                .await?;
            match self.apply(plan).await {
                Ok(_) => return Ok(updated),
                Err(RepositoryError::Conflict { what }) if attempt < MAX_COMMIT_ATTEMPTS => {
                    warn!(
                        "Request {} lost a concurrent write (attempt {}): {}",
                        id, attempt, what
                    );
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn plan_request_state(
        &self,
        id: RequestId,
        target: RequestState,
        admin_comment: Option<&str>,
    ) -> Result<(Plan, Request), SourcingError> {
        let request = self.get_request(id).await?;
        let TransitionResult { state, effects } = request_transition(request.state, target)?;

        let now = Utc::now();
        let mut updated = request.clone();
        updated.state = state;
        updated.last_modified_at = now;
        if let Some(comment) = admin_comment {
            updated.admin_comment = Some(comment.to_string());
        }

        let mut plan = Plan::default();
        let mut messages = Vec::new();
        for effect in effects {
            match effect {
                Effect::AssignDataSourcing => {
                    let write = match self.repo.find_active_data_sourcing(&request.triple).await? {
                        Some(mut unit) => {
                            unit.last_modified_at = now;
                            DataSourcingWrite::update(unit)
                        }
                        None => {
                            let unit = DataSourcing::initialized(request.triple.clone(), now);
                            plan.log(
                                LogLevel::Info,
                                format!("Created data sourcing {} for {}", unit.id, unit.triple),
                            );
                            DataSourcingWrite::insert(unit)
                        }
                    };
                    updated.data_sourcing_id = Some(write.data_sourcing.id);
                    plan.commit.data_sourcings.push(write);
                }
                Effect::NotifyProcessing => {
                    let data_sourcing_id = assigned_unit(&updated)?;
                    messages.push(TransitionMessage::Processing(RequestSetToProcessing {
                        triggering_user_id: updated.user_id,
                        data_sourcing_id,
                        requested_company_id: updated.triple.company_id,
                        requested_reporting_period: updated.triple.reporting_period.clone(),
                        requested_framework: updated.triple.framework.clone(),
                    }));
                }
                Effect::NotifyWithdrawn => {
                    let data_sourcing_id = assigned_unit(&updated)?;
                    let siblings = self
                        .repo
                        .requests_for_data_sourcing(data_sourcing_id)
                        .await?
                        .into_iter()
                        .filter(|other| other.id != id && other.state.justifies_charge())
                        .map(|other| other.user_id)
                        .collect();
                    messages.push(TransitionMessage::Withdrawn(RequestSetToWithdrawn {
                        triggering_user_id: updated.user_id,
                        data_sourcing_id,
                        sibling_user_ids_for_same_triple: siblings,
                    }));
                }
                Effect::Log { level, message } => {
                    plan.log(level, format!("Request {}: {}", id, message));
                }
                other @ (Effect::CloseAssociatedRequests | Effect::NotifyNonSourceable) => {
                    debug!("Ignoring {:?} on request {}", other, id);
                }
            }
        }

        let write = RequestWrite::update(updated);
        let updated = write.request.clone();
        plan.commit.requests.push(write);
        for message in messages {
            plan.commit.outbox.push(outbox_message(message, id.to_string())?);
        }

        Ok((plan, updated))
    }

    // =========================================================================
    // Data sourcing
    // =========================================================================

    /// Create a unit for `triple` without a triggering request.
    pub async fn create_data_sourcing(
        &self,
        triple: SourcingTriple,
        admin_comment: Option<String>,
    ) -> Result<DataSourcing, SourcingError> {
        if let Some(existing) = self.repo.find_active_data_sourcing(&triple).await? {
            return Err(SourcingError::StateConflict(format!(
                "data sourcing {} is already active for {}",
                existing.id, triple
            )));
        }
        let mut unit = DataSourcing::initialized(triple, Utc::now());
        unit.admin_comment = admin_comment;
        let mut plan = Plan::default();
        plan.log(
            LogLevel::Info,
            format!("Created data sourcing {} for {}", unit.id, unit.triple),
        );
        let write = DataSourcingWrite::insert(unit);
        let unit = write.data_sourcing.clone();
        plan.commit.data_sourcings.push(write);
        let stored = self.apply(plan).await?;
        Ok(stored.into_iter().next().unwrap_or(unit))
    }

    /// Move a unit to the next pipeline state.
    pub async fn advance_pipeline(&self, id: DataSourcingId) -> Result<DataSourcing, SourcingError> {
        self.update_data_sourcing(id, |unit| {
            let result = transition::advance_pipeline(unit.state)?;
            let mut updated = unit.clone();
            updated.state = result.state;
            Ok((updated, result.effects))
        })
        .await
    }

    /// Forward-only move to `target`. Intermediate states may be skipped.
    pub async fn set_pipeline_state(
        &self,
        id: DataSourcingId,
        target: DataSourcingState,
    ) -> Result<DataSourcing, SourcingError> {
        self.update_data_sourcing(id, |unit| {
            let result = transition::pipeline_transition(unit.state, target)?;
            let mut updated = unit.clone();
            updated.state = result.state;
            Ok((updated, result.effects))
        })
        .await
    }

    /// Close a unit for which no documents could be found.
    pub async fn mark_non_sourceable(
        &self,
        id: DataSourcingId,
        admin_comment: Option<String>,
    ) -> Result<DataSourcing, SourcingError> {
        self.update_data_sourcing(id, |unit| {
            let result =
                transition::pipeline_transition(unit.state, DataSourcingState::NonSourceable)?;
            let mut updated = unit.clone();
            updated.state = result.state;
            if let Some(comment) = &admin_comment {
                updated.admin_comment = Some(comment.clone());
            }
            Ok((updated, result.effects))
        })
        .await
    }

    /// Administrative override. Any state may be set, including backwards.
    pub async fn override_data_sourcing_state(
        &self,
        id: DataSourcingId,
        target: DataSourcingState,
        admin_comment: Option<String>,
    ) -> Result<DataSourcing, SourcingError> {
        self.update_data_sourcing(id, |unit| {
            let result = transition::override_state(unit.state, target);
            let mut updated = unit.clone();
            updated.state = result.state;
            if let Some(comment) = &admin_comment {
                updated.admin_comment = Some(comment.clone());
            }
            Ok((updated, result.effects))
        })
        .await
    }

    /// Apply an administrative patch as a single revision.
    pub async fn patch_data_sourcing(
        &self,
        id: DataSourcingId,
        patch: DataSourcingPatch,
    ) -> Result<DataSourcing, SourcingError> {
        if patch.is_empty() {
            return Err(SourcingError::InvalidInput(format!(
                "empty patch for data sourcing {}",
                id
            )));
        }
        if let Some(ids) = &patch.document_ids {
            validate_document_ids(ids)?;
        }

        self.update_data_sourcing(id, |unit| {
            let mut updated = unit.clone();
            let mut effects = Vec::new();
            if let Some(target) = patch.state {
                let result = transition::override_state(unit.state, target);
                updated.state = result.state;
                effects = result.effects;
            }
            if let Some(ids) = &patch.document_ids {
                updated.document_ids = ids.clone();
            }
            if let Some(dates) = &patch.expected_publication_dates {
                updated.expected_publication_dates = dates.clone();
            }
            if let Some(date) = patch.next_attempt_date {
                updated.next_attempt_date = Some(date);
            }
            if let Some(collector) = patch.document_collector {
                updated.document_collector = Some(collector);
            }
            if let Some(extractor) = patch.data_extractor {
                updated.data_extractor = Some(extractor);
            }
            if let Some(comment) = &patch.admin_comment {
                updated.admin_comment = Some(comment.clone());
            }
            if let Some(priority) = patch.priority {
                updated.priority = priority;
            }
            Ok((updated, effects))
        })
        .await
    }

    /// Replace the document ids of a unit, or add to them if `append`.
    pub async fn patch_documents(
        &self,
        id: DataSourcingId,
        document_ids: BTreeSet<String>,
        append: bool,
    ) -> Result<DataSourcing, SourcingError> {
        validate_document_ids(&document_ids)?;
        self.update_data_sourcing(id, |unit| {
            let mut updated = unit.clone();
            if append {
                updated.document_ids.extend(document_ids.iter().cloned());
            } else {
                updated.document_ids = document_ids.clone();
            }
            Ok((updated, Vec::new()))
        })
        .await
    }

    pub async fn patch_next_attempt_date(
        &self,
        id: DataSourcingId,
        date: NaiveDate,
    ) -> Result<DataSourcing, SourcingError> {
        self.update_data_sourcing(id, |unit| {
            let mut updated = unit.clone();
            updated.next_attempt_date = Some(date);
            Ok((updated, Vec::new()))
        })
        .await
    }

    /// Shared path of every unit mutation. `update` returns the new unit and
    /// the transition effects; the unit's timestamp is set here.
    async fn update_data_sourcing<F>(
        &self,
        id: DataSourcingId,
        update: F,
    ) -> Result<DataSourcing, SourcingError>
    where
        F: Fn(&DataSourcing) -> Result<(DataSourcing, Vec<Effect>), SourcingError> + Send + Sync,
    {
        let mut attempt = 1;
        loop {
            let current = self.get_data_sourcing(id).await?;
            let (mut updated, effects) = update(&current)?;
            let now = Utc::now();
            updated.last_modified_at = now;

            let mut plan = Plan::default();
            for effect in effects {
                match effect {
                    Effect::CloseAssociatedRequests => {
                        for request in self.repo.requests_for_data_sourcing(id).await? {
                            if request.state != RequestState::Processing {
                                continue;
                            }
                            let result =
                                request_transition(request.state, RequestState::Processed)?;
                            for effect in result.effects {
                                if let Effect::Log { level, message } = effect {
                                    plan.log(level, format!("Request {}: {}", request.id, message));
                                }
                            }
                            let mut closed = request;
                            closed.state = result.state;
                            closed.last_modified_at = now;
                            plan.commit.requests.push(RequestWrite::update(closed));
                        }
                    }
                    Effect::NotifyNonSourceable => {
                        let message =
                            TransitionMessage::NonSourceable(DataSourcingSetToNonSourceable {
                                data_sourcing_id: id,
                                company_id: updated.triple.company_id,
                                framework: updated.triple.framework.clone(),
                                reporting_period: updated.triple.reporting_period.clone(),
                                is_non_sourceable: true,
                                reason: updated.admin_comment.clone().unwrap_or_default(),
                            });
                        plan.log(
                            LogLevel::Info,
                            format!("Data sourcing {}: sending non-sourceable notice", id),
                        );
                        plan.commit.outbox.push(outbox_message(message, id.to_string())?);
                    }
                    Effect::Log { level, message } => {
                        plan.log(level, format!("Data sourcing {}: {}", id, message));
                    }
                    other => debug!("Ignoring {:?} on data sourcing {}", other, id),
                }
            }
            plan.commit.data_sourcings.push(DataSourcingWrite::update(updated));

            match self.apply(plan).await {
                Ok(stored) => {
                    return stored.into_iter().find(|unit| unit.id == id).ok_or_else(|| {
                        RepositoryError::corruption(format!(
                            "commit did not return data sourcing {}",
                            id
                        ))
                        .into()
                    })
                }
                Err(RepositoryError::Conflict { what }) if attempt < MAX_COMMIT_ATTEMPTS => {
                    warn!(
                        "Data sourcing {} lost a concurrent write (attempt {}): {}",
                        id, attempt, what
                    );
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    // =========================================================================
    // Commit and relay
    // =========================================================================

    async fn apply(&self, plan: Plan) -> Result<Vec<DataSourcing>, RepositoryError> {
        let outbox = plan.commit.outbox.clone();
        let stored = if plan.commit.is_empty() {
            Vec::new()
        } else {
            self.repo.commit(plan.commit).await?
        };
        for (level, message) in &plan.logs {
            emit_log(*level, message);
        }
        self.relay(&outbox).await;
        Ok(stored)
    }

    /// Publish committed messages. Returns how many were published. The rows
    /// stay pending until a consumer settles them.
    async fn relay(&self, messages: &[OutboxMessage]) -> usize {
        let mut published = 0;
        for message in messages {
            match self
                .channel
                .publish(&message.queue, message.envelope.clone())
                .await
            {
                Ok(()) => published += 1,
                Err(e) => warn!(
                    "Message {} stays in the outbox: {}",
                    message.message_id(),
                    e
                ),
            }
        }
        published
    }

    /// Publish every message no consumer has settled yet. Run at startup,
    /// before any consumer, to recover messages that were committed but never
    /// published or that were still queued in memory when the process
    /// stopped. Consumers are idempotent, so a message that was handled but
    /// not yet marked is harmless to deliver again.
    pub async fn relay_pending_outbox(&self) -> Result<usize, SourcingError> {
        let pending = self.repo.pending_outbox().await?;
        if pending.is_empty() {
            return Ok(0);
        }
        info!("Relaying {} pending outbox messages", pending.len());
        Ok(self.relay(&pending).await)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub async fn get_request(&self, id: RequestId) -> Result<Request, SourcingError> {
        self.repo
            .get_request(id)
            .await?
            .ok_or_else(|| SourcingError::not_found("request", id))
    }

    pub async fn find_requests(&self, query: &RequestQuery) -> Result<Vec<Request>, SourcingError> {
        Ok(self.repo.find_requests(query).await?)
    }

    /// Combined, user-facing history of a request.
    pub async fn request_history(
        &self,
        id: RequestId,
    ) -> Result<Vec<RequestHistoryEntry>, SourcingError> {
        let request = self.get_request(id).await?;
        let request_revisions = self.repo.request_history(id).await?;
        let unit_revisions = match request.data_sourcing_id {
            Some(unit) => self.repo.data_sourcing_history(unit).await?,
            None => Vec::new(),
        };
        Ok(build_request_history(&request_revisions, &unit_revisions))
    }

    pub async fn get_data_sourcing(
        &self,
        id: DataSourcingId,
    ) -> Result<DataSourcing, SourcingError> {
        self.repo
            .get_data_sourcing(id)
            .await?
            .ok_or_else(|| SourcingError::not_found("data sourcing", id))
    }

    /// Revision log of a unit, oldest first.
    pub async fn data_sourcing_history(
        &self,
        id: DataSourcingId,
    ) -> Result<Vec<DataSourcingRevision>, SourcingError> {
        let history = self.repo.data_sourcing_history(id).await?;
        if history.is_empty() {
            return Err(SourcingError::not_found("data sourcing", id));
        }
        Ok(history)
    }

    pub async fn find_active_data_sourcing(
        &self,
        triple: &SourcingTriple,
    ) -> Result<Option<DataSourcing>, SourcingError> {
        Ok(self.repo.find_active_data_sourcing(triple).await?)
    }

    pub async fn assigned_data_sourcings(
        &self,
        company: CompanyId,
    ) -> Result<Vec<DataSourcing>, SourcingError> {
        Ok(self.repo.assigned_data_sourcings(company).await?)
    }

    pub async fn priorities_by_triples(
        &self,
        triples: &[SourcingTriple],
    ) -> Result<Vec<(SourcingTriple, i32)>, SourcingError> {
        Ok(self.repo.priorities_by_triples(triples).await?)
    }

    async fn active_request(
        &self,
        user_id: UserId,
        triple: &SourcingTriple,
    ) -> Result<Option<Request>, SourcingError> {
        let mut active = self
            .repo
            .find_requests(&RequestQuery::active_for(user_id, triple))
            .await?;
        Ok(active.pop())
    }
}

fn outbox_message(
    message: TransitionMessage,
    correlation_id: String,
) -> Result<OutboxMessage, SourcingError> {
    let queue = message.queue().to_string();
    let envelope = message.into_envelope(correlation_id).map_err(|e| {
        RepositoryError::storage("serialize transition message", e.to_string())
    })?;
    Ok(OutboxMessage { queue, envelope })
}

fn assigned_unit(request: &Request) -> Result<DataSourcingId, SourcingError> {
    request.data_sourcing_id.ok_or_else(|| {
        SourcingError::StateConflict(format!(
            "request {} is not assigned to a data sourcing",
            request.id
        ))
    })
}

fn validate_document_ids(ids: &BTreeSet<String>) -> Result<(), SourcingError> {
    if ids.iter().any(|id| id.trim().is_empty()) {
        return Err(SourcingError::InvalidInput(
            "document ids must not be blank".to_string(),
        ));
    }
    Ok(())
}

//! Billing reconciler.
//!
//! Consumes request transition messages and keeps the billed ledger in line
//! with them. Each action is a single conditional write on the (billed
//! organization, data sourcing) key, so redelivered, reordered or concurrent
//! messages converge without any locking here.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use sourcing_core::{
    CompanyId, Envelope, Framework, RequestSetToProcessing, RequestSetToWithdrawn,
    REQUEST_SET_TO_PROCESSING, REQUEST_SET_TO_WITHDRAWN,
};
use tracing::info;

use crate::ledger::BilledLedgerEntry;
use crate::messaging::{Dispatcher, HandlerError, MessageHandler};
use crate::repository::{LedgerRepository, RepositoryError};
use crate::roles::{member_organization, RoleError, RoleResolver};

/// What a reconciler action did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Billed(CompanyId),
    AlreadyBilled(CompanyId),
    Retracted(CompanyId),
    /// No entry existed for the key; the retraction is a no-op.
    NothingToRetract(CompanyId),
    /// A sibling request's user is billed through the same organization.
    SiblingStillBilled(CompanyId),
    NoMemberOrganization,
    ExcludedFramework,
}

impl From<RoleError> for HandlerError {
    fn from(err: RoleError) -> Self {
        HandlerError::Transient(err.to_string())
    }
}

impl From<RepositoryError> for HandlerError {
    fn from(err: RepositoryError) -> Self {
        HandlerError::Transient(err.to_string())
    }
}

pub struct BillingReconciler {
    resolver: Arc<dyn RoleResolver>,
    ledger: Arc<dyn LedgerRepository>,
    excluded_frameworks: BTreeSet<Framework>,
}

impl BillingReconciler {
    pub fn new(
        resolver: Arc<dyn RoleResolver>,
        ledger: Arc<dyn LedgerRepository>,
        excluded_frameworks: impl IntoIterator<Item = Framework>,
    ) -> Self {
        Self {
            resolver,
            ledger,
            excluded_frameworks: excluded_frameworks.into_iter().collect(),
        }
    }

    /// Bill the triggering user's member organization for the unit, unless
    /// it already is.
    pub async fn handle_processing(
        &self,
        message: &RequestSetToProcessing,
        correlation_id: &str,
    ) -> Result<ReconcileOutcome, HandlerError> {
        let Some(billed) =
            member_organization(self.resolver.as_ref(), message.triggering_user_id).await?
        else {
            info!(
                "[{}] User {} has no member organization, nothing to bill for {}",
                correlation_id, message.triggering_user_id, message.data_sourcing_id
            );
            return Ok(ReconcileOutcome::NoMemberOrganization);
        };

        if self.excluded_frameworks.contains(&message.requested_framework) {
            info!(
                "[{}] Framework {} is not billed, skipping {}",
                correlation_id, message.requested_framework, message.data_sourcing_id
            );
            return Ok(ReconcileOutcome::ExcludedFramework);
        }

        let entry = BilledLedgerEntry {
            billed_company_id: billed,
            data_sourcing_id: message.data_sourcing_id,
            requested_company_id: message.requested_company_id,
            requested_framework: message.requested_framework.clone(),
            requested_reporting_period: message.requested_reporting_period.clone(),
            created_at: Utc::now(),
        };
        if self.ledger.insert_billed_entry_if_absent(&entry).await? {
            info!(
                "[{}] Billed company {} for data sourcing {}",
                correlation_id, billed, message.data_sourcing_id
            );
            Ok(ReconcileOutcome::Billed(billed))
        } else {
            info!(
                "[{}] Company {} is already billed for data sourcing {}",
                correlation_id, billed, message.data_sourcing_id
            );
            Ok(ReconcileOutcome::AlreadyBilled(billed))
        }
    }

    /// Retract the charge of the withdrawing user's organization unless a
    /// sibling request still justifies it.
    pub async fn handle_withdrawn(
        &self,
        message: &RequestSetToWithdrawn,
        correlation_id: &str,
    ) -> Result<ReconcileOutcome, HandlerError> {
        let Some(billed) =
            member_organization(self.resolver.as_ref(), message.triggering_user_id).await?
        else {
            info!(
                "[{}] User {} has no member organization, nothing to retract for {}",
                correlation_id, message.triggering_user_id, message.data_sourcing_id
            );
            return Ok(ReconcileOutcome::NoMemberOrganization);
        };

        for sibling in &message.sibling_user_ids_for_same_triple {
            if member_organization(self.resolver.as_ref(), *sibling).await? == Some(billed) {
                info!(
                    "[{}] Sibling user {} keeps company {} billed for {}",
                    correlation_id, sibling, billed, message.data_sourcing_id
                );
                return Ok(ReconcileOutcome::SiblingStillBilled(billed));
            }
        }

        if self
            .ledger
            .delete_billed_entry_if_present(billed, message.data_sourcing_id)
            .await?
        {
            info!(
                "[{}] Retracted charge of company {} for data sourcing {}",
                correlation_id, billed, message.data_sourcing_id
            );
            Ok(ReconcileOutcome::Retracted(billed))
        } else {
            info!(
                "[{}] No charge of company {} for data sourcing {} to retract",
                correlation_id, billed, message.data_sourcing_id
            );
            Ok(ReconcileOutcome::NothingToRetract(billed))
        }
    }

    /// Dispatcher with both handlers bound to their message types.
    pub fn dispatcher(self: Arc<Self>) -> Dispatcher {
        Dispatcher::new()
            .bind(
                REQUEST_SET_TO_PROCESSING,
                Arc::new(ProcessingHandler(self.clone())),
            )
            .bind(REQUEST_SET_TO_WITHDRAWN, Arc::new(WithdrawnHandler(self)))
    }
}

fn decode<T: serde::de::DeserializeOwned>(envelope: &Envelope) -> Result<T, HandlerError> {
    envelope.decode().map_err(|e| {
        HandlerError::Malformed(format!(
            "{} payload of message {}: {}",
            envelope.message_type, envelope.message_id, e
        ))
    })
}

struct ProcessingHandler(Arc<BillingReconciler>);

#[async_trait]
impl MessageHandler for ProcessingHandler {
    async fn handle(&self, envelope: &Envelope) -> Result<(), HandlerError> {
        let message: RequestSetToProcessing = decode(envelope)?;
        self.0
            .handle_processing(&message, &envelope.correlation_id)
            .await
            .map(|_| ())
    }
}

struct WithdrawnHandler(Arc<BillingReconciler>);

#[async_trait]
impl MessageHandler for WithdrawnHandler {
    async fn handle(&self, envelope: &Envelope) -> Result<(), HandlerError> {
        let message: RequestSetToWithdrawn = decode(envelope)?;
        self.0
            .handle_withdrawn(&message, &envelope.correlation_id)
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use sourcing_core::{DataSourcingId, TransitionMessage, UserId};

    use crate::repository::InMemoryRepository;
    use crate::roles::{CompanyRole, StaticRoleResolver};

    struct Fixture {
        reconciler: Arc<BillingReconciler>,
        resolver: Arc<StaticRoleResolver>,
        ledger: Arc<InMemoryRepository>,
    }

    fn fixture() -> Fixture {
        let resolver = Arc::new(StaticRoleResolver::new());
        let ledger = Arc::new(InMemoryRepository::new());
        let reconciler = Arc::new(BillingReconciler::new(
            resolver.clone(),
            ledger.clone(),
            [Framework::from("nuclear-and-gas")],
        ));
        Fixture {
            reconciler,
            resolver,
            ledger,
        }
    }

    async fn member_of(f: &Fixture, company: CompanyId) -> UserId {
        let user = UserId::random();
        f.resolver.assign(user, company, CompanyRole::Member).await;
        user
    }

    fn processing(user: UserId, ds: DataSourcingId, framework: &str) -> RequestSetToProcessing {
        RequestSetToProcessing {
            triggering_user_id: user,
            data_sourcing_id: ds,
            requested_company_id: CompanyId::random(),
            requested_reporting_period: "2026".into(),
            requested_framework: framework.into(),
        }
    }

    fn withdrawn(user: UserId, ds: DataSourcingId, siblings: &[UserId]) -> RequestSetToWithdrawn {
        RequestSetToWithdrawn {
            triggering_user_id: user,
            data_sourcing_id: ds,
            sibling_user_ids_for_same_triple: siblings.iter().copied().collect(),
        }
    }

    #[tokio::test]
    async fn test_processing_bills_member_organization() {
        let f = fixture();
        let company = CompanyId::random();
        let user = member_of(&f, company).await;
        let ds = DataSourcingId::random();

        let outcome = f
            .reconciler
            .handle_processing(&processing(user, ds, "sfdr"), "c")
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::Billed(company));

        let entries = f.ledger.billed_entries_for_company(company).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].data_sourcing_id, ds);
        assert_eq!(entries[0].requested_framework.as_str(), "sfdr");
    }

    #[tokio::test]
    async fn test_processing_without_member_org_is_a_no_op() {
        let f = fixture();
        let user = UserId::random();
        f.resolver
            .assign(user, CompanyId::random(), CompanyRole::DataUploader)
            .await;

        let outcome = f
            .reconciler
            .handle_processing(&processing(user, DataSourcingId::random(), "sfdr"), "c")
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::NoMemberOrganization);
    }

    #[tokio::test]
    async fn test_excluded_framework_is_not_billed() {
        let f = fixture();
        let company = CompanyId::random();
        let user = member_of(&f, company).await;
        let ds = DataSourcingId::random();

        let outcome = f
            .reconciler
            .handle_processing(&processing(user, ds, "nuclear-and-gas"), "c")
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::ExcludedFramework);
        assert_eq!(f.ledger.billed_entry_count(ds).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_resolver_outage_is_transient() {
        let f = fixture();
        f.resolver.set_unavailable(true).await;
        let err = f
            .reconciler
            .handle_processing(
                &processing(UserId::random(), DataSourcingId::random(), "sfdr"),
                "c",
            )
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::Transient(_)));
    }

    #[tokio::test]
    async fn test_withdrawal_keeps_charge_for_sibling_of_same_org() {
        let f = fixture();
        let company = CompanyId::random();
        let leaving = member_of(&f, company).await;
        let staying = member_of(&f, company).await;
        let ds = DataSourcingId::random();
        for user in [leaving, staying] {
            f.reconciler
                .handle_processing(&processing(user, ds, "sfdr"), "c")
                .await
                .unwrap();
        }

        let outcome = f
            .reconciler
            .handle_withdrawn(&withdrawn(leaving, ds, &[staying]), "c")
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::SiblingStillBilled(company));
        assert_eq!(f.ledger.billed_entry_count(ds).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_withdrawal_retracts_when_siblings_are_elsewhere() {
        let f = fixture();
        let company = CompanyId::random();
        let leaving = member_of(&f, company).await;
        let other = member_of(&f, CompanyId::random()).await;
        let ds = DataSourcingId::random();
        for user in [leaving, other] {
            f.reconciler
                .handle_processing(&processing(user, ds, "sfdr"), "c")
                .await
                .unwrap();
        }

        let outcome = f
            .reconciler
            .handle_withdrawn(&withdrawn(leaving, ds, &[other]), "c")
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::Retracted(company));
        assert_eq!(f.ledger.billed_entry_count(ds).await.unwrap(), 1);

        // Redelivery of the same withdrawal is a no-op.
        let again = f
            .reconciler
            .handle_withdrawn(&withdrawn(leaving, ds, &[other]), "c")
            .await
            .unwrap();
        assert_eq!(again, ReconcileOutcome::NothingToRetract(company));
    }

    #[tokio::test]
    async fn test_withdrawal_without_entry_is_a_no_op() {
        let f = fixture();
        let company = CompanyId::random();
        let user = member_of(&f, company).await;
        let ds = DataSourcingId::random();

        let retract = f
            .reconciler
            .handle_withdrawn(&withdrawn(user, ds, &[]), "c")
            .await
            .unwrap();
        assert_eq!(retract, ReconcileOutcome::NothingToRetract(company));
    }

    #[tokio::test]
    async fn test_dispatcher_routes_and_rejects_garbage() {
        let f = fixture();
        let company = CompanyId::random();
        let user = member_of(&f, company).await;
        let ds = DataSourcingId::random();
        let dispatcher = f.reconciler.clone().dispatcher();

        let envelope = TransitionMessage::Processing(processing(user, ds, "sfdr"))
            .into_envelope("corr")
            .unwrap();
        dispatcher.dispatch(&envelope).await.unwrap();
        assert_eq!(f.ledger.billed_entry_count(ds).await.unwrap(), 1);

        let mut garbage = envelope.clone();
        garbage.payload = "{\"triggeringUserId\": 5}".to_string();
        assert!(matches!(
            dispatcher.dispatch(&garbage).await,
            Err(HandlerError::Malformed(_))
        ));

        let mut unknown = envelope;
        unknown.message_type = "request.set-to-open".to_string();
        assert!(matches!(
            dispatcher.dispatch(&unknown).await,
            Err(HandlerError::Malformed(_))
        ));
    }

    proptest! {
        /// Any number of redeliveries of the same Processing message leaves
        /// exactly one entry.
        #[test]
        fn processing_is_idempotent_under_redelivery(redeliveries in 1usize..10) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            rt.block_on(async {
                let f = fixture();
                let company = CompanyId::random();
                let user = member_of(&f, company).await;
                let ds = DataSourcingId::random();
                let message = processing(user, ds, "sfdr");

                let mut billed = 0;
                for _ in 0..redeliveries {
                    if let ReconcileOutcome::Billed(_) =
                        f.reconciler.handle_processing(&message, "c").await.unwrap()
                    {
                        billed += 1;
                    }
                }
                prop_assert_eq!(billed, 1);
                prop_assert_eq!(f.ledger.billed_entry_count(ds).await.unwrap(), 1);
                Ok(())
            })?;
        }
    }
}

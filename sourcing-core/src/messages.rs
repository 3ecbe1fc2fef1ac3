//! Wire schemas for transition messages.
//!
//! The data sourcing workflow publishes one message per request transition
//! to Processing or Withdrawn, which the accounting listener consumes, and
//! one message when a data sourcing unit becomes non-sourceable, which the
//! notification side consumes. Both sides agree on the message type strings,
//! the queue each type is routed to and the camelCase JSON payloads below.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

use crate::ids::{CompanyId, DataSourcingId, Framework, ReportingPeriod, UserId};

/// Message type for a request that was set to Processing.
pub const REQUEST_SET_TO_PROCESSING: &str = "request.set-to-processing";

/// Message type for a request that was set to Withdrawn.
pub const REQUEST_SET_TO_WITHDRAWN: &str = "request.set-to-withdrawn";

/// Message type for a data sourcing unit that was set to NonSourceable.
pub const DATA_SOURCING_SET_TO_NON_SOURCEABLE: &str = "data-sourcing.set-to-non-sourceable";

/// Queue carrying Processing messages to the accounting listener.
pub const ACCOUNTING_PROCESSING_QUEUE: &str = "accounting.request-processing";

/// Queue carrying Withdrawn messages to the accounting listener.
pub const ACCOUNTING_WITHDRAWN_QUEUE: &str = "accounting.request-withdrawn";

/// Queue carrying non-sourceable notices to the notification side.
pub const NON_SOURCEABLE_NOTIFICATION_QUEUE: &str = "notification.data-sourcing-non-sourceable";

/// Published after a request was committed in state Processing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestSetToProcessing {
    pub triggering_user_id: UserId,
    pub data_sourcing_id: DataSourcingId,
    pub requested_company_id: CompanyId,
    pub requested_reporting_period: ReportingPeriod,
    pub requested_framework: Framework,
}

/// Published after a request was committed in state Withdrawn.
///
/// `sibling_user_ids_for_same_triple` holds the users of every other request
/// for the same triple that still justifies a charge at commit time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestSetToWithdrawn {
    pub triggering_user_id: UserId,
    pub data_sourcing_id: DataSourcingId,
    #[serde(default)]
    pub sibling_user_ids_for_same_triple: BTreeSet<UserId>,
}

/// Published after a unit was committed in state NonSourceable, coming from
/// any other state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSourcingSetToNonSourceable {
    pub data_sourcing_id: DataSourcingId,
    pub company_id: CompanyId,
    pub framework: Framework,
    pub reporting_period: ReportingPeriod,
    pub is_non_sourceable: bool,
    /// Admin comment of the unit at commit time, empty if none.
    #[serde(default)]
    pub reason: String,
}

/// A transition message, before it is wrapped in an envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransitionMessage {
    Processing(RequestSetToProcessing),
    Withdrawn(RequestSetToWithdrawn),
    NonSourceable(DataSourcingSetToNonSourceable),
}

impl TransitionMessage {
    pub fn message_type(&self) -> &'static str {
        match self {
            Self::Processing(_) => REQUEST_SET_TO_PROCESSING,
            Self::Withdrawn(_) => REQUEST_SET_TO_WITHDRAWN,
            Self::NonSourceable(_) => DATA_SOURCING_SET_TO_NON_SOURCEABLE,
        }
    }

    /// Queue this message is routed to.
    pub fn queue(&self) -> &'static str {
        match self {
            Self::Processing(_) => ACCOUNTING_PROCESSING_QUEUE,
            Self::Withdrawn(_) => ACCOUNTING_WITHDRAWN_QUEUE,
            Self::NonSourceable(_) => NON_SOURCEABLE_NOTIFICATION_QUEUE,
        }
    }

    pub fn data_sourcing_id(&self) -> DataSourcingId {
        match self {
            Self::Processing(m) => m.data_sourcing_id,
            Self::Withdrawn(m) => m.data_sourcing_id,
            Self::NonSourceable(m) => m.data_sourcing_id,
        }
    }

    /// Wrap the message in a fresh envelope.
    pub fn into_envelope(
        self,
        correlation_id: impl Into<String>,
    ) -> Result<Envelope, serde_json::Error> {
        let payload = match &self {
            Self::Processing(m) => serde_json::to_string(m)?,
            Self::Withdrawn(m) => serde_json::to_string(m)?,
            Self::NonSourceable(m) => serde_json::to_string(m)?,
        };
        Ok(Envelope {
            message_id: Uuid::new_v4(),
            message_type: self.message_type().to_string(),
            correlation_id: correlation_id.into(),
            payload,
            published_at: Utc::now(),
            delivery_count: 0,
        })
    }
}

/// Queue a message type is routed to, if the type is known.
pub fn queue_for(message_type: &str) -> Option<&'static str> {
    match message_type {
        REQUEST_SET_TO_PROCESSING => Some(ACCOUNTING_PROCESSING_QUEUE),
        REQUEST_SET_TO_WITHDRAWN => Some(ACCOUNTING_WITHDRAWN_QUEUE),
        DATA_SOURCING_SET_TO_NON_SOURCEABLE => Some(NON_SOURCEABLE_NOTIFICATION_QUEUE),
        _ => None,
    }
}

/// Transport envelope around a JSON payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub message_id: Uuid,
    pub message_type: String,
    pub correlation_id: String,
    pub payload: String,
    pub published_at: DateTime<Utc>,
    /// Number of times this envelope was handed to a consumer.
    pub delivery_count: u32,
}

impl Envelope {
    /// Decode the payload as `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(&self.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn processing_message() -> RequestSetToProcessing {
        RequestSetToProcessing {
            triggering_user_id: UserId(Uuid::nil()),
            data_sourcing_id: DataSourcingId(Uuid::nil()),
            requested_company_id: CompanyId(Uuid::nil()),
            requested_reporting_period: ReportingPeriod::from("2026"),
            requested_framework: Framework::from("sfdr"),
        }
    }

    #[test]
    fn test_processing_payload_uses_camel_case_fields() {
        let json = serde_json::to_value(processing_message()).unwrap();
        let object = json.as_object().unwrap();
        for key in [
            "triggeringUserId",
            "dataSourcingId",
            "requestedCompanyId",
            "requestedReportingPeriod",
            "requestedFramework",
        ] {
            assert!(object.contains_key(key), "missing {key}");
        }
    }

    #[test]
    fn test_withdrawn_payload_without_siblings_defaults_to_empty() {
        let payload = format!(
            r#"{{"triggeringUserId":"{}","dataSourcingId":"{}"}}"#,
            Uuid::nil(),
            Uuid::nil()
        );
        let parsed: RequestSetToWithdrawn = serde_json::from_str(&payload).unwrap();
        assert!(parsed.sibling_user_ids_for_same_triple.is_empty());
    }

    #[test]
    fn test_envelope_carries_type_and_decodes_payload() {
        let message = TransitionMessage::Processing(processing_message());
        assert_eq!(message.queue(), ACCOUNTING_PROCESSING_QUEUE);

        let envelope = message.into_envelope("corr-1").unwrap();
        assert_eq!(envelope.message_type, REQUEST_SET_TO_PROCESSING);
        assert_eq!(envelope.correlation_id, "corr-1");
        assert_eq!(envelope.delivery_count, 0);

        let decoded: RequestSetToProcessing = envelope.decode().unwrap();
        assert_eq!(decoded, processing_message());
    }

    #[test]
    fn test_non_sourceable_notice_routes_to_notification_queue() {
        let message = TransitionMessage::NonSourceable(DataSourcingSetToNonSourceable {
            data_sourcing_id: DataSourcingId(Uuid::nil()),
            company_id: CompanyId(Uuid::nil()),
            framework: Framework::from("sfdr"),
            reporting_period: ReportingPeriod::from("2026"),
            is_non_sourceable: true,
            reason: String::new(),
        });
        assert_eq!(message.queue(), NON_SOURCEABLE_NOTIFICATION_QUEUE);
        assert_eq!(
            queue_for(DATA_SOURCING_SET_TO_NON_SOURCEABLE),
            Some(NON_SOURCEABLE_NOTIFICATION_QUEUE)
        );

        let envelope = message.into_envelope("corr-2").unwrap();
        let json: serde_json::Value = serde_json::from_str(&envelope.payload).unwrap();
        assert_eq!(json["isNonSourceable"], serde_json::Value::Bool(true));
        assert_eq!(json["reportingPeriod"], "2026");
    }

    #[test]
    fn test_unknown_message_type_has_no_queue() {
        assert_eq!(queue_for("some.wrong.message.type"), None);
        assert_eq!(
            queue_for(REQUEST_SET_TO_WITHDRAWN),
            Some(ACCOUNTING_WITHDRAWN_QUEUE)
        );
    }
}

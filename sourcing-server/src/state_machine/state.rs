//! State types for requests and data sourcing units.
//!
//! A `Request` is one user's ask for data on a triple. A `DataSourcing` is
//! the shared unit of work that every Processing request for the same triple
//! is folded into.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sourcing_core::{CompanyId, DataSourcingId, RequestId, SourcingTriple, UserId};

/// Priority given to a newly created data sourcing unit.
pub const DEFAULT_PRIORITY: i32 = 10;

/// Lifecycle state of a single request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestState {
    Open,
    Processing,
    Processed,
    Withdrawn,
}

impl RequestState {
    pub const ALL: [RequestState; 4] = [
        RequestState::Open,
        RequestState::Processing,
        RequestState::Processed,
        RequestState::Withdrawn,
    ];

    /// Terminal states are final.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Processed | Self::Withdrawn)
    }

    /// Open and Processing requests block a second request by the same user
    /// for the same triple.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Open | Self::Processing)
    }

    /// Requests that caused a charge and have not been withdrawn.
    pub fn justifies_charge(self) -> bool {
        matches!(self, Self::Processing | Self::Processed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "Open",
            Self::Processing => "Processing",
            Self::Processed => "Processed",
            Self::Withdrawn => "Withdrawn",
        }
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("unknown request state '{}'", s))
    }
}

/// Lifecycle state of a data sourcing unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataSourcingState {
    Initialized,
    DocumentSourcing,
    DataVerification,
    Done,
    /// No documents could be found; the unit is closed without data.
    NonSourceable,
}

impl DataSourcingState {
    pub const ALL: [DataSourcingState; 5] = [
        DataSourcingState::Initialized,
        DataSourcingState::DocumentSourcing,
        DataSourcingState::DataVerification,
        DataSourcingState::Done,
        DataSourcingState::NonSourceable,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::NonSourceable)
    }

    /// Position along the pipeline. Both terminal states share the last rank.
    pub fn pipeline_rank(self) -> u8 {
        match self {
            Self::Initialized => 0,
            Self::DocumentSourcing => 1,
            Self::DataVerification => 2,
            Self::Done | Self::NonSourceable => 3,
        }
    }

    /// Next pipeline state, `None` once terminal.
    pub fn next(self) -> Option<Self> {
        match self {
            Self::Initialized => Some(Self::DocumentSourcing),
            Self::DocumentSourcing => Some(Self::DataVerification),
            Self::DataVerification => Some(Self::Done),
            Self::Done | Self::NonSourceable => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initialized => "Initialized",
            Self::DocumentSourcing => "DocumentSourcing",
            Self::DataVerification => "DataVerification",
            Self::Done => "Done",
            Self::NonSourceable => "NonSourceable",
        }
    }
}

impl fmt::Display for DataSourcingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataSourcingState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("unknown data sourcing state '{}'", s))
    }
}

/// How urgently an administrator wants a request handled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RequestPriority {
    Low,
    #[default]
    Normal,
    High,
}

impl RequestPriority {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "Low",
            Self::Normal => "Normal",
            Self::High => "High",
        }
    }
}

impl fmt::Display for RequestPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single user's request for data on a triple.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub id: RequestId,
    pub triple: SourcingTriple,
    pub user_id: UserId,
    pub state: RequestState,
    /// Set once the request has been folded into a unit of work.
    pub data_sourcing_id: Option<DataSourcingId>,
    pub member_comment: Option<String>,
    pub admin_comment: Option<String>,
    #[serde(default)]
    pub priority: RequestPriority,
    pub created_at: DateTime<Utc>,
    pub last_modified_at: DateTime<Utc>,
    /// Number of stored saves. Zero until first committed.
    #[serde(default)]
    pub version: i64,
}

impl Request {
    /// A freshly submitted request in state Open.
    pub fn open(
        triple: SourcingTriple,
        user_id: UserId,
        member_comment: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: RequestId::random(),
            triple,
            user_id,
            state: RequestState::Open,
            data_sourcing_id: None,
            member_comment,
            admin_comment: None,
            priority: RequestPriority::default(),
            created_at: now,
            last_modified_at: now,
            version: 0,
        }
    }
}

/// The shared unit of work for one triple.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSourcing {
    pub id: DataSourcingId,
    pub triple: SourcingTriple,
    pub state: DataSourcingState,
    pub priority: i32,
    #[serde(default)]
    pub document_ids: BTreeSet<String>,
    #[serde(default)]
    pub expected_publication_dates: BTreeSet<NaiveDate>,
    pub next_attempt_date: Option<NaiveDate>,
    pub document_collector: Option<CompanyId>,
    pub data_extractor: Option<CompanyId>,
    pub admin_comment: Option<String>,
    #[serde(default)]
    pub associated_requests: BTreeSet<RequestId>,
    pub last_modified_at: DateTime<Utc>,
    /// Number of stored saves. Zero until first committed.
    #[serde(default)]
    pub version: i64,
}

impl DataSourcing {
    /// A new unit of work in state Initialized.
    pub fn initialized(triple: SourcingTriple, now: DateTime<Utc>) -> Self {
        Self {
            id: DataSourcingId::random(),
            triple,
            state: DataSourcingState::Initialized,
            priority: DEFAULT_PRIORITY,
            document_ids: BTreeSet::new(),
            expected_publication_dates: BTreeSet::new(),
            next_attempt_date: None,
            document_collector: None,
            data_extractor: None,
            admin_comment: None,
            associated_requests: BTreeSet::new(),
            last_modified_at: now,
            version: 0,
        }
    }

    /// True if `company` is assigned as collector or extractor.
    pub fn is_assigned_to(&self, company: CompanyId) -> bool {
        self.document_collector == Some(company) || self.data_extractor == Some(company)
    }
}

/// One immutable row of the data sourcing revision log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataSourcingRevision {
    /// Monotonic revision number, assigned by the repository.
    pub revision: i64,
    pub snapshot: DataSourcing,
    pub recorded_at: DateTime<Utc>,
}

/// One immutable row of the request revision log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestRevision {
    pub revision: i64,
    pub snapshot: Request,
    pub recorded_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_state_round_trips_through_str() {
        for state in RequestState::ALL {
            assert_eq!(state.as_str().parse::<RequestState>(), Ok(state));
        }
        assert!("Pending".parse::<RequestState>().is_err());
    }

    #[test]
    fn test_data_sourcing_pipeline_order() {
        let mut state = DataSourcingState::Initialized;
        let mut visited = vec![state];
        while let Some(next) = state.next() {
            assert!(next.pipeline_rank() > state.pipeline_rank());
            visited.push(next);
            state = next;
        }
        assert_eq!(
            visited,
            vec![
                DataSourcingState::Initialized,
                DataSourcingState::DocumentSourcing,
                DataSourcingState::DataVerification,
                DataSourcingState::Done,
            ]
        );
        assert_eq!(DataSourcingState::NonSourceable.next(), None);
    }

    #[test]
    fn test_snapshots_without_version_or_priority_still_decode() {
        let request = Request::open(
            SourcingTriple::new(CompanyId::random(), "sfdr", "2026"),
            UserId::random(),
            None,
            Utc::now(),
        );
        let mut json = serde_json::to_value(&request).unwrap();
        let object = json.as_object_mut().unwrap();
        object.remove("version");
        object.remove("priority");

        let decoded: Request = serde_json::from_value(json).unwrap();
        assert_eq!(decoded.version, 0);
        assert_eq!(decoded.priority, RequestPriority::Normal);
    }

    #[test]
    fn test_terminal_and_active_request_states() {
        assert!(RequestState::Open.is_active());
        assert!(RequestState::Processing.is_active());
        assert!(!RequestState::Processed.is_active());
        assert!(RequestState::Processed.is_terminal());
        assert!(RequestState::Withdrawn.is_terminal());
        assert!(!RequestState::Withdrawn.justifies_charge());
        assert!(RequestState::Processed.justifies_charge());
    }
}

//! Combined request history.
//!
//! A request's history is told from two revision logs: the request's own and
//! that of the data sourcing unit it was folded into. The logs are merged by
//! timestamp, gaps are filled with the last known values, every entry gets a
//! user-facing displayed state, transient entries are dropped and runs of the
//! same displayed state are collapsed to their first entry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::state_machine::state::{
    DataSourcingRevision, DataSourcingState, RequestRevision, RequestState,
};

/// What a requesting user sees as the state of their request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DisplayedState {
    Open,
    Validated,
    DocumentSourcing,
    DataVerification,
    NonSourceable,
    Done,
    Withdrawn,
}

/// Displayed state for a request in `request_state` whose unit is in
/// `data_sourcing_state`.
pub fn displayed_state(
    request_state: RequestState,
    data_sourcing_state: Option<DataSourcingState>,
) -> DisplayedState {
    match (request_state, data_sourcing_state) {
        (RequestState::Withdrawn, _) => DisplayedState::Withdrawn,
        (RequestState::Open, _) | (_, None) => DisplayedState::Open,
        (_, Some(DataSourcingState::Initialized)) => DisplayedState::Validated,
        (_, Some(DataSourcingState::DocumentSourcing)) => DisplayedState::DocumentSourcing,
        (_, Some(DataSourcingState::DataVerification)) => DisplayedState::DataVerification,
        (_, Some(DataSourcingState::NonSourceable)) => DisplayedState::NonSourceable,
        (_, Some(DataSourcingState::Done)) => DisplayedState::Done,
    }
}

/// One entry of the combined history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestHistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub request_state: RequestState,
    pub data_sourcing_state: Option<DataSourcingState>,
    pub admin_comment: Option<String>,
    pub displayed_state: DisplayedState,
}

/// Merged entry before gap filling. Exactly one of the two states is set.
#[derive(Debug)]
struct RawEntry {
    timestamp: DateTime<Utc>,
    from_data_sourcing: bool,
    request_state: Option<RequestState>,
    data_sourcing_state: Option<DataSourcingState>,
    admin_comment: Option<String>,
}

fn combine(
    request_revisions: &[RequestRevision],
    data_sourcing_revisions: &[DataSourcingRevision],
) -> Vec<RawEntry> {
    let Some(first) = request_revisions.first() else {
        return Vec::new();
    };
    let created_at = first.recorded_at;

    let mut entries: Vec<RawEntry> = request_revisions
        .iter()
        .map(|rev| RawEntry {
            timestamp: rev.recorded_at,
            from_data_sourcing: false,
            request_state: Some(rev.snapshot.state),
            data_sourcing_state: None,
            admin_comment: rev.snapshot.admin_comment.clone(),
        })
        .collect();

    // Only state changes of the unit after the request existed matter.
    let mut last_state = None;
    for rev in data_sourcing_revisions {
        if rev.recorded_at < created_at || last_state == Some(rev.snapshot.state) {
            continue;
        }
        last_state = Some(rev.snapshot.state);
        entries.push(RawEntry {
            timestamp: rev.recorded_at,
            from_data_sourcing: true,
            request_state: None,
            data_sourcing_state: Some(rev.snapshot.state),
            admin_comment: None,
        });
    }

    // Stable: revision order is kept within each log, and on a tie the
    // request entry comes first.
    entries.sort_by_key(|entry| (entry.timestamp, entry.from_data_sourcing));
    entries
}

fn fill_gaps(entries: Vec<RawEntry>) -> Vec<RequestHistoryEntry> {
    let mut request_state = RequestState::Open;
    let mut data_sourcing_state = None;
    let mut admin_comment = None;

    entries
        .into_iter()
        .map(|entry| {
            request_state = entry.request_state.unwrap_or(request_state);
            data_sourcing_state = entry.data_sourcing_state.or(data_sourcing_state);
            admin_comment = entry.admin_comment.or(admin_comment.take());
            RequestHistoryEntry {
                timestamp: entry.timestamp,
                request_state,
                data_sourcing_state,
                admin_comment: admin_comment.clone(),
                displayed_state: displayed_state(request_state, data_sourcing_state),
            }
        })
        .collect()
}

/// Entries that only exist for the instant between two writes of one commit.
fn is_transient(entry: &RequestHistoryEntry) -> bool {
    matches!(
        (entry.request_state, entry.data_sourcing_state),
        (RequestState::Processing, None)
            | (RequestState::Processed, Some(DataSourcingState::DataVerification))
    )
}

/// Build the combined history of a request.
///
/// `request_revisions` and `data_sourcing_revisions` must each be ordered
/// oldest first. An empty request log yields an empty history.
pub fn build_request_history(
    request_revisions: &[RequestRevision],
    data_sourcing_revisions: &[DataSourcingRevision],
) -> Vec<RequestHistoryEntry> {
    let mut history: Vec<RequestHistoryEntry> =
        fill_gaps(combine(request_revisions, data_sourcing_revisions))
            .into_iter()
            .filter(|entry| !is_transient(entry))
            .collect();
    history.dedup_by_key(|entry| entry.displayed_state);
    history
}

//! HTTP handlers for the operator read API.
//!
//! Every endpoint except `/health` requires `Authorization: Bearer <token>`
//! matching STATUS_AUTH_TOKEN. Without a configured token the API is off.

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::json;
use sourcing_core::{CompanyId, DataSourcingId, RequestId};
use std::sync::Arc;

use crate::error::SourcingError;
use crate::history::RequestHistoryEntry;
use crate::ledger::{BilledLedgerEntry, CreditsTransaction};
use crate::messaging::DeadLetter;
use crate::repository::RepositoryError;
use crate::state_machine::{DataSourcing, DataSourcingRevision, Request};
use crate::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceResponse {
    pub company_id: CompanyId,
    pub balance: Decimal,
}

/// Validate the authorization header against the status auth token.
///
/// Returns `Ok(())` if authorized, or an error response if not.
#[allow(clippy::result_large_err)] // Response is large but this is idiomatic in Axum handlers
fn validate_auth(headers: &HeaderMap, auth_token: &Option<String>) -> Result<(), Response> {
    let Some(expected_token) = auth_token else {
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            "Operator API is disabled (STATUS_AUTH_TOKEN not configured)",
        )
            .into_response());
    };

    let auth_header = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    match auth_header.and_then(|value| value.strip_prefix("Bearer ")) {
        Some(provided) if provided == expected_token => Ok(()),
        Some(_) => Err((StatusCode::UNAUTHORIZED, "Invalid token").into_response()),
        None if auth_header.is_some() => Err((
            StatusCode::UNAUTHORIZED,
            "Invalid Authorization header format. Expected: Bearer <token>",
        )
            .into_response()),
        None => Err((
            StatusCode::UNAUTHORIZED,
            "Missing Authorization header. Expected: Bearer <token>",
        )
            .into_response()),
    }
}

fn error_response(err: SourcingError) -> Response {
    let status = match &err {
        SourcingError::NotFound { .. } => StatusCode::NOT_FOUND,
        SourcingError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        SourcingError::StateConflict(_) | SourcingError::DuplicateRequest { .. } => {
            StatusCode::CONFLICT
        }
        SourcingError::Repository(e) => {
            tracing::error!("Operator API query failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, Json(json!({ "error": err.to_string() }))).into_response()
}

fn storage_error(err: RepositoryError) -> Response {
    error_response(SourcingError::Repository(err))
}

/// Handler: GET /health
pub async fn health_check() -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "service": "sourcing-server",
        "version": crate::version(),
    }))
}

/// Handler: GET /requests/:id
pub async fn get_request(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<RequestId>,
) -> Result<Json<Request>, Response> {
    validate_auth(&headers, &state.status_auth_token)?;
    state
        .engine
        .get_request(id)
        .await
        .map(Json)
        .map_err(error_response)
}

/// Handler: GET /requests/:id/history
pub async fn get_request_history(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<RequestId>,
) -> Result<Json<Vec<RequestHistoryEntry>>, Response> {
    validate_auth(&headers, &state.status_auth_token)?;
    state
        .engine
        .request_history(id)
        .await
        .map(Json)
        .map_err(error_response)
}

/// Handler: GET /data-sourcings/:id
pub async fn get_data_sourcing(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<DataSourcingId>,
) -> Result<Json<DataSourcing>, Response> {
    validate_auth(&headers, &state.status_auth_token)?;
    state
        .engine
        .get_data_sourcing(id)
        .await
        .map(Json)
        .map_err(error_response)
}

/// Handler: GET /data-sourcings/:id/history
pub async fn get_data_sourcing_history(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<DataSourcingId>,
) -> Result<Json<Vec<DataSourcingRevision>>, Response> {
    validate_auth(&headers, &state.status_auth_token)?;
    state
        .engine
        .data_sourcing_history(id)
        .await
        .map(Json)
        .map_err(error_response)
}

/// Handler: GET /companies/:id/balance
pub async fn get_balance(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(company_id): Path<CompanyId>,
) -> Result<Json<BalanceResponse>, Response> {
    validate_auth(&headers, &state.status_auth_token)?;
    let balance = state
        .ledger
        .balance(company_id)
        .await
        .map_err(storage_error)?;
    Ok(Json(BalanceResponse {
        company_id,
        balance,
    }))
}

/// Handler: GET /companies/:id/billed-entries
pub async fn get_billed_entries(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(company_id): Path<CompanyId>,
) -> Result<Json<Vec<BilledLedgerEntry>>, Response> {
    validate_auth(&headers, &state.status_auth_token)?;
    state
        .ledger
        .billed_entries(company_id)
        .await
        .map(Json)
        .map_err(storage_error)
}

/// Handler: GET /companies/:id/transactions
pub async fn get_transactions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(company_id): Path<CompanyId>,
) -> Result<Json<Vec<CreditsTransaction>>, Response> {
    validate_auth(&headers, &state.status_auth_token)?;
    state
        .ledger
        .transactions(company_id)
        .await
        .map(Json)
        .map_err(storage_error)
}

/// Handler: GET /dead-letters
pub async fn get_dead_letters(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<DeadLetter>>, Response> {
    validate_auth(&headers, &state.status_auth_token)?;
    state
        .dead_letters
        .dead_letters()
        .await
        .map(Json)
        .map_err(storage_error)
}

pub fn operator_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health_check))
        .route("/requests/:id", get(get_request))
        .route("/requests/:id/history", get(get_request_history))
        .route("/data-sourcings/:id", get(get_data_sourcing))
        .route("/data-sourcings/:id/history", get(get_data_sourcing_history))
        .route("/companies/:id/balance", get(get_balance))
        .route("/companies/:id/billed-entries", get(get_billed_entries))
        .route("/companies/:id/transactions", get(get_transactions))
        .route("/dead-letters", get(get_dead_letters))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use sourcing_core::{SourcingTriple, UserId};

    use crate::ledger::CreditsLedger;
    use crate::messaging::InMemoryBroker;
    use crate::repository::InMemoryRepository;
    use crate::state_machine::SourcingEngine;

    fn app_state(token: Option<&str>) -> Arc<AppState> {
        let repo = Arc::new(InMemoryRepository::new());
        Arc::new(AppState {
            engine: Arc::new(SourcingEngine::new(
                repo.clone(),
                Arc::new(InMemoryBroker::new()),
            )),
            ledger: Arc::new(CreditsLedger::new(repo.clone(), Decimal::ONE)),
            dead_letters: repo,
            status_auth_token: token.map(str::to_string),
        })
    }

    fn bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", token)).unwrap(),
        );
        headers
    }

    #[test]
    fn test_validate_auth_disabled_without_token() {
        let err = validate_auth(&bearer("anything"), &None).unwrap_err();
        assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_validate_auth_rejects_wrong_or_missing_token() {
        let token = Some("secret".to_string());
        assert!(validate_auth(&bearer("secret"), &token).is_ok());
        assert_eq!(
            validate_auth(&bearer("guess"), &token).unwrap_err().status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            validate_auth(&HeaderMap::new(), &token).unwrap_err().status(),
            StatusCode::UNAUTHORIZED
        );

        let mut basic = HeaderMap::new();
        basic.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(
            validate_auth(&basic, &token).unwrap_err().status(),
            StatusCode::UNAUTHORIZED
        );
    }

    #[tokio::test]
    async fn test_get_request_found_and_missing() {
        let state = app_state(Some("t"));
        let request = state
            .engine
            .submit_request(
                UserId::random(),
                SourcingTriple::new(CompanyId::random(), "sfdr", "2026"),
                None,
            )
            .await
            .unwrap();

        let Json(found) = get_request(State(state.clone()), bearer("t"), Path(request.id))
            .await
            .unwrap();
        assert_eq!(found, request);

        let missing = get_request(State(state), bearer("t"), Path(RequestId::random()))
            .await
            .unwrap_err();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_balance_of_unknown_company_is_zero() {
        let state = app_state(Some("t"));
        let company = CompanyId::random();
        let Json(body) = get_balance(State(state), bearer("t"), Path(company))
            .await
            .unwrap();
        assert_eq!(body.company_id, company);
        assert_eq!(body.balance, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_handlers_require_auth() {
        let state = app_state(Some("t"));
        let err = get_dead_letters(State(state), HeaderMap::new())
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(
            error_response(SourcingError::InvalidInput("x".into())).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            error_response(SourcingError::StateConflict("x".into())).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            storage_error(RepositoryError::storage("read", "disk gone")).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}

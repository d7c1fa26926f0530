use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path, Query, rejection::JsonRejection},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};

use tally_core::TransactionId;
use tally_infra::CreateStatus;
use tally_ledger::CreateTransactionRequest;

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/", get(list_transactions).post(create_transaction))
        .route("/:id", get(get_transaction))
}

/// 201 for a new transaction, 200 when the idempotency key replays a stored one.
pub async fn create_transaction(
    Extension(services): Extension<Arc<AppServices>>,
    body: Result<Json<dto::CreateTransactionBody>, JsonRejection>,
) -> axum::response::Response {
    let Json(body) = match body {
        Ok(b) => b,
        Err(rejection) => return errors::invalid_json(rejection),
    };
    let request = CreateTransactionRequest::from(body);

    match services.ledger.create_transaction(&request).await {
        Ok(outcome) => {
            let status = match outcome.status {
                CreateStatus::Created => StatusCode::CREATED,
                CreateStatus::Replayed => StatusCode::OK,
            };
            (status, Json(dto::transaction_to_json(&outcome.transaction))).into_response()
        }
        Err(e) => errors::service_error_to_response(e),
    }
}

pub async fn get_transaction(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id: TransactionId = match id.parse() {
        Ok(v) => v,
        Err(_) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid transaction id"),
    };

    match services.ledger.get_transaction(id).await {
        Ok(Some(tx)) => (StatusCode::OK, Json(dto::transaction_to_json(&tx))).into_response(),
        Ok(None) => errors::json_error(StatusCode::NOT_FOUND, "not_found", "transaction not found"),
        Err(e) => errors::service_error_to_response(e),
    }
}

/// Headers only; entries are fetched per transaction.
pub async fn list_transactions(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<dto::ListTransactionsQuery>,
) -> axum::response::Response {
    let (filter, pagination) = match query.into_filter() {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match services.ledger.list_transactions(&filter, pagination).await {
        Ok(headers) => {
            let items = headers.iter().map(dto::header_to_json).collect::<Vec<_>>();
            (StatusCode::OK, Json(serde_json::json!({ "items": items }))).into_response()
        }
        Err(e) => errors::service_error_to_response(e),
    }
}

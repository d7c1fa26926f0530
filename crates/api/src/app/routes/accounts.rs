use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path, rejection::JsonRejection},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};

use tally_core::AccountId;

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/", get(list_accounts).post(create_account))
        .route("/:id", get(get_account).delete(delete_account))
}

pub async fn create_account(
    Extension(services): Extension<Arc<AppServices>>,
    body: Result<Json<dto::CreateAccountBody>, JsonRejection>,
) -> axum::response::Response {
    let Json(body) = match body {
        Ok(b) => b,
        Err(rejection) => return errors::invalid_json(rejection),
    };

    match services
        .ledger
        .create_account(&body.name, &body.account_type, &body.currency)
        .await
    {
        Ok(account) => (StatusCode::CREATED, Json(dto::account_to_json(&account))).into_response(),
        Err(e) => errors::service_error_to_response(e),
    }
}

pub async fn list_accounts(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    match services.ledger.list_accounts().await {
        Ok(accounts) => {
            let items = accounts.iter().map(dto::account_to_json).collect::<Vec<_>>();
            (StatusCode::OK, Json(serde_json::json!({ "items": items }))).into_response()
        }
        Err(e) => errors::service_error_to_response(e),
    }
}

pub async fn get_account(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id: AccountId = match id.parse() {
        Ok(v) => v,
        Err(_) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid account id"),
    };

    match services.ledger.get_account(id).await {
        Ok(Some(account)) => (StatusCode::OK, Json(dto::account_to_json(&account))).into_response(),
        Ok(None) => errors::json_error(StatusCode::NOT_FOUND, "not_found", "account not found"),
        Err(e) => errors::service_error_to_response(e),
    }
}

/// 204 on success, 409 while entries still reference the account.
pub async fn delete_account(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id: AccountId = match id.parse() {
        Ok(v) => v,
        Err(_) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid account id"),
    };

    match services.ledger.delete_account(id).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => errors::json_error(StatusCode::NOT_FOUND, "not_found", "account not found"),
        Err(e) => errors::service_error_to_response(e),
    }
}

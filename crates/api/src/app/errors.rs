use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use tally_infra::ServiceError;
use tally_ledger::RejectionKind;

pub fn service_error_to_response(err: ServiceError) -> axum::response::Response {
    match err {
        ServiceError::Rejected(r) => {
            let status = match r.kind() {
                RejectionKind::Conflict => StatusCode::CONFLICT,
                RejectionKind::Malformed | RejectionKind::Semantic => StatusCode::BAD_REQUEST,
            };
            json_error(status, r.code(), r.to_string())
        }
        ServiceError::InvalidAccount(r) => json_error(StatusCode::BAD_REQUEST, r.code(), r.to_string()),
        ServiceError::AccountInUse(id) => json_error(
            StatusCode::CONFLICT,
            "account_in_use",
            format!("account {id} is referenced by ledger entries"),
        ),
        ServiceError::Timeout(_) => json_error(StatusCode::GATEWAY_TIMEOUT, "timeout", "request timed out"),
        // Already logged with its cause by the service.
        ServiceError::Internal(_) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", "internal error")
        }
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

pub fn invalid_json(rejection: axum::extract::rejection::JsonRejection) -> axum::response::Response {
    json_error(StatusCode::BAD_REQUEST, "invalid_json", rejection.body_text())
}

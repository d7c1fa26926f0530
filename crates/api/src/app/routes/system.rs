use std::sync::Arc;
use std::time::Duration;

use axum::{extract::Extension, http::StatusCode};

use crate::app::services::AppServices;

const READINESS_TIMEOUT: Duration = Duration::from_secs(2);

pub async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

/// Ready when the store answers a ping within two seconds.
pub async fn readyz(Extension(services): Extension<Arc<AppServices>>) -> (StatusCode, &'static str) {
    if services.ledger.ready(READINESS_TIMEOUT).await {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not_ready")
    }
}


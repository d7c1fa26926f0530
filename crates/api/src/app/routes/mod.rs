use axum::Router;

pub mod accounts;
pub mod system;
pub mod transactions;

/// Router for the ledger resources.
pub fn router() -> Router {
    Router::new()
        .nest("/transactions", transactions::router())
        .nest("/accounts", accounts::router())
}

//! Infrastructure layer: persistence backends, the transaction write path and the
//! service that ties validation, writing and idempotent replay together.

pub mod config;
pub mod db;
pub mod idempotency;
pub mod service;
pub mod store;
pub mod writer;

pub use config::{AppConfig, ConfigError, DatabaseConfig};
pub use idempotency::{IdempotencyResolver, ResolveError, RetryPolicy};
pub use service::{CreateOutcome, CreateStatus, LedgerService, LedgerSettings, ServiceError};
pub use store::{
    AccountDirectory, InMemoryAccountDirectory, InMemoryLedgerStore, LedgerStore, Pagination,
    PostgresAccountDirectory, PostgresLedgerStore, StoreError, TransactionFilter, UnitOfWork,
};
pub use writer::{TransactionWriter, WriteError, WriteOutcome};

#[cfg(test)]
mod integration_tests;

#[cfg(test)]
mod postgres_tests;

#[cfg(test)]
pub(crate) mod test_support {
    use chrono::{TimeZone, Utc};

    use tally_core::{AccountId, Currency};
    use tally_ledger::{Source, ValidatedEntry, ValidatedTransaction};

    pub fn nzd() -> Currency {
        Currency::parse("NZD").unwrap()
    }

    /// A validated NZD transaction with an explicit `posted_at`.
    pub fn validated(key: &str, lines: &[(AccountId, i64)]) -> ValidatedTransaction {
        ValidatedTransaction {
            idempotency_key: key.to_string(),
            description: Some("test".to_string()),
            source: Source::Api,
            posted_at: Utc.with_ymd_and_hms(2025, 2, 1, 9, 30, 0).unwrap(),
            posted_at_supplied: true,
            currency: nzd(),
            entries: lines
                .iter()
                .map(|(account_id, amount)| ValidatedEntry {
                    account_id: *account_id,
                    amount: *amount,
                })
                .collect(),
        }
    }
}

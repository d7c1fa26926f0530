//! Persistence boundary for the ledger.
//!
//! The core consumes two collaborators:
//!
//! - [`AccountDirectory`]: resolves account ids to their records (read-only for the core).
//! - [`LedgerStore`]: transactional unit-of-work for writing one header plus its entries,
//!   and the read queries used by the idempotency path and the read API.
//!
//! ## Design Principles
//!
//! - **No storage assumptions**: in-memory (tests/dev) and Postgres (production) backends
//!   implement the same traits
//! - **Backend-neutral conflicts**: uniqueness failures are classified as
//!   [`StoreError::UniqueViolation`] with the violated constraint name, so callers never
//!   inspect driver-specific codes
//! - **All or nothing**: a [`UnitOfWork`] that is dropped without `commit()` rolls back

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use tally_core::{AccountId, TransactionId};
use tally_ledger::{
    Account, LedgerEntry, NewAccount, NewLedgerEntry, NewTransaction, TransactionHeader,
};

pub mod in_memory;
pub mod postgres;

pub use in_memory::{InMemoryAccountDirectory, InMemoryLedgerStore};
pub use postgres::{PostgresAccountDirectory, PostgresLedgerStore};

/// Name of the uniqueness constraint on `transactions.idempotency_key`.
///
/// Both backends report idempotency conflicts under this name.
pub const IDEMPOTENCY_KEY_CONSTRAINT: &str = "transactions_idempotency_key_key";

/// Store operation error.
///
/// These are **infrastructure errors**. Request rejections live in `tally_ledger::Rejection`.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A uniqueness constraint rejected the write.
    #[error("unique constraint violated: {constraint}")]
    UniqueViolation { constraint: String },

    #[error("foreign key violation: {0}")]
    ForeignKeyViolation(String),

    /// The backend could not be reached (pool closed, timed out, IO failure).
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A stored row could not be mapped back into domain types.
    #[error("corrupt row: {0}")]
    Corrupt(String),

    /// The unit of work was used after commit/rollback or out of order.
    #[error("invalid unit of work state: {0}")]
    InvalidState(String),

    #[error("store error in {operation}: {message}")]
    Backend {
        operation: &'static str,
        message: String,
    },
}

impl StoreError {
    /// True only for a uniqueness violation on the idempotency key.
    ///
    /// Other constraint violations are internal errors, never replays.
    pub fn is_idempotency_conflict(&self) -> bool {
        matches!(self, StoreError::UniqueViolation { constraint } if constraint == IDEMPOTENCY_KEY_CONSTRAINT)
    }
}

/// Filters for listing transaction headers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionFilter {
    /// Only transactions with at least one entry on this account.
    pub account_id: Option<AccountId>,
    /// Inclusive lower bound on `posted_at`.
    pub start_date: Option<DateTime<Utc>>,
    /// Inclusive upper bound on `posted_at`.
    pub end_date: Option<DateTime<Utc>>,
}

impl TransactionFilter {
    pub fn matches(&self, header: &TransactionHeader, entries: &[LedgerEntry]) -> bool {
        if let Some(start) = self.start_date {
            if header.posted_at < start {
                return false;
            }
        }
        if let Some(end) = self.end_date {
            if header.posted_at > end {
                return false;
            }
        }
        match self.account_id {
            Some(account_id) => entries.iter().any(|e| e.account_id == account_id),
            None => true,
        }
    }
}

pub const DEFAULT_PAGE_SIZE: u32 = 50;
pub const MAX_PAGE_SIZE: u32 = 200;

/// Limit/offset pagination for list queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    pub limit: u32,
    pub offset: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: DEFAULT_PAGE_SIZE,
            offset: 0,
        }
    }
}

impl Pagination {
    pub fn new(limit: Option<u32>, offset: Option<u32>) -> Self {
        Self {
            limit: limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE),
            offset: offset.unwrap_or(0),
        }
    }
}

/// One open persistence transaction.
///
/// Implementations must roll back when dropped without a successful `commit()`, so a
/// cancelled request never leaves partial state behind.
#[async_trait]
pub trait UnitOfWork: Send {
    /// Insert the transaction header. The store assigns `created_at`.
    async fn insert_header(&mut self, header: &NewTransaction) -> Result<TransactionHeader, StoreError>;

    /// Insert one entry of the header inserted in this unit of work.
    async fn insert_entry(&mut self, entry: &NewLedgerEntry) -> Result<LedgerEntry, StoreError>;

    /// Make every write of this unit of work visible at once.
    async fn commit(&mut self) -> Result<(), StoreError>;

    /// Discard every write of this unit of work.
    async fn rollback(&mut self) -> Result<(), StoreError>;
}

/// Transactional ledger persistence.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, StoreError>;

    /// Committed header for an idempotency key, if any.
    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<TransactionHeader>, StoreError>;

    async fn get_transaction(&self, id: TransactionId) -> Result<Option<TransactionHeader>, StoreError>;

    /// Entries of a transaction in line order.
    async fn list_entries(&self, transaction_id: TransactionId) -> Result<Vec<LedgerEntry>, StoreError>;

    /// Headers matching `filter`, newest `posted_at` first.
    async fn list_transactions(
        &self,
        filter: &TransactionFilter,
        pagination: Pagination,
    ) -> Result<Vec<TransactionHeader>, StoreError>;

    /// Cheap round-trip used by readiness checks.
    async fn ping(&self) -> Result<(), StoreError>;
}

/// Account lookup (and the plumbing to manage accounts).
#[async_trait]
pub trait AccountDirectory: Send + Sync {
    /// Resolve ids to accounts. Unknown ids are simply absent from the map.
    async fn resolve_accounts(&self, ids: &[AccountId]) -> Result<HashMap<AccountId, Account>, StoreError>;

    async fn create_account(&self, account: NewAccount) -> Result<Account, StoreError>;

    async fn get_account(&self, id: AccountId) -> Result<Option<Account>, StoreError>;

    /// All accounts, oldest first.
    async fn list_accounts(&self) -> Result<Vec<Account>, StoreError>;

    /// Remove an account. `Ok(false)` when it does not exist.
    ///
    /// Fails with [`StoreError::ForeignKeyViolation`] while any entry references it.
    async fn delete_account(&self, id: AccountId) -> Result<bool, StoreError>;
}

#[async_trait]
impl<S> LedgerStore for Arc<S>
where
    S: LedgerStore + ?Sized,
{
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, StoreError> {
        (**self).begin().await
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<TransactionHeader>, StoreError> {
        (**self).find_by_idempotency_key(key).await
    }

    async fn get_transaction(&self, id: TransactionId) -> Result<Option<TransactionHeader>, StoreError> {
        (**self).get_transaction(id).await
    }

    async fn list_entries(&self, transaction_id: TransactionId) -> Result<Vec<LedgerEntry>, StoreError> {
        (**self).list_entries(transaction_id).await
    }

    async fn list_transactions(
        &self,
        filter: &TransactionFilter,
        pagination: Pagination,
    ) -> Result<Vec<TransactionHeader>, StoreError> {
        (**self).list_transactions(filter, pagination).await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        (**self).ping().await
    }
}

#[async_trait]
impl<D> AccountDirectory for Arc<D>
where
    D: AccountDirectory + ?Sized,
{
    async fn resolve_accounts(&self, ids: &[AccountId]) -> Result<HashMap<AccountId, Account>, StoreError> {
        (**self).resolve_accounts(ids).await
    }

    async fn create_account(&self, account: NewAccount) -> Result<Account, StoreError> {
        (**self).create_account(account).await
    }

    async fn get_account(&self, id: AccountId) -> Result<Option<Account>, StoreError> {
        (**self).get_account(id).await
    }

    async fn list_accounts(&self) -> Result<Vec<Account>, StoreError> {
        (**self).list_accounts().await
    }

    async fn delete_account(&self, id: AccountId) -> Result<bool, StoreError> {
        (**self).delete_account(id).await
    }
}

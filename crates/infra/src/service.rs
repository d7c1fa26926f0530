//! Transaction service: the create-transaction flow plus the read and account paths
//! used by the HTTP layer.
//!
//! ## Create flow
//!
//! 1. `precheck` (no IO): header fields, entry count, `posted_at`, account id syntax
//! 2. resolve the referenced accounts
//! 3. full validation (existence, currency, overflow, balance)
//! 4. atomic write; a duplicate key goes through the idempotency resolver
//!
//! Steps 2-4 run under the request deadline. Cancelling the future drops any open
//! unit of work, which rolls it back.

use std::time::Duration;

use thiserror::Error;
use tracing::{error, info, instrument, warn};

use tally_core::{AccountId, TransactionId};
use tally_ledger::{
    Account, AccountRejection, CreateTransactionRequest, LedgerLimits, NewAccount,
    PostedTransaction, Rejection, TransactionHeader, ValidatedTransaction, Validator,
};

use crate::idempotency::{IdempotencyResolver, ResolveError, RetryPolicy};
use crate::store::{AccountDirectory, LedgerStore, Pagination, StoreError, TransactionFilter};
use crate::writer::{TransactionWriter, WriteOutcome};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Tunables of the ledger service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerSettings {
    pub limits: LedgerLimits,
    /// Deadline for the store work of one create request.
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            limits: LedgerLimits::default(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            retry: RetryPolicy::default(),
        }
    }
}

/// Whether a create stored something new.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateStatus {
    Created,
    /// The idempotency key was already used for this exact transaction.
    Replayed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateOutcome {
    pub status: CreateStatus,
    pub transaction: PostedTransaction,
}

#[derive(Debug, Error)]
pub enum ServiceError {
    /// The request was refused; nothing was written.
    #[error(transparent)]
    Rejected(#[from] Rejection),

    #[error(transparent)]
    InvalidAccount(#[from] AccountRejection),

    #[error("account {0} is referenced by ledger entries")]
    AccountInUse(AccountId),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// Cause is logged where it happens; callers only see a generic failure.
    #[error("internal error: {0}")]
    Internal(String),
}

fn internal(context: &'static str) -> impl FnOnce(StoreError) -> ServiceError {
    move |e| {
        error!(error = %e, "{context} failed");
        ServiceError::Internal(format!("{context}: {e}"))
    }
}

/// Ledger operations over a store and an account directory.
#[derive(Debug, Clone)]
pub struct LedgerService<S, D> {
    validator: Validator,
    store: S,
    directory: D,
    writer: TransactionWriter<S>,
    resolver: IdempotencyResolver<S>,
    request_timeout: Duration,
}

impl<S, D> LedgerService<S, D>
where
    S: LedgerStore + Clone,
    D: AccountDirectory,
{
    pub fn new(store: S, directory: D, settings: LedgerSettings) -> Self {
        Self {
            validator: Validator::new(settings.limits),
            writer: TransactionWriter::new(store.clone()),
            resolver: IdempotencyResolver::new(store.clone(), settings.retry),
            store,
            directory,
            request_timeout: settings.request_timeout,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn directory(&self) -> &D {
        &self.directory
    }

    /// Create a transaction, or replay the one already stored under its key.
    #[instrument(skip(self, request), fields(idempotency_key = %request.idempotency_key.trim()))]
    pub async fn create_transaction(
        &self,
        request: &CreateTransactionRequest,
    ) -> Result<CreateOutcome, ServiceError> {
        let account_ids = self.validator.precheck(request).map_err(rejected)?;

        match tokio::time::timeout(self.request_timeout, self.create_checked(request, &account_ids)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(timeout_ms = self.request_timeout.as_millis() as u64, "create transaction timed out");
                Err(ServiceError::Timeout(self.request_timeout))
            }
        }
    }

    async fn create_checked(
        &self,
        request: &CreateTransactionRequest,
        account_ids: &[AccountId],
    ) -> Result<CreateOutcome, ServiceError> {
        let accounts = self
            .directory
            .resolve_accounts(account_ids)
            .await
            .map_err(internal("resolve accounts"))?;

        let validated = self.validator.validate(request, &accounts).map_err(rejected)?;

        match self.writer.write(&validated).await {
            Ok(WriteOutcome::Committed(transaction)) => {
                info!(
                    transaction_id = %transaction.id(),
                    entries = transaction.entries.len(),
                    currency = %validated.currency,
                    "transaction created"
                );
                Ok(CreateOutcome {
                    status: CreateStatus::Created,
                    transaction,
                })
            }
            Ok(WriteOutcome::DuplicateKey) => self.replay(&validated).await,
            Err(e) => {
                error!(error = %e, "transaction write failed");
                Err(ServiceError::Internal(e.to_string()))
            }
        }
    }

    async fn replay(&self, validated: &ValidatedTransaction) -> Result<CreateOutcome, ServiceError> {
        match self.resolver.resolve(validated).await {
            Ok(transaction) => {
                info!(transaction_id = %transaction.id(), "transaction replayed");
                Ok(CreateOutcome {
                    status: CreateStatus::Replayed,
                    transaction,
                })
            }
            Err(ResolveError::KeyReused(rejection)) => Err(rejected(rejection)),
            Err(e) => {
                error!(error = %e, "idempotent replay failed");
                Err(ServiceError::Internal(e.to_string()))
            }
        }
    }

    /// Header plus entries, `None` when no such transaction exists.
    pub async fn get_transaction(&self, id: TransactionId) -> Result<Option<PostedTransaction>, ServiceError> {
        let Some(header) = self
            .store
            .get_transaction(id)
            .await
            .map_err(internal("get transaction"))?
        else {
            return Ok(None);
        };
        let entries = self
            .store
            .list_entries(id)
            .await
            .map_err(internal("list entries"))?;
        Ok(Some(PostedTransaction { header, entries }))
    }

    pub async fn list_transactions(
        &self,
        filter: &TransactionFilter,
        pagination: Pagination,
    ) -> Result<Vec<TransactionHeader>, ServiceError> {
        self.store
            .list_transactions(filter, pagination)
            .await
            .map_err(internal("list transactions"))
    }

    /// Create an account from raw input (trimmed; type and currency validated).
    pub async fn create_account(
        &self,
        name: &str,
        account_type: &str,
        currency: &str,
    ) -> Result<Account, ServiceError> {
        let new_account = NewAccount::from_raw(name, account_type, currency).inspect_err(|r| {
            warn!(code = r.code(), "account rejected");
        })?;
        let account = self
            .directory
            .create_account(new_account)
            .await
            .map_err(internal("create account"))?;
        info!(account_id = %account.id, currency = %account.currency, "account created");
        Ok(account)
    }

    pub async fn get_account(&self, id: AccountId) -> Result<Option<Account>, ServiceError> {
        self.directory.get_account(id).await.map_err(internal("get account"))
    }

    pub async fn list_accounts(&self) -> Result<Vec<Account>, ServiceError> {
        self.directory.list_accounts().await.map_err(internal("list accounts"))
    }

    /// Delete an account no entry references. `Ok(false)` when it does not exist.
    pub async fn delete_account(&self, id: AccountId) -> Result<bool, ServiceError> {
        match self.directory.delete_account(id).await {
            Ok(deleted) => {
                if deleted {
                    info!(account_id = %id, "account deleted");
                }
                Ok(deleted)
            }
            Err(StoreError::ForeignKeyViolation(reason)) => {
                warn!(account_id = %id, %reason, "account still referenced");
                Err(ServiceError::AccountInUse(id))
            }
            Err(e) => Err(internal("delete account")(e)),
        }
    }

    /// Store round-trip bounded by `timeout`.
    pub async fn ready(&self, timeout: Duration) -> bool {
        match tokio::time::timeout(timeout, self.store.ping()).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!(error = %e, "readiness check failed");
                false
            }
            Err(_) => {
                warn!("readiness check timed out");
                false
            }
        }
    }
}

fn rejected(rejection: Rejection) -> ServiceError {
    warn!(code = rejection.code(), reason = %rejection, "transaction rejected");
    ServiceError::Rejected(rejection)
}

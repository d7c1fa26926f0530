//! Postgres-backed ledger store and account directory.
//!
//! ## Error Mapping
//!
//! SQLx errors are mapped to `StoreError` as follows:
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError | Scenario |
//! |------------|----------------------|------------|----------|
//! | Database (unique violation) | `23505` | `UniqueViolation { constraint }` | Duplicate idempotency key (or other unique index) |
//! | Database (foreign key violation) | `23503` | `ForeignKeyViolation` | Entry references a missing account/transaction |
//! | Database (other) | Any other | `Backend` | Check constraints, syntax, etc. |
//! | PoolClosed / PoolTimedOut / Io | N/A | `Unavailable` | Connection problems |
//! | Other | N/A | `Backend` | Decode errors and the rest |
//!
//! Only this module knows about error codes; callers use
//! [`StoreError::is_idempotency_conflict`].
//!
//! ## Atomicity
//!
//! `begin()` opens a SQL transaction that lives inside the returned unit of work. SQLx
//! rolls the transaction back when it is dropped without commit, which also covers
//! request cancellation.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::instrument;

use tally_core::{AccountId, Currency, EntryId, TransactionId};
use tally_ledger::{
    Account, AccountType, LedgerEntry, NewAccount, NewLedgerEntry, NewTransaction, Source,
    TransactionHeader,
};

use super::{
    AccountDirectory, LedgerStore, Pagination, StoreError, TransactionFilter, UnitOfWork,
};

/// Postgres-backed ledger store.
///
/// Uses SQLx connection pool which is thread-safe (Arc + Send + Sync).
#[derive(Debug, Clone)]
pub struct PostgresLedgerStore {
    pool: Arc<PgPool>,
}

impl PostgresLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

struct PgUnitOfWork {
    tx: Option<Transaction<'static, Postgres>>,
}

impl PgUnitOfWork {
    fn tx(&mut self) -> Result<&mut Transaction<'static, Postgres>, StoreError> {
        self.tx
            .as_mut()
            .ok_or_else(|| StoreError::InvalidState("unit of work already finished".to_string()))
    }
}

#[async_trait]
impl UnitOfWork for PgUnitOfWork {
    #[instrument(skip(self, header), fields(transaction_id = %header.id), err)]
    async fn insert_header(&mut self, header: &NewTransaction) -> Result<TransactionHeader, StoreError> {
        let tx = self.tx()?;
        let row = sqlx::query(
            r#"
            INSERT INTO transactions (
                id,
                idempotency_key,
                description,
                source,
                posted_at
            )
            VALUES ($1, $2, $3, $4, $5)
            RETURNING posted_at, created_at
            "#,
        )
        .bind(header.id.as_uuid())
        .bind(&header.idempotency_key)
        .bind(header.description.as_deref())
        .bind(header.source.as_str())
        .bind(header.posted_at)
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("insert_header", e))?;

        // Echo what was stored, so the created view matches later reads.
        let posted_at: DateTime<Utc> = row.try_get("posted_at").map_err(|e| corrupt("posted_at", e))?;
        let created_at: DateTime<Utc> = row.try_get("created_at").map_err(|e| corrupt("created_at", e))?;

        Ok(TransactionHeader {
            id: header.id,
            idempotency_key: header.idempotency_key.clone(),
            description: header.description.clone(),
            source: header.source,
            posted_at,
            created_at,
        })
    }

    #[instrument(skip(self, entry), fields(transaction_id = %entry.transaction_id, line_no = entry.line_no), err)]
    async fn insert_entry(&mut self, entry: &NewLedgerEntry) -> Result<LedgerEntry, StoreError> {
        let tx = self.tx()?;
        sqlx::query(
            r#"
            INSERT INTO ledger_entries (
                id,
                transaction_id,
                account_id,
                amount_minor,
                currency,
                line_no
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(entry.id.as_uuid())
        .bind(entry.transaction_id.as_uuid())
        .bind(entry.account_id.as_uuid())
        .bind(entry.amount)
        .bind(entry.currency.as_str())
        .bind(entry.line_no as i32)
        .execute(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("insert_entry", e))?;

        Ok(entry.clone().into_entry())
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        let tx = self
            .tx
            .take()
            .ok_or_else(|| StoreError::InvalidState("unit of work already finished".to_string()))?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        let tx = self
            .tx
            .take()
            .ok_or_else(|| StoreError::InvalidState("unit of work already finished".to_string()))?;
        tx.rollback()
            .await
            .map_err(|e| map_sqlx_error("rollback", e))
    }
}

#[async_trait]
impl LedgerStore for PostgresLedgerStore {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, StoreError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        Ok(Box::new(PgUnitOfWork { tx: Some(tx) }))
    }

    #[instrument(skip(self), err)]
    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<TransactionHeader>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, idempotency_key, description, source, posted_at, created_at
            FROM transactions
            WHERE idempotency_key = $1
            "#,
        )
        .bind(key)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_by_idempotency_key", e))?;

        row.as_ref().map(header_from_row).transpose()
    }

    #[instrument(skip(self), fields(transaction_id = %id), err)]
    async fn get_transaction(&self, id: TransactionId) -> Result<Option<TransactionHeader>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, idempotency_key, description, source, posted_at, created_at
            FROM transactions
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_transaction", e))?;

        row.as_ref().map(header_from_row).transpose()
    }

    #[instrument(skip(self), fields(transaction_id = %transaction_id), err)]
    async fn list_entries(&self, transaction_id: TransactionId) -> Result<Vec<LedgerEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, transaction_id, account_id, amount_minor, currency, line_no
            FROM ledger_entries
            WHERE transaction_id = $1
            ORDER BY line_no ASC
            "#,
        )
        .bind(transaction_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_entries", e))?;

        rows.iter().map(entry_from_row).collect()
    }

    #[instrument(skip(self), err)]
    async fn list_transactions(
        &self,
        filter: &TransactionFilter,
        pagination: Pagination,
    ) -> Result<Vec<TransactionHeader>, StoreError> {
        let account_param: Option<uuid::Uuid> = filter.account_id.map(|id| *id.as_uuid());

        let rows = sqlx::query(
            r#"
            SELECT t.id, t.idempotency_key, t.description, t.source, t.posted_at, t.created_at
            FROM transactions t
            WHERE ($1::uuid IS NULL OR EXISTS (
                    SELECT 1 FROM ledger_entries e
                    WHERE e.transaction_id = t.id AND e.account_id = $1
                ))
                AND ($2::timestamptz IS NULL OR t.posted_at >= $2)
                AND ($3::timestamptz IS NULL OR t.posted_at <= $3)
            ORDER BY t.posted_at DESC, t.created_at DESC, t.id DESC
            LIMIT $4 OFFSET $5
            "#,
        )
        .bind(account_param)
        .bind(filter.start_date)
        .bind(filter.end_date)
        .bind(pagination.limit as i64)
        .bind(pagination.offset as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_transactions", e))?;

        rows.iter().map(header_from_row).collect()
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&*self.pool)
            .await
            .map(|_| ())
            .map_err(|e| map_sqlx_error("ping", e))
    }
}

/// Postgres-backed account directory.
#[derive(Debug, Clone)]
pub struct PostgresAccountDirectory {
    pool: Arc<PgPool>,
}

impl PostgresAccountDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait]
impl AccountDirectory for PostgresAccountDirectory {
    #[instrument(skip(self, ids), fields(count = ids.len()), err)]
    async fn resolve_accounts(&self, ids: &[AccountId]) -> Result<HashMap<AccountId, Account>, StoreError> {
        let uuids: Vec<uuid::Uuid> = ids.iter().map(|id| *id.as_uuid()).collect();
        let rows = sqlx::query(
            r#"
            SELECT id, name, type, currency, created_at, updated_at
            FROM accounts
            WHERE id = ANY($1)
            "#,
        )
        .bind(&uuids)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("resolve_accounts", e))?;

        let mut resolved = HashMap::with_capacity(rows.len());
        for row in &rows {
            let account = account_from_row(row)?;
            resolved.insert(account.id, account);
        }
        Ok(resolved)
    }

    #[instrument(skip(self, account), err)]
    async fn create_account(&self, account: NewAccount) -> Result<Account, StoreError> {
        let id = AccountId::new();
        let row = sqlx::query(
            r#"
            INSERT INTO accounts (id, name, type, currency)
            VALUES ($1, $2, $3, $4)
            RETURNING id, name, type, currency, created_at, updated_at
            "#,
        )
        .bind(id.as_uuid())
        .bind(&account.name)
        .bind(account.account_type.as_str())
        .bind(account.currency.as_str())
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("create_account", e))?;

        account_from_row(&row)
    }

    async fn get_account(&self, id: AccountId) -> Result<Option<Account>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, name, type, currency, created_at, updated_at
            FROM accounts
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_account", e))?;

        row.as_ref().map(account_from_row).transpose()
    }

    async fn list_accounts(&self) -> Result<Vec<Account>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, type, currency, created_at, updated_at
            FROM accounts
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_accounts", e))?;

        rows.iter().map(account_from_row).collect()
    }

    #[instrument(skip(self), fields(account_id = %id), err)]
    async fn delete_account(&self, id: AccountId) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM accounts WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_account", e))?;

        Ok(result.rows_affected() > 0)
    }
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &'static str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().map(|c| c.into_owned());
            match code.as_deref() {
                // unique_violation
                Some("23505") => StoreError::UniqueViolation {
                    constraint: db_err.constraint().unwrap_or("unknown").to_string(),
                },
                // foreign_key_violation
                Some("23503") => StoreError::ForeignKeyViolation(format!(
                    "{} in {}",
                    db_err.constraint().unwrap_or("unknown"),
                    operation
                )),
                _ => StoreError::Backend {
                    operation,
                    message: db_err.message().to_string(),
                },
            }
        }
        sqlx::Error::PoolClosed => StoreError::Unavailable(format!("connection pool closed in {operation}")),
        sqlx::Error::PoolTimedOut => StoreError::Unavailable(format!("connection pool timed out in {operation}")),
        sqlx::Error::Io(e) => StoreError::Unavailable(format!("io error in {operation}: {e}")),
        other => StoreError::Backend {
            operation,
            message: other.to_string(),
        },
    }
}

fn corrupt(what: &str, e: impl core::fmt::Display) -> StoreError {
    StoreError::Corrupt(format!("failed to read {what}: {e}"))
}

fn header_from_row(row: &sqlx::postgres::PgRow) -> Result<TransactionHeader, StoreError> {
    let id: uuid::Uuid = row.try_get("id").map_err(|e| corrupt("id", e))?;
    let source: String = row.try_get("source").map_err(|e| corrupt("source", e))?;
    Ok(TransactionHeader {
        id: TransactionId::from_uuid(id),
        idempotency_key: row
            .try_get("idempotency_key")
            .map_err(|e| corrupt("idempotency_key", e))?,
        description: row.try_get("description").map_err(|e| corrupt("description", e))?,
        source: Source::parse(&source).ok_or_else(|| corrupt("source", &source))?,
        posted_at: row.try_get("posted_at").map_err(|e| corrupt("posted_at", e))?,
        created_at: row.try_get("created_at").map_err(|e| corrupt("created_at", e))?,
    })
}

fn entry_from_row(row: &sqlx::postgres::PgRow) -> Result<LedgerEntry, StoreError> {
    let id: uuid::Uuid = row.try_get("id").map_err(|e| corrupt("id", e))?;
    let transaction_id: uuid::Uuid = row
        .try_get("transaction_id")
        .map_err(|e| corrupt("transaction_id", e))?;
    let account_id: uuid::Uuid = row.try_get("account_id").map_err(|e| corrupt("account_id", e))?;
    let currency: String = row.try_get("currency").map_err(|e| corrupt("currency", e))?;
    let line_no: i32 = row.try_get("line_no").map_err(|e| corrupt("line_no", e))?;

    Ok(LedgerEntry {
        id: EntryId::from_uuid(id),
        transaction_id: TransactionId::from_uuid(transaction_id),
        account_id: AccountId::from_uuid(account_id),
        amount: row.try_get("amount_minor").map_err(|e| corrupt("amount_minor", e))?,
        currency: Currency::parse(&currency).map_err(|e| corrupt("currency", e))?,
        line_no: u32::try_from(line_no).map_err(|e| corrupt("line_no", e))?,
    })
}

fn account_from_row(row: &sqlx::postgres::PgRow) -> Result<Account, StoreError> {
    let id: uuid::Uuid = row.try_get("id").map_err(|e| corrupt("id", e))?;
    let account_type: String = row.try_get("type").map_err(|e| corrupt("type", e))?;
    let currency: String = row.try_get("currency").map_err(|e| corrupt("currency", e))?;

    Ok(Account {
        id: AccountId::from_uuid(id),
        name: row.try_get("name").map_err(|e| corrupt("name", e))?,
        account_type: AccountType::parse(&account_type).ok_or_else(|| corrupt("type", &account_type))?,
        currency: Currency::parse(&currency).map_err(|e| corrupt("currency", e))?,
        created_at: row.try_get("created_at").map_err(|e| corrupt("created_at", e))?,
        updated_at: row.try_get("updated_at").map_err(|e| corrupt("updated_at", e))?,
    })
}

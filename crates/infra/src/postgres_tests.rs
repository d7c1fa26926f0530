//! Service-level tests against a live Postgres.
//!
//! Each test connects through `DATABASE_URL` and returns early when it is unset, so the
//! suite stays green on machines without a database. Keys and accounts are unique per
//! run; the tests share whatever database they are pointed at.
//!
//! Verifies:
//! - Created, replayed and fetched views of a transaction are identical
//! - Sequential and concurrent replays resolve to one stored row
//! - SQLSTATE 23505 on the idempotency index surfaces as an idempotency conflict
//! - SQLSTATE 23503 surfaces as a foreign key violation / `account_in_use`

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use sqlx::PgPool;
use tokio::sync::OnceCell;

use tally_core::{AccountId, Currency, EntryId, TransactionId};
use tally_ledger::{CreateTransactionRequest, EntryRequest, NewLedgerEntry, NewTransaction, Source};

use crate::config::DatabaseConfig;
use crate::db;
use crate::service::{CreateStatus, LedgerService, LedgerSettings, ServiceError};
use crate::store::{
    LedgerStore, PostgresAccountDirectory, PostgresLedgerStore, StoreError, UnitOfWork,
};

type PgService = LedgerService<PostgresLedgerStore, PostgresAccountDirectory>;

// Concurrent `CREATE TABLE IF NOT EXISTS` can still collide, so bootstrap once.
static SCHEMA: OnceCell<()> = OnceCell::const_new();

async fn pool() -> Option<PgPool> {
    let Some(url) = std::env::var("DATABASE_URL").ok().filter(|u| !u.trim().is_empty()) else {
        eprintln!("DATABASE_URL not set; skipping postgres test");
        return None;
    };
    let config = DatabaseConfig {
        url,
        min_connections: 1,
        max_connections: 10,
        max_lifetime: Duration::from_secs(60),
    };
    let pool = db::connect(&config).await.expect("connect to postgres");
    SCHEMA
        .get_or_init(|| async { db::migrate(&pool).await.expect("apply ledger schema") })
        .await;
    Some(pool)
}

async fn setup() -> Option<(Arc<PgService>, AccountId, AccountId)> {
    let pool = pool().await?;
    let service = LedgerService::new(
        PostgresLedgerStore::new(pool.clone()),
        PostgresAccountDirectory::new(pool),
        LedgerSettings::default(),
    );
    let cash = service.create_account("Cash", "asset", "NZD").await.unwrap();
    let rent = service.create_account("Rent", "expense", "NZD").await.unwrap();
    Some((Arc::new(service), cash.id, rent.id))
}

fn unique_key(label: &str) -> String {
    format!("{label}-{}", TransactionId::new())
}

fn request(key: &str, lines: &[(AccountId, i64)]) -> CreateTransactionRequest {
    CreateTransactionRequest {
        idempotency_key: key.to_string(),
        description: "Monthly rent".to_string(),
        source: "api".to_string(),
        posted_at: None,
        entries: lines
            .iter()
            .map(|(account_id, amount)| EntryRequest {
                account_id: account_id.to_string(),
                amount: *amount,
            })
            .collect(),
    }
}

#[tokio::test]
async fn created_replayed_and_fetched_views_match() {
    let Some((service, a, b)) = setup().await else { return };

    // Defaulted posted_at: "now" carries nanoseconds on most platforms.
    let req = request(&unique_key("now"), &[(a, 500), (b, -500)]);
    let first = service.create_transaction(&req).await.unwrap();
    let second = service.create_transaction(&req).await.unwrap();
    assert_eq!(first.status, CreateStatus::Created);
    assert_eq!(second.status, CreateStatus::Replayed);
    assert_eq!(first.transaction, second.transaction);

    let fetched = service.get_transaction(first.transaction.id()).await.unwrap().unwrap();
    assert_eq!(fetched, first.transaction);
}

#[tokio::test]
async fn supplied_sub_microsecond_posted_at_replays() {
    let Some((service, a, b)) = setup().await else { return };

    let mut req = request(&unique_key("y2k"), &[(a, 500), (b, -500)]);
    req.posted_at = Some("1999-12-31T23:59:59.0000005Z".to_string());

    let first = service.create_transaction(&req).await.unwrap();
    let second = service.create_transaction(&req).await.unwrap();
    assert_eq!(second.status, CreateStatus::Replayed);
    assert_eq!(first.transaction, second.transaction);
    assert_eq!(
        first.transaction.header.posted_at,
        Utc.with_ymd_and_hms(1999, 12, 31, 23, 59, 59).unwrap()
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_submissions_store_exactly_one_row() {
    let Some((service, a, b)) = setup().await else { return };
    let req = request(&unique_key("burst"), &[(a, 1_000), (b, -1_000)]);

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let service = service.clone();
            let req = req.clone();
            tokio::spawn(async move { service.create_transaction(&req).await })
        })
        .collect();

    let mut outcomes = Vec::new();
    for handle in handles {
        outcomes.push(handle.await.unwrap().unwrap());
    }

    let created = outcomes
        .iter()
        .filter(|o| o.status == CreateStatus::Created)
        .count();
    assert_eq!(created, 1);
    let id = outcomes[0].transaction.id();
    assert!(outcomes.iter().all(|o| o.transaction.id() == id));
}

#[tokio::test]
async fn constraint_violations_are_classified() {
    let Some((service, a, b)) = setup().await else { return };
    let key = unique_key("taken");
    service
        .create_transaction(&request(&key, &[(a, 5), (b, -5)]))
        .await
        .unwrap();

    // 23505 on the idempotency index.
    let mut uow = service.store().begin().await.unwrap();
    let err = uow
        .insert_header(&NewTransaction {
            id: TransactionId::new(),
            idempotency_key: key,
            description: None,
            source: Source::Manual,
            posted_at: Utc::now(),
        })
        .await
        .unwrap_err();
    assert!(err.is_idempotency_conflict(), "unexpected error: {err:?}");
    uow.rollback().await.unwrap();

    // 23503 on an entry that points at no account.
    let mut uow = service.store().begin().await.unwrap();
    let header = NewTransaction {
        id: TransactionId::new(),
        idempotency_key: unique_key("orphan"),
        description: None,
        source: Source::Manual,
        posted_at: Utc::now(),
    };
    uow.insert_header(&header).await.unwrap();
    let err = uow
        .insert_entry(&NewLedgerEntry {
            id: EntryId::new(),
            transaction_id: header.id,
            account_id: AccountId::new(),
            amount: 1,
            currency: Currency::parse("NZD").unwrap(),
            line_no: 0,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::ForeignKeyViolation(_)), "unexpected error: {err:?}");
    assert!(!err.is_idempotency_conflict());
    drop(uow);

    // The same foreign key guards account deletion.
    let err = service.delete_account(a).await.unwrap_err();
    assert!(matches!(err, ServiceError::AccountInUse(id) if id == a));

    let spare = service.create_account("Spare", "asset", "NZD").await.unwrap();
    assert!(service.delete_account(spare.id).await.unwrap());
    assert!(!service.delete_account(spare.id).await.unwrap());
}

#[tokio::test]
async fn unstorable_text_is_rejected_before_the_database() {
    let Some((service, a, b)) = setup().await else { return };

    let mut req = request("nul\0key", &[(a, 5), (b, -5)]);
    let err = service.create_transaction(&req).await.unwrap_err();
    assert!(matches!(err, ServiceError::Rejected(ref r) if r.code() == "invalid_characters"));

    req.idempotency_key = unique_key("nul-description");
    req.description = "rent\0".to_string();
    let err = service.create_transaction(&req).await.unwrap_err();
    assert!(matches!(err, ServiceError::Rejected(ref r) if r.code() == "invalid_characters"));
}

//! Service-level tests against the in-memory backend.
//!
//! Verifies:
//! - Replays (sequential and concurrent) resolve to one stored transaction
//! - The created and replayed views carry identical, microsecond-precision timestamps
//! - Rejected requests write nothing, and malformed ones never reach the directory
//! - A failure mid-write leaves no partial transaction behind
//! - The request deadline bounds the store work of a create

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};

use tally_core::{AccountId, TransactionId};
use tally_ledger::{
    Account, CreateTransactionRequest, EntryRequest, LedgerEntry, NewAccount, NewLedgerEntry,
    NewTransaction, Rejection, TransactionHeader,
};

use crate::service::{CreateStatus, LedgerService, LedgerSettings, ServiceError};
use crate::store::{
    AccountDirectory, InMemoryAccountDirectory, InMemoryLedgerStore, LedgerStore, Pagination,
    StoreError, TransactionFilter, UnitOfWork,
};

async fn nzd_accounts(directory: &InMemoryAccountDirectory) -> (AccountId, AccountId) {
    let cash = directory
        .create_account(NewAccount::from_raw("Cash", "asset", "NZD").unwrap())
        .await
        .unwrap();
    let rent = directory
        .create_account(NewAccount::from_raw("Rent", "expense", "NZD").unwrap())
        .await
        .unwrap();
    (cash.id, rent.id)
}

async fn setup() -> (
    Arc<LedgerService<InMemoryLedgerStore, Arc<InMemoryAccountDirectory>>>,
    InMemoryLedgerStore,
    AccountId,
    AccountId,
) {
    let store = InMemoryLedgerStore::new();
    let directory = Arc::new(InMemoryAccountDirectory::linked_to(&store));
    let (a, b) = nzd_accounts(&directory).await;
    let service = LedgerService::new(store.clone(), directory, LedgerSettings::default());
    (Arc::new(service), store, a, b)
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

fn rejection_code(err: ServiceError) -> &'static str {
    match err {
        ServiceError::Rejected(r) => r.code(),
        other => panic!("expected a rejection, got {other:?}"),
    }
}

#[tokio::test]
async fn resubmission_returns_the_stored_transaction() {
    let (service, store, a, b) = setup().await;
    let req = request("rent-2025-03", &[(a, 500), (b, -500)]);

    let first = service.create_transaction(&req).await.unwrap();
    let second = service.create_transaction(&req).await.unwrap();

    assert_eq!(first.status, CreateStatus::Created);
    assert_eq!(second.status, CreateStatus::Replayed);
    assert_eq!(first.transaction, second.transaction);
    assert_eq!(first.transaction.sum(), 0);
    assert_eq!(store.transaction_count(), 1);
}

#[tokio::test]
async fn sub_microsecond_posted_at_replays_identically() {
    let (service, _store, a, b) = setup().await;

    let mut supplied = request("y2k", &[(a, 500), (b, -500)]);
    supplied.posted_at = Some("1999-12-31T23:59:59.0000005Z".to_string());
    let first = service.create_transaction(&supplied).await.unwrap();
    let second = service.create_transaction(&supplied).await.unwrap();
    assert_eq!(second.status, CreateStatus::Replayed);
    assert_eq!(first.transaction, second.transaction);
    assert_eq!(
        first.transaction.header.posted_at,
        Utc.with_ymd_and_hms(1999, 12, 31, 23, 59, 59).unwrap()
    );

    // Defaulted to "now": still whole microseconds, so every view agrees.
    let defaulted = request("today", &[(a, 7), (b, -7)]);
    let created = service.create_transaction(&defaulted).await.unwrap().transaction;
    assert_eq!(created.header.posted_at.timestamp_subsec_nanos() % 1_000, 0);
    let fetched = service.get_transaction(created.id()).await.unwrap().unwrap();
    assert_eq!(fetched, created);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_submissions_store_exactly_one_transaction() {
    let (service, store, a, b) = setup().await;
    let req = request("burst", &[(a, 1_000), (b, -1_000)]);

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
    assert_eq!(store.transaction_count(), 1);
}

#[tokio::test]
async fn reusing_a_key_for_another_payload_is_rejected() {
    let (service, store, a, b) = setup().await;
    service
        .create_transaction(&request("k", &[(a, 500), (b, -500)]))
        .await
        .unwrap();

    let err = service
        .create_transaction(&request("k", &[(a, 700), (b, -700)]))
        .await
        .unwrap_err();

    assert_eq!(rejection_code(err), "idempotency_key_reused");
    assert_eq!(store.transaction_count(), 1);
}

#[tokio::test]
async fn rejected_requests_write_nothing() {
    let (service, store, a, b) = setup().await;
    let ghost = AccountId::new();

    let err = service
        .create_transaction(&request("ghost", &[(a, 10), (ghost, -10)]))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Rejected(Rejection::AccountNotFound(id)) if id == ghost));

    let err = service
        .create_transaction(&request("unbalanced", &[(a, 500), (b, -300)]))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Rejected(Rejection::NotBalanced { sum: 200 })));

    let err = service
        .create_transaction(&request("overflow", &[(a, i64::MAX), (b, 1), (a, -1)]))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Rejected(Rejection::AmountOverflow { index: 1 })));

    assert_eq!(store.transaction_count(), 0);
    assert!(store.find_by_idempotency_key("overflow").await.unwrap().is_none());
    assert!(store.find_by_idempotency_key("ghost").await.unwrap().is_none());
}

#[tokio::test]
async fn currency_mismatch_is_rejected() {
    let (service, store, a, _) = setup().await;
    let aud = service
        .create_account("Travel", "expense", "aud")
        .await
        .unwrap();

    let err = service
        .create_transaction(&request("fx", &[(a, 100), (aud.id, -100)]))
        .await
        .unwrap_err();
    assert_eq!(rejection_code(err), "currency_mismatch");
    assert_eq!(store.transaction_count(), 0);
}

/// Counts lookups so tests can assert the directory was never consulted.
struct CountingDirectory {
    inner: InMemoryAccountDirectory,
    lookups: AtomicUsize,
}

#[async_trait]
impl AccountDirectory for CountingDirectory {
    async fn resolve_accounts(&self, ids: &[AccountId]) -> Result<HashMap<AccountId, Account>, StoreError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.inner.resolve_accounts(ids).await
    }

    async fn create_account(&self, account: NewAccount) -> Result<Account, StoreError> {
        self.inner.create_account(account).await
    }

    async fn get_account(&self, id: AccountId) -> Result<Option<Account>, StoreError> {
        self.inner.get_account(id).await
    }

    async fn list_accounts(&self) -> Result<Vec<Account>, StoreError> {
        self.inner.list_accounts().await
    }

    async fn delete_account(&self, id: AccountId) -> Result<bool, StoreError> {
        self.inner.delete_account(id).await
    }
}

#[tokio::test]
async fn malformed_requests_never_reach_the_directory() {
    let directory = Arc::new(CountingDirectory {
        inner: InMemoryAccountDirectory::new(),
        lookups: AtomicUsize::new(0),
    });
    let (a, b) = nzd_accounts(&directory.inner).await;
    let service = LedgerService::new(
        InMemoryLedgerStore::new(),
        directory.clone(),
        LedgerSettings::default(),
    );

    let single = request("one", &[(a, 0)]);
    let mut too_many = request("many", &[]);
    too_many.entries = (0..101)
        .map(|i| EntryRequest {
            account_id: if i % 2 == 0 { a } else { b }.to_string(),
            amount: 0,
        })
        .collect();
    let mut bad_id = request("bad-id", &[(a, 1), (b, -1)]);
    bad_id.entries[1].account_id = "not-a-uuid".to_string();
    let mut bad_source = request("bad-source", &[(a, 1), (b, -1)]);
    bad_source.source = "fax".to_string();
    let mut bad_date = request("bad-date", &[(a, 1), (b, -1)]);
    bad_date.posted_at = Some("yesterday".to_string());

    let mut codes = Vec::new();
    for req in [single, too_many, bad_id, bad_source, bad_date] {
        codes.push(rejection_code(service.create_transaction(&req).await.unwrap_err()));
    }

    assert_eq!(
        codes,
        vec![
            "too_few_entries",
            "too_many_entries",
            "invalid_account_id",
            "invalid_source",
            "invalid_posted_at"
        ]
    );
    assert_eq!(directory.lookups.load(Ordering::SeqCst), 0);

    service
        .create_transaction(&request("ok", &[(a, 1), (b, -1)]))
        .await
        .unwrap();
    assert_eq!(directory.lookups.load(Ordering::SeqCst), 1);
}

/// Ledger store whose units of work fail on a chosen entry while `armed`.
struct FailingStore {
    inner: InMemoryLedgerStore,
    fail_at_line: u32,
    armed: Arc<AtomicBool>,
}

struct FailingUnitOfWork {
    inner: Box<dyn UnitOfWork>,
    fail_at_line: u32,
    armed: bool,
}

#[async_trait]
impl UnitOfWork for FailingUnitOfWork {
    async fn insert_header(&mut self, header: &NewTransaction) -> Result<TransactionHeader, StoreError> {
        self.inner.insert_header(header).await
    }

    async fn insert_entry(&mut self, entry: &NewLedgerEntry) -> Result<LedgerEntry, StoreError> {
        if self.armed && entry.line_no == self.fail_at_line {
            return Err(StoreError::Backend {
                operation: "insert_entry",
                message: "injected failure".to_string(),
            });
        }
        self.inner.insert_entry(entry).await
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        self.inner.commit().await
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        self.inner.rollback().await
    }
}

#[async_trait]
impl LedgerStore for FailingStore {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, StoreError> {
        Ok(Box::new(FailingUnitOfWork {
            inner: self.inner.begin().await?,
            fail_at_line: self.fail_at_line,
            armed: self.armed.load(Ordering::SeqCst),
        }))
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<TransactionHeader>, StoreError> {
        self.inner.find_by_idempotency_key(key).await
    }

    async fn get_transaction(&self, id: TransactionId) -> Result<Option<TransactionHeader>, StoreError> {
        self.inner.get_transaction(id).await
    }

    async fn list_entries(&self, transaction_id: TransactionId) -> Result<Vec<LedgerEntry>, StoreError> {
        self.inner.list_entries(transaction_id).await
    }

    async fn list_transactions(
        &self,
        filter: &TransactionFilter,
        pagination: Pagination,
    ) -> Result<Vec<TransactionHeader>, StoreError> {
        self.inner.list_transactions(filter, pagination).await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.inner.ping().await
    }
}

#[tokio::test]
async fn entry_failure_leaves_no_partial_transaction() {
    let inner = InMemoryLedgerStore::new();
    let armed = Arc::new(AtomicBool::new(true));
    let store = Arc::new(FailingStore {
        inner: inner.clone(),
        fail_at_line: 2,
        armed: armed.clone(),
    });
    let directory = Arc::new(InMemoryAccountDirectory::new());
    let (a, b) = nzd_accounts(&directory).await;
    let service = LedgerService::new(store, directory, LedgerSettings::default());

    let req = request("atomic", &[(a, 100), (b, -50), (b, -50)]);
    let err = service.create_transaction(&req).await.unwrap_err();
    assert!(matches!(err, ServiceError::Internal(_)));
    assert_eq!(inner.transaction_count(), 0);
    assert!(inner.find_by_idempotency_key("atomic").await.unwrap().is_none());

    // The key was never taken, so a retry succeeds as a fresh create.
    armed.store(false, Ordering::SeqCst);
    let outcome = service.create_transaction(&req).await.unwrap();
    assert_eq!(outcome.status, CreateStatus::Created);
    assert_eq!(outcome.transaction.entries.len(), 3);
    assert_eq!(inner.transaction_count(), 1);
}

/// Account directory that never answers in time.
struct SlowDirectory;

#[async_trait]
impl AccountDirectory for SlowDirectory {
    async fn resolve_accounts(&self, _ids: &[AccountId]) -> Result<HashMap<AccountId, Account>, StoreError> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(HashMap::new())
    }

    async fn create_account(&self, _account: NewAccount) -> Result<Account, StoreError> {
        Err(StoreError::Unavailable("slow".to_string()))
    }

    async fn get_account(&self, _id: AccountId) -> Result<Option<Account>, StoreError> {
        Ok(None)
    }

    async fn list_accounts(&self) -> Result<Vec<Account>, StoreError> {
        Ok(Vec::new())
    }

    async fn delete_account(&self, _id: AccountId) -> Result<bool, StoreError> {
        Ok(false)
    }
}

#[tokio::test(start_paused = true)]
async fn create_is_bounded_by_the_request_deadline() {
    let store = InMemoryLedgerStore::new();
    let settings = LedgerSettings {
        request_timeout: Duration::from_millis(250),
        ..LedgerSettings::default()
    };
    let service = LedgerService::new(store.clone(), SlowDirectory, settings);

    let req = request("slow", &[(AccountId::new(), 5), (AccountId::new(), -5)]);
    let err = service.create_transaction(&req).await.unwrap_err();

    assert!(matches!(err, ServiceError::Timeout(d) if d == Duration::from_millis(250)));
    assert_eq!(store.transaction_count(), 0);
}

#[tokio::test]
async fn read_paths_return_stored_transactions() {
    let (service, _store, a, b) = setup().await;
    let (c, _) = nzd_accounts(service.directory()).await;

    let mut first = request("first", &[(a, 500), (b, -500)]);
    first.posted_at = Some("2025-01-10T00:00:00Z".to_string());
    let mut second = request("second", &[(c, 80), (b, -80)]);
    second.posted_at = Some("2025-02-10T00:00:00Z".to_string());

    let first = service.create_transaction(&first).await.unwrap().transaction;
    let second = service.create_transaction(&second).await.unwrap().transaction;

    let fetched = service.get_transaction(first.id()).await.unwrap().unwrap();
    assert_eq!(fetched, first);
    assert!(service.get_transaction(TransactionId::new()).await.unwrap().is_none());

    let all = service
        .list_transactions(&TransactionFilter::default(), Pagination::default())
        .await
        .unwrap();
    assert_eq!(
        all.iter().map(|h| h.id).collect::<Vec<_>>(),
        vec![second.id(), first.id()]
    );

    let only_a = service
        .list_transactions(
            &TransactionFilter {
                account_id: Some(a),
                ..TransactionFilter::default()
            },
            Pagination::default(),
        )
        .await
        .unwrap();
    assert_eq!(only_a.len(), 1);
    assert_eq!(only_a[0].id, first.id());

    let from_february = service
        .list_transactions(
            &TransactionFilter {
                start_date: Some(second.header.posted_at),
                ..TransactionFilter::default()
            },
            Pagination::default(),
        )
        .await
        .unwrap();
    assert_eq!(from_february.len(), 1);
    assert_eq!(from_february[0].id, second.id());
}

#[tokio::test]
async fn account_plumbing() {
    let (service, _store, a, _) = setup().await;

    let err = service.create_account("Bank", "asset", "XYZ").await.unwrap_err();
    assert!(matches!(err, ServiceError::InvalidAccount(ref r) if r.code() == "invalid_currency"));

    let err = service.create_account("Bank", "revenue", "NZD").await.unwrap_err();
    assert!(matches!(err, ServiceError::InvalidAccount(ref r) if r.code() == "invalid_account_type"));

    let err = service.create_account("  ", "asset", "NZD").await.unwrap_err();
    assert!(matches!(err, ServiceError::InvalidAccount(ref r) if r.code() == "missing_fields"));

    assert_eq!(service.get_account(a).await.unwrap().unwrap().name, "Cash");
    assert!(service.get_account(AccountId::new()).await.unwrap().is_none());
    assert_eq!(service.list_accounts().await.unwrap().len(), 2);
    assert!(service.ready(Duration::from_secs(2)).await);
}

#[tokio::test]
async fn referenced_accounts_cannot_be_deleted() {
    let (service, _store, a, b) = setup().await;
    let spare = service.create_account("Spare", "asset", "NZD").await.unwrap();

    service
        .create_transaction(&request("uses-a", &[(a, 50), (b, -50)]))
        .await
        .unwrap();

    let err = service.delete_account(a).await.unwrap_err();
    assert!(matches!(err, ServiceError::AccountInUse(id) if id == a));
    assert!(service.get_account(a).await.unwrap().is_some());

    assert!(service.delete_account(spare.id).await.unwrap());
    assert!(service.get_account(spare.id).await.unwrap().is_none());
    assert!(!service.delete_account(spare.id).await.unwrap());
}

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::Utc;

use tally_core::{AccountId, TransactionId};
use tally_ledger::{
    Account, LedgerEntry, NewAccount, NewLedgerEntry, NewTransaction, TransactionHeader,
};

use super::{
    AccountDirectory, IDEMPOTENCY_KEY_CONSTRAINT, LedgerStore, Pagination, StoreError,
    TransactionFilter, UnitOfWork,
};

#[derive(Debug, Default)]
struct LedgerState {
    headers: HashMap<TransactionId, TransactionHeader>,
    entries: HashMap<TransactionId, Vec<LedgerEntry>>,
    by_key: HashMap<String, TransactionId>,
    /// Keys claimed by open units of work (emulates a row lock on the unique index).
    pending_keys: HashSet<String>,
}

fn poisoned() -> StoreError {
    StoreError::Backend {
        operation: "lock",
        message: "lock poisoned".to_string(),
    }
}

/// In-memory ledger store.
///
/// Intended for tests/dev. Writes are staged inside the unit of work and published to
/// the shared state in one step on commit, so readers never see partial transactions.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLedgerStore {
    state: Arc<RwLock<LedgerState>>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of committed transactions.
    pub fn transaction_count(&self) -> usize {
        self.state.read().map(|s| s.headers.len()).unwrap_or(0)
    }
}

struct InMemoryUnitOfWork {
    state: Arc<RwLock<LedgerState>>,
    header: Option<TransactionHeader>,
    entries: Vec<LedgerEntry>,
    claimed_key: Option<String>,
    finished: bool,
}

impl InMemoryUnitOfWork {
    fn release_claim(&mut self) {
        if let Some(key) = self.claimed_key.take() {
            if let Ok(mut state) = self.state.write() {
                state.pending_keys.remove(&key);
            }
        }
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.finished {
            return Err(StoreError::InvalidState("unit of work already finished".to_string()));
        }
        Ok(())
    }
}

impl Drop for InMemoryUnitOfWork {
    fn drop(&mut self) {
        // Dropping without commit behaves like a rollback.
        self.release_claim();
    }
}

#[async_trait]
impl UnitOfWork for InMemoryUnitOfWork {
    async fn insert_header(&mut self, header: &NewTransaction) -> Result<TransactionHeader, StoreError> {
        self.ensure_open()?;
        if self.header.is_some() {
            return Err(StoreError::InvalidState("header already inserted".to_string()));
        }

        let mut state = self.state.write().map_err(|_| poisoned())?;
        if state.headers.contains_key(&header.id) {
            return Err(StoreError::UniqueViolation {
                constraint: "transactions_pkey".to_string(),
            });
        }
        if state.by_key.contains_key(&header.idempotency_key)
            || state.pending_keys.contains(&header.idempotency_key)
        {
            return Err(StoreError::UniqueViolation {
                constraint: IDEMPOTENCY_KEY_CONSTRAINT.to_string(),
            });
        }
        state.pending_keys.insert(header.idempotency_key.clone());
        drop(state);

        self.claimed_key = Some(header.idempotency_key.clone());
        let stored = TransactionHeader {
            id: header.id,
            idempotency_key: header.idempotency_key.clone(),
            description: header.description.clone(),
            source: header.source,
            posted_at: header.posted_at,
            created_at: Utc::now(),
        };
        self.header = Some(stored.clone());
        Ok(stored)
    }

    async fn insert_entry(&mut self, entry: &NewLedgerEntry) -> Result<LedgerEntry, StoreError> {
        self.ensure_open()?;
        match &self.header {
            Some(h) if h.id == entry.transaction_id => {}
            _ => {
                return Err(StoreError::ForeignKeyViolation(format!(
                    "transaction {} not inserted in this unit of work",
                    entry.transaction_id
                )));
            }
        }
        if self.entries.iter().any(|e| e.line_no == entry.line_no) {
            return Err(StoreError::UniqueViolation {
                constraint: "ledger_entries_line_key".to_string(),
            });
        }

        let stored = entry.clone().into_entry();
        self.entries.push(stored.clone());
        Ok(stored)
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.finished = true;

        let Some(header) = self.header.take() else {
            return Ok(());
        };
        let entries = std::mem::take(&mut self.entries);

        let mut state = self.state.write().map_err(|_| poisoned())?;
        state.pending_keys.remove(&header.idempotency_key);
        state.by_key.insert(header.idempotency_key.clone(), header.id);
        state.entries.insert(header.id, entries);
        state.headers.insert(header.id, header);
        drop(state);

        self.claimed_key = None;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.finished = true;
        self.header = None;
        self.entries.clear();
        self.release_claim();
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, StoreError> {
        Ok(Box::new(InMemoryUnitOfWork {
            state: self.state.clone(),
            header: None,
            entries: Vec::new(),
            claimed_key: None,
            finished: false,
        }))
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<TransactionHeader>, StoreError> {
        let state = self.state.read().map_err(|_| poisoned())?;
        Ok(state
            .by_key
            .get(key)
            .and_then(|id| state.headers.get(id))
            .cloned())
    }

    async fn get_transaction(&self, id: TransactionId) -> Result<Option<TransactionHeader>, StoreError> {
        let state = self.state.read().map_err(|_| poisoned())?;
        Ok(state.headers.get(&id).cloned())
    }

    async fn list_entries(&self, transaction_id: TransactionId) -> Result<Vec<LedgerEntry>, StoreError> {
        let state = self.state.read().map_err(|_| poisoned())?;
        let mut entries = state.entries.get(&transaction_id).cloned().unwrap_or_default();
        entries.sort_by_key(|e| e.line_no);
        Ok(entries)
    }

    async fn list_transactions(
        &self,
        filter: &TransactionFilter,
        pagination: Pagination,
    ) -> Result<Vec<TransactionHeader>, StoreError> {
        let state = self.state.read().map_err(|_| poisoned())?;
        let mut matching: Vec<TransactionHeader> = state
            .headers
            .values()
            .filter(|h| {
                let entries = state.entries.get(&h.id).map(Vec::as_slice).unwrap_or(&[]);
                filter.matches(h, entries)
            })
            .cloned()
            .collect();

        matching.sort_by(|a, b| {
            b.posted_at
                .cmp(&a.posted_at)
                .then(b.created_at.cmp(&a.created_at))
                .then(b.id.cmp(&a.id))
        });

        Ok(matching
            .into_iter()
            .skip(pagination.offset as usize)
            .take(pagination.limit as usize)
            .collect())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.state.read().map(|_| ()).map_err(|_| poisoned())
    }
}

/// In-memory account directory for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryAccountDirectory {
    accounts: RwLock<HashMap<AccountId, Account>>,
    /// Committed entries of a linked store; deleting a referenced account is refused.
    ledger: Option<Arc<RwLock<LedgerState>>>,
}

impl InMemoryAccountDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Directory that protects accounts referenced by entries committed to `store`,
    /// as the foreign key on `ledger_entries.account_id` does in Postgres.
    pub fn linked_to(store: &InMemoryLedgerStore) -> Self {
        Self {
            accounts: RwLock::default(),
            ledger: Some(store.state.clone()),
        }
    }

    /// Seed an existing account record (keeps its id and timestamps).
    pub fn insert(&self, account: Account) {
        if let Ok(mut map) = self.accounts.write() {
            map.insert(account.id, account);
        }
    }
}

#[async_trait]
impl AccountDirectory for InMemoryAccountDirectory {
    async fn resolve_accounts(&self, ids: &[AccountId]) -> Result<HashMap<AccountId, Account>, StoreError> {
        let map = self.accounts.read().map_err(|_| poisoned())?;
        Ok(ids
            .iter()
            .filter_map(|id| map.get(id).map(|a| (*id, a.clone())))
            .collect())
    }

    async fn create_account(&self, account: NewAccount) -> Result<Account, StoreError> {
        let now = Utc::now();
        let created = Account {
            id: AccountId::new(),
            name: account.name,
            account_type: account.account_type,
            currency: account.currency,
            created_at: now,
            updated_at: now,
        };
        let mut map = self.accounts.write().map_err(|_| poisoned())?;
        map.insert(created.id, created.clone());
        Ok(created)
    }

    async fn get_account(&self, id: AccountId) -> Result<Option<Account>, StoreError> {
        let map = self.accounts.read().map_err(|_| poisoned())?;
        Ok(map.get(&id).cloned())
    }

    async fn list_accounts(&self) -> Result<Vec<Account>, StoreError> {
        let map = self.accounts.read().map_err(|_| poisoned())?;
        let mut accounts: Vec<Account> = map.values().cloned().collect();
        accounts.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(accounts)
    }

    async fn delete_account(&self, id: AccountId) -> Result<bool, StoreError> {
        // Held across the removal so a commit cannot slip in between.
        let ledger = match &self.ledger {
            Some(ledger) => Some(ledger.read().map_err(|_| poisoned())?),
            None => None,
        };
        if let Some(state) = &ledger {
            if state.entries.values().flatten().any(|e| e.account_id == id) {
                return Err(StoreError::ForeignKeyViolation(format!(
                    "ledger_entries_account_id_fkey: account {id} is referenced"
                )));
            }
        }
        let mut map = self.accounts.write().map_err(|_| poisoned())?;
        Ok(map.remove(&id).is_some())
    }
}

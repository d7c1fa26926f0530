//! Transaction request validation.
//!
//! Pure and deterministic: no IO, no clock reads except in [`Validator::validate`],
//! which defaults `posted_at` to the current time. Checks run in a fixed order and the
//! first failure wins, so callers always get the same [`Rejection`] for the same input.

use std::collections::HashMap;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use tally_core::{AccountId, Currency, EntryId, TransactionId};

use crate::account::Account;
use crate::transaction::{NewLedgerEntry, NewTransaction, Source};

pub const DEFAULT_MAX_ENTRIES: usize = 100;
pub const DEFAULT_MAX_STRING_LENGTH: usize = 500;
pub const MIN_ENTRIES: usize = 2;

/// Size limits applied by the validator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerLimits {
    pub max_entries: usize,
    /// Applies to the idempotency key and the description (in characters).
    pub max_string_length: usize,
}

impl Default for LedgerLimits {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_MAX_ENTRIES,
            max_string_length: DEFAULT_MAX_STRING_LENGTH,
        }
    }
}

/// One requested line, as received.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryRequest {
    pub account_id: String,
    /// Signed amount in minor units.
    pub amount: i64,
}

/// Raw request to create a transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateTransactionRequest {
    pub idempotency_key: String,
    pub description: String,
    pub source: String,
    /// RFC 3339 timestamp; empty or absent means "now".
    pub posted_at: Option<String>,
    pub entries: Vec<EntryRequest>,
}

/// Broad category of a rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionKind {
    /// Structural problem with the payload.
    Malformed,
    /// Well-formed, but violates a ledger rule.
    Semantic,
    /// The idempotency key already belongs to a different transaction.
    Conflict,
}

/// Why a transaction request was refused. Each variant has a stable [`code`](Rejection::code).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Rejection {
    #[error("missing idempotency_key")]
    MissingIdempotencyKey,

    #[error("idempotency_key too long (max {max} characters)")]
    IdempotencyKeyTooLong { max: usize },

    #[error("description too long (max {max} characters)")]
    DescriptionTooLong { max: usize },

    #[error("{field} contains control characters")]
    ControlCharacters { field: &'static str },

    #[error("invalid source '{0}' (must be manual, csv, or api)")]
    InvalidSource(String),

    #[error("transaction must have at least {min} entries (got {found})")]
    TooFewEntries { min: usize, found: usize },

    #[error("too many entries (max {max}, got {found})")]
    TooManyEntries { max: usize, found: usize },

    #[error("invalid posted_at '{0}' (use RFC3339)")]
    InvalidPostedAt(String),

    #[error("invalid account_id '{value}' at entry {index}")]
    InvalidAccountId { index: usize, value: String },

    #[error("account not found: {0}")]
    AccountNotFound(AccountId),

    #[error("all accounts must share one currency (expected {expected}, account {account_id} is {found})")]
    CurrencyMismatch {
        expected: Currency,
        found: Currency,
        account_id: AccountId,
    },

    #[error("transaction amount overflow at entry {index}")]
    AmountOverflow { index: usize },

    #[error("transaction is not balanced (sum is {sum}, must be 0)")]
    NotBalanced { sum: i64 },

    #[error("idempotency_key '{key}' was already used for a different transaction ({field} differs)")]
    IdempotencyKeyReused { key: String, field: &'static str },
}

impl Rejection {
    pub fn code(&self) -> &'static str {
        match self {
            Rejection::MissingIdempotencyKey => "missing_idempotency_key",
            Rejection::IdempotencyKeyTooLong { .. } => "idempotency_key_too_long",
            Rejection::DescriptionTooLong { .. } => "description_too_long",
            Rejection::ControlCharacters { .. } => "invalid_characters",
            Rejection::InvalidSource(_) => "invalid_source",
            Rejection::TooFewEntries { .. } => "too_few_entries",
            Rejection::TooManyEntries { .. } => "too_many_entries",
            Rejection::InvalidPostedAt(_) => "invalid_posted_at",
            Rejection::InvalidAccountId { .. } => "invalid_account_id",
            Rejection::AccountNotFound(_) => "account_not_found",
            Rejection::CurrencyMismatch { .. } => "currency_mismatch",
            Rejection::AmountOverflow { .. } => "amount_overflow",
            Rejection::NotBalanced { .. } => "not_balanced",
            Rejection::IdempotencyKeyReused { .. } => "idempotency_key_reused",
        }
    }

    pub fn kind(&self) -> RejectionKind {
        match self {
            Rejection::AccountNotFound(_)
            | Rejection::CurrencyMismatch { .. }
            | Rejection::AmountOverflow { .. }
            | Rejection::NotBalanced { .. } => RejectionKind::Semantic,
            Rejection::IdempotencyKeyReused { .. } => RejectionKind::Conflict,
            _ => RejectionKind::Malformed,
        }
    }
}

/// One validated line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidatedEntry {
    pub account_id: AccountId,
    pub amount: i64,
}

/// A normalized request that passed every check and is ready to be persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedTransaction {
    pub idempotency_key: String,
    pub description: Option<String>,
    pub source: Source,
    pub posted_at: DateTime<Utc>,
    /// False when `posted_at` was defaulted to the validation time.
    pub posted_at_supplied: bool,
    pub currency: Currency,
    pub entries: Vec<ValidatedEntry>,
}

impl ValidatedTransaction {
    pub fn new_transaction(&self, id: TransactionId) -> NewTransaction {
        NewTransaction {
            id,
            idempotency_key: self.idempotency_key.clone(),
            description: self.description.clone(),
            source: self.source,
            posted_at: self.posted_at,
        }
    }

    /// Entry rows for `transaction_id`, in request order, all in the common currency.
    pub fn new_entries(&self, transaction_id: TransactionId) -> Vec<NewLedgerEntry> {
        self.entries
            .iter()
            .enumerate()
            .map(|(line_no, e)| NewLedgerEntry {
                id: EntryId::new(),
                transaction_id,
                account_id: e.account_id,
                amount: e.amount,
                currency: self.currency,
                line_no: line_no as u32,
            })
            .collect()
    }
}

struct NormalizedHeader {
    idempotency_key: String,
    description: Option<String>,
    source: Source,
}

/// Validates transaction requests against [`LedgerLimits`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Validator {
    limits: LedgerLimits,
}

impl Validator {
    pub fn new(limits: LedgerLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> LedgerLimits {
        self.limits
    }

    /// Checks that need no account lookup.
    ///
    /// Returns the distinct account ids to resolve, in first-seen order. A request that
    /// fails here must never reach the account directory or the store.
    pub fn precheck(&self, request: &CreateTransactionRequest) -> Result<Vec<AccountId>, Rejection> {
        self.check_header(request)?;
        self.check_entry_count(request.entries.len())?;
        parse_posted_at(request.posted_at.as_deref(), Utc::now())?;

        let ids = parse_account_ids(request)?;
        let mut distinct = Vec::with_capacity(ids.len());
        for id in ids {
            if !distinct.contains(&id) {
                distinct.push(id);
            }
        }
        Ok(distinct)
    }

    /// Full validation, defaulting `posted_at` to the current time.
    pub fn validate(
        &self,
        request: &CreateTransactionRequest,
        accounts: &HashMap<AccountId, Account>,
    ) -> Result<ValidatedTransaction, Rejection> {
        self.validate_at(request, accounts, Utc::now())
    }

    /// Full validation with an explicit "now".
    pub fn validate_at(
        &self,
        request: &CreateTransactionRequest,
        accounts: &HashMap<AccountId, Account>,
        now: DateTime<Utc>,
    ) -> Result<ValidatedTransaction, Rejection> {
        let header = self.check_header(request)?;
        self.check_entry_count(request.entries.len())?;
        let (posted_at, posted_at_supplied) = parse_posted_at(request.posted_at.as_deref(), now)?;

        let account_ids = parse_account_ids(request)?;

        let mut resolved = Vec::with_capacity(account_ids.len());
        for id in &account_ids {
            let account = accounts.get(id).ok_or(Rejection::AccountNotFound(*id))?;
            resolved.push(account);
        }

        // The first entry's account fixes the transaction currency.
        let currency = resolved[0].currency;
        for account in &resolved[1..] {
            if account.currency != currency {
                return Err(Rejection::CurrencyMismatch {
                    expected: currency,
                    found: account.currency,
                    account_id: account.id,
                });
            }
        }

        let mut sum: i64 = 0;
        for (index, entry) in request.entries.iter().enumerate() {
            sum = sum
                .checked_add(entry.amount)
                .ok_or(Rejection::AmountOverflow { index })?;
        }
        if sum != 0 {
            return Err(Rejection::NotBalanced { sum });
        }

        let entries = account_ids
            .into_iter()
            .zip(&request.entries)
            .map(|(account_id, e)| ValidatedEntry {
                account_id,
                amount: e.amount,
            })
            .collect();

        Ok(ValidatedTransaction {
            idempotency_key: header.idempotency_key,
            description: header.description,
            source: header.source,
            posted_at,
            posted_at_supplied,
            currency,
            entries,
        })
    }

    fn check_header(&self, request: &CreateTransactionRequest) -> Result<NormalizedHeader, Rejection> {
        let max = self.limits.max_string_length;

        let idempotency_key = request.idempotency_key.trim();
        if idempotency_key.is_empty() {
            return Err(Rejection::MissingIdempotencyKey);
        }
        if idempotency_key.chars().count() > max {
            return Err(Rejection::IdempotencyKeyTooLong { max });
        }
        if idempotency_key.chars().any(char::is_control) {
            return Err(Rejection::ControlCharacters {
                field: "idempotency_key",
            });
        }

        let description = request.description.trim();
        if description.chars().count() > max {
            return Err(Rejection::DescriptionTooLong { max });
        }
        // Line breaks and tabs are fine in free text; NUL and the rest are not storable.
        if description
            .chars()
            .any(|c| c.is_control() && !matches!(c, '\n' | '\r' | '\t'))
        {
            return Err(Rejection::ControlCharacters {
                field: "description",
            });
        }

        let source_raw = request.source.trim().to_lowercase();
        let source = Source::parse(&source_raw).ok_or(Rejection::InvalidSource(source_raw))?;

        Ok(NormalizedHeader {
            idempotency_key: idempotency_key.to_string(),
            description: (!description.is_empty()).then(|| description.to_string()),
            source,
        })
    }

    fn check_entry_count(&self, found: usize) -> Result<(), Rejection> {
        if found < MIN_ENTRIES {
            return Err(Rejection::TooFewEntries {
                min: MIN_ENTRIES,
                found,
            });
        }
        if found > self.limits.max_entries {
            return Err(Rejection::TooManyEntries {
                max: self.limits.max_entries,
                found,
            });
        }
        Ok(())
    }
}

/// Truncate to whole microseconds, the resolution the store keeps.
///
/// Normalizing here means the value handed to the store is exactly representable, so
/// the created, fetched and replayed views of a transaction carry the same `posted_at`.
pub fn to_stored_precision(t: DateTime<Utc>) -> DateTime<Utc> {
    t.trunc_subsecs(6)
}

fn parse_posted_at(raw: Option<&str>, now: DateTime<Utc>) -> Result<(DateTime<Utc>, bool), Rejection> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok((to_stored_precision(now), false)),
        Some(s) => DateTime::parse_from_rfc3339(s)
            .map(|t| (to_stored_precision(t.with_timezone(&Utc)), true))
            .map_err(|_| Rejection::InvalidPostedAt(s.to_string())),
    }
}

fn parse_account_ids(request: &CreateTransactionRequest) -> Result<Vec<AccountId>, Rejection> {
    request
        .entries
        .iter()
        .enumerate()
        .map(|(index, e)| {
            e.account_id
                .parse::<AccountId>()
                .map_err(|_| Rejection::InvalidAccountId {
                    index,
                    value: e.account_id.clone(),
                })
        })
        .collect()
}

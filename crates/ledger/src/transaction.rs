//! Transaction headers and ledger entries.
//!
//! A transaction and its entries are written together, exactly once per idempotency
//! key, and never change afterwards.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tally_core::{AccountId, Currency, EntryId, TransactionId};

/// Where a transaction came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Manual,
    Csv,
    Api,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Manual => "manual",
            Source::Csv => "csv",
            Source::Api => "api",
        }
    }

    /// Parse an already-normalized (trimmed, lowercase) wire name.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "manual" => Some(Source::Manual),
            "csv" => Some(Source::Csv),
            "api" => Some(Source::Api),
            _ => None,
        }
    }
}

impl core::fmt::Display for Source {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stored transaction header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionHeader {
    pub id: TransactionId,
    pub idempotency_key: String,
    pub description: Option<String>,
    pub source: Source,
    pub posted_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Stored ledger entry (one line of a transaction).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: EntryId,
    pub transaction_id: TransactionId,
    pub account_id: AccountId,
    /// Signed amount in minor units (e.g. cents).
    pub amount: i64,
    pub currency: Currency,
    /// Position of the entry within its transaction (0-based).
    pub line_no: u32,
}

/// A header together with all of its entries, in line order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostedTransaction {
    pub header: TransactionHeader,
    pub entries: Vec<LedgerEntry>,
}

impl PostedTransaction {
    pub fn id(&self) -> TransactionId {
        self.header.id
    }

    /// Common currency of the entries (`None` only for a header without entries).
    pub fn currency(&self) -> Option<Currency> {
        self.entries.first().map(|e| e.currency)
    }

    /// Sum of entry amounts, widened so it cannot overflow.
    pub fn sum(&self) -> i128 {
        self.entries.iter().map(|e| e.amount as i128).sum()
    }
}

/// Header row to insert. The store assigns `created_at`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTransaction {
    pub id: TransactionId,
    pub idempotency_key: String,
    pub description: Option<String>,
    pub source: Source,
    pub posted_at: DateTime<Utc>,
}

/// Entry row to insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewLedgerEntry {
    pub id: EntryId,
    pub transaction_id: TransactionId,
    pub account_id: AccountId,
    pub amount: i64,
    pub currency: Currency,
    pub line_no: u32,
}

impl NewLedgerEntry {
    pub fn into_entry(self) -> LedgerEntry {
        LedgerEntry {
            id: self.id,
            transaction_id: self.transaction_id,
            account_id: self.account_id,
            amount: self.amount,
            currency: self.currency,
            line_no: self.line_no,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_parse_is_exact() {
        assert_eq!(Source::parse("csv"), Some(Source::Csv));
        assert_eq!(Source::parse("CSV"), None);
        assert_eq!(Source::parse("bank"), None);
    }

    #[test]
    fn sum_is_widened() {
        let tx_id = TransactionId::new();
        let nzd = Currency::parse("NZD").unwrap();
        let line = |amount: i64, line_no: u32| LedgerEntry {
            id: EntryId::new(),
            transaction_id: tx_id,
            account_id: AccountId::new(),
            amount,
            currency: nzd,
            line_no,
        };
        let now = Utc::now();
        let posted = PostedTransaction {
            header: TransactionHeader {
                id: tx_id,
                idempotency_key: "k".to_string(),
                description: None,
                source: Source::Api,
                posted_at: now,
                created_at: now,
            },
            entries: vec![line(i64::MAX, 0), line(i64::MAX, 1)],
        };
        assert_eq!(posted.sum(), 2 * i64::MAX as i128);
        assert_eq!(posted.currency(), Some(nzd));
        assert_eq!(posted.id(), tx_id);
    }
}

//! Accounts as seen by the ledger: identity, currency and type.
//!
//! The ledger never mutates accounts. Balances are not stored here; they are derived
//! from entries by whoever needs them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use tally_core::{AccountId, Currency};

/// High-level account type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountType {
    Asset,
    Liability,
    Expense,
    Income,
    Equity,
}

impl AccountType {
    pub const ALL: [AccountType; 5] = [
        AccountType::Asset,
        AccountType::Liability,
        AccountType::Expense,
        AccountType::Income,
        AccountType::Equity,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AccountType::Asset => "asset",
            AccountType::Liability => "liability",
            AccountType::Expense => "expense",
            AccountType::Income => "income",
            AccountType::Equity => "equity",
        }
    }

    /// Case-insensitive parse of the lowercase wire name.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim().to_lowercase();
        Self::ALL.into_iter().find(|t| t.as_str() == s)
    }
}

impl core::fmt::Display for AccountType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Account record owned by the account directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub name: String,
    pub account_type: AccountType,
    pub currency: Currency,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Validated input for creating an account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAccount {
    pub name: String,
    pub account_type: AccountType,
    pub currency: Currency,
}

/// Why an account could not be created.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AccountRejection {
    #[error("missing fields (name, type and currency are required)")]
    MissingFields,

    #[error("invalid account type '{0}' (must be asset, liability, expense, income, or equity)")]
    InvalidType(String),

    #[error("invalid currency '{0}'")]
    InvalidCurrency(String),

    #[error("account name contains control characters")]
    InvalidName,
}

impl AccountRejection {
    pub fn code(&self) -> &'static str {
        match self {
            AccountRejection::MissingFields => "missing_fields",
            AccountRejection::InvalidType(_) => "invalid_account_type",
            AccountRejection::InvalidCurrency(_) => "invalid_currency",
            AccountRejection::InvalidName => "invalid_name",
        }
    }
}

impl NewAccount {
    /// Normalize raw strings (trim, case) and validate them.
    pub fn from_raw(name: &str, account_type: &str, currency: &str) -> Result<Self, AccountRejection> {
        let name = name.trim();
        let account_type = account_type.trim();
        let currency = currency.trim();

        if name.is_empty() || account_type.is_empty() || currency.is_empty() {
            return Err(AccountRejection::MissingFields);
        }
        if name.chars().any(char::is_control) {
            return Err(AccountRejection::InvalidName);
        }

        let parsed_type = AccountType::parse(account_type)
            .ok_or_else(|| AccountRejection::InvalidType(account_type.to_string()))?;
        let parsed_currency = Currency::parse(currency)
            .map_err(|_| AccountRejection::InvalidCurrency(currency.to_string()))?;

        Ok(Self {
            name: name.to_string(),
            account_type: parsed_type,
            currency: parsed_currency,
        })
    }
}

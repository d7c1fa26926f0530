//! Domain error model.

use thiserror::Error;

/// Domain-level error raised while constructing primitive values.
///
/// Request-level rejections have their own richer type in `tally-ledger`; this one
/// covers parse failures of the building blocks themselves.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A currency code is not part of the supported ISO 4217 set.
    #[error("invalid currency code: {0}")]
    InvalidCurrency(String),
}

impl DomainError {
    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn invalid_currency(code: impl Into<String>) -> Self {
        Self::InvalidCurrency(code.into())
    }
}

//! Ledger domain: accounts, transactions and the rules that every posted
//! transaction obeys (double-entry balance, single currency, bounded size).
//!
//! Pure domain logic only: no IO, no HTTP, no persistence concerns.

pub mod account;
pub mod replay;
pub mod transaction;
pub mod validation;

pub use account::{Account, AccountRejection, AccountType, NewAccount};
pub use replay::ensure_same_payload;
pub use transaction::{
    LedgerEntry, NewLedgerEntry, NewTransaction, PostedTransaction, Source, TransactionHeader,
};
pub use validation::{
    CreateTransactionRequest, EntryRequest, LedgerLimits, Rejection, RejectionKind,
    ValidatedEntry, ValidatedTransaction, Validator, to_stored_precision,
};

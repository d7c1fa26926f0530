//! `tally-core`: shared domain primitives.
//!
//! Identifiers, currency codes and the domain error type. No infrastructure concerns.

pub mod currency;
pub mod error;
pub mod id;

pub use currency::Currency;
pub use error::DomainError;
pub use id::{AccountId, EntryId, TransactionId};

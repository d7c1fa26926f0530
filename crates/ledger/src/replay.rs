//! Comparing a retried request with the transaction already stored under its key.
//!
//! A replay is only accepted when the normalized request describes the same
//! transaction. Reusing a key for a different payload is a conflict.

use crate::transaction::PostedTransaction;
use crate::validation::{Rejection, ValidatedTransaction, to_stored_precision};

/// Check that `request` is a replay of `stored`.
///
/// `posted_at` only takes part when the client supplied it; a defaulted value is
/// "now" and differs on every retry. Timestamps are compared at microsecond
/// precision, which is what the store keeps.
pub fn ensure_same_payload(request: &ValidatedTransaction, stored: &PostedTransaction) -> Result<(), Rejection> {
    let mismatch = |field: &'static str| Rejection::IdempotencyKeyReused {
        key: request.idempotency_key.clone(),
        field,
    };

    if request.description != stored.header.description {
        return Err(mismatch("description"));
    }
    if request.source != stored.header.source {
        return Err(mismatch("source"));
    }
    if request.posted_at_supplied
        && to_stored_precision(request.posted_at) != to_stored_precision(stored.header.posted_at)
    {
        return Err(mismatch("posted_at"));
    }
    if stored.currency() != Some(request.currency) {
        return Err(mismatch("currency"));
    }

    let same_entries = request.entries.len() == stored.entries.len()
        && request
            .entries
            .iter()
            .zip(&stored.entries)
            .all(|(r, s)| r.account_id == s.account_id && r.amount == s.amount);
    if !same_entries {
        return Err(mismatch("entries"));
    }

    Ok(())
}

//! Idempotent replay of a transaction whose key is already taken.
//!
//! The writer reports [`WriteOutcome::DuplicateKey`](crate::writer::WriteOutcome) when
//! the header insert hits the unique index on the idempotency key. The winning writer
//! may not have committed yet at that point, so the lookup is retried with exponential
//! backoff until the row becomes visible or the attempts run out.

use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use tally_ledger::{PostedTransaction, Rejection, ValidatedTransaction, ensure_same_payload};

use crate::store::{LedgerStore, StoreError};

/// Retry policy for the replay lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of lookups (at least one is always made).
    pub max_attempts: u32,
    /// Delay after the first miss; doubles after each further miss.
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after the given failed attempt (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Error)]
pub enum ResolveError {
    /// The key conflicted but no committed transaction showed up in time.
    #[error("transaction for idempotency key '{key}' not visible after {attempts} attempts")]
    NotVisible { key: String, attempts: u32 },

    #[error(transparent)]
    Store(#[from] StoreError),

    /// The key belongs to a transaction with a different payload.
    #[error(transparent)]
    KeyReused(Rejection),
}

/// Fetches the transaction that owns an idempotency key.
#[derive(Debug, Clone)]
pub struct IdempotencyResolver<S> {
    store: S,
    policy: RetryPolicy,
}

impl<S: LedgerStore> IdempotencyResolver<S> {
    pub fn new(store: S, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Stored transaction for `key` (header plus entries), retrying while it is not
    /// yet visible.
    pub async fn fetch_existing(&self, key: &str) -> Result<PostedTransaction, ResolveError> {
        let attempts = self.policy.max_attempts.max(1);

        for attempt in 1..=attempts {
            if let Some(header) = self.store.find_by_idempotency_key(key).await? {
                let entries = self.store.list_entries(header.id).await?;
                return Ok(PostedTransaction { header, entries });
            }

            if attempt < attempts {
                let delay = self.policy.delay_for_attempt(attempt);
                debug!(
                    idempotency_key = %key,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "conflicting transaction not visible yet"
                );
                tokio::time::sleep(delay).await;
            }
        }

        warn!(idempotency_key = %key, attempts, "conflicting transaction never became visible");
        Err(ResolveError::NotVisible {
            key: key.to_string(),
            attempts,
        })
    }

    /// Resolve a duplicate key: the stored transaction when `validated` is a replay of it,
    /// [`ResolveError::KeyReused`] when the payloads differ.
    pub async fn resolve(&self, validated: &ValidatedTransaction) -> Result<PostedTransaction, ResolveError> {
        let existing = self.fetch_existing(&validated.idempotency_key).await?;
        ensure_same_payload(validated, &existing).map_err(ResolveError::KeyReused)?;
        Ok(existing)
    }
}

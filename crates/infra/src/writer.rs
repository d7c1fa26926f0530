//! Atomic persistence of one validated transaction.

use thiserror::Error;
use tracing::{debug, warn};

use tally_core::TransactionId;
use tally_ledger::{PostedTransaction, ValidatedTransaction};

use crate::store::{LedgerStore, StoreError, UnitOfWork};

/// Result of a write attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Header and every entry are committed.
    Committed(PostedTransaction),
    /// Another transaction already owns the idempotency key. Nothing was written.
    DuplicateKey,
}

/// Why a write failed. Nothing is persisted in any of these cases.
#[derive(Debug, Error)]
pub enum WriteError {
    #[error("failed to begin unit of work: {0}")]
    Begin(#[source] StoreError),

    #[error("failed to insert transaction header: {0}")]
    Header(#[source] StoreError),

    #[error("failed to insert entry {line_no}: {source}")]
    Entry { line_no: u32, source: StoreError },

    #[error("failed to commit: {0}")]
    Commit(#[source] StoreError),
}

/// Writes a header and its entries inside a single unit of work.
#[derive(Debug, Clone)]
pub struct TransactionWriter<S> {
    store: S,
}

impl<S: LedgerStore> TransactionWriter<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Persist `validated` under a fresh transaction id.
    ///
    /// An idempotency-key violation on the header yields [`WriteOutcome::DuplicateKey`];
    /// any other failure rolls the unit of work back and is returned as an error.
    pub async fn write(&self, validated: &ValidatedTransaction) -> Result<WriteOutcome, WriteError> {
        let transaction_id = TransactionId::new();
        let mut uow = self.store.begin().await.map_err(WriteError::Begin)?;

        let header = match uow.insert_header(&validated.new_transaction(transaction_id)).await {
            Ok(header) => header,
            Err(e) if e.is_idempotency_conflict() => {
                debug!(
                    idempotency_key = %validated.idempotency_key,
                    "idempotency key already taken"
                );
                rollback_quietly(uow).await;
                return Ok(WriteOutcome::DuplicateKey);
            }
            Err(e) => {
                rollback_quietly(uow).await;
                return Err(WriteError::Header(e));
            }
        };

        let rows = validated.new_entries(transaction_id);
        let mut entries = Vec::with_capacity(rows.len());
        for row in &rows {
            match uow.insert_entry(row).await {
                Ok(entry) => entries.push(entry),
                Err(source) => {
                    rollback_quietly(uow).await;
                    return Err(WriteError::Entry {
                        line_no: row.line_no,
                        source,
                    });
                }
            }
        }

        uow.commit().await.map_err(WriteError::Commit)?;

        Ok(WriteOutcome::Committed(PostedTransaction { header, entries }))
    }
}

/// Roll back after a failure. A failing rollback is only logged: the unit of work is
/// dropped right after, which discards it anyway.
async fn rollback_quietly(mut uow: Box<dyn UnitOfWork>) {
    if let Err(e) = uow.rollback().await {
        warn!(error = %e, "rollback failed");
    }
}

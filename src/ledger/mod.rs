//! Durable seal state
//!
//! The ledger is the only shared state between workers. Every status change
//! is a compare-and-swap on `(status, version)`, so two workers racing on the
//! same record can never both win.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::types::{SealHash, Status};

pub mod memory;
pub mod models;
pub mod postgres;

pub use memory::MemorySealLedger;
pub use models::{NewSeal, SealRecord, SealRow, SealUpdate};
pub use postgres::PgSealLedger;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("seal {0} not found")]
    NotFound(SealHash),
    /// Lost a CAS race, or a different seal already owns this hash.
    #[error("conflict on seal {seal_hash}: {reason}")]
    Conflict { seal_hash: SealHash, reason: String },
    #[error("illegal transition {from} -> {to}")]
    IllegalTransition { from: Status, to: Status },
    #[error("corrupt ledger row: {0}")]
    Corrupt(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl LedgerError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, LedgerError::Conflict { .. })
    }
}

/// Result of [`SealLedger::create`]
#[derive(Debug, Clone)]
pub struct CreateOutcome {
    pub record: SealRecord,
    /// False when an identical record already existed.
    pub created: bool,
}

#[async_trait]
pub trait SealLedger: Send + Sync {
    /// Insert a PENDING record. Re-creating an identical seal is a no-op;
    /// a different seal under the same hash is a `Conflict`.
    async fn create(&self, seal: &NewSeal) -> Result<CreateOutcome, LedgerError>;

    async fn get(&self, seal_hash: &SealHash) -> Result<Option<SealRecord>, LedgerError>;

    /// Move `seal_hash` from `from` to `to` if its stored status and version
    /// still match. Bumps the version and applies `update` in the same write.
    async fn transition(
        &self,
        seal_hash: &SealHash,
        from: Status,
        to: Status,
        version: i64,
        update: SealUpdate,
    ) -> Result<SealRecord, LedgerError>;

    /// Non-terminal records whose `retry_after` has passed, oldest first.
    async fn ready(&self, now: DateTime<Utc>, limit: usize)
        -> Result<Vec<SealRecord>, LedgerError>;

    async fn counts_by_status(&self) -> Result<Vec<(Status, i64)>, LedgerError>;

    /// Highest source sequence ingested for a chain.
    async fn cursor(&self, source_chain_id: u16) -> Result<Option<u64>, LedgerError>;

    /// Advance the cursor. Never moves it backwards.
    async fn advance_cursor(&self, source_chain_id: u16, sequence: u64)
        -> Result<(), LedgerError>;
}

pub(crate) fn check_transition(from: Status, to: Status) -> Result<(), LedgerError> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(LedgerError::IllegalTransition { from, to })
    }
}

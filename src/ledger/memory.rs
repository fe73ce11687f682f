//! In-process ledger used by tests and single-node dry runs

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{check_transition, CreateOutcome, LedgerError, NewSeal, SealLedger, SealRecord, SealUpdate};
use crate::types::{SealHash, Status};

#[derive(Default)]
struct Inner {
    seals: HashMap<SealHash, SealRecord>,
    cursors: HashMap<u16, u64>,
}

#[derive(Default)]
pub struct MemorySealLedger {
    inner: Mutex<Inner>,
}

impl MemorySealLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A panicked test thread must not wedge every other worker
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn len(&self) -> usize {
        self.lock().seals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl SealLedger for MemorySealLedger {
    async fn create(&self, seal: &NewSeal) -> Result<CreateOutcome, LedgerError> {
        let mut inner = self.lock();
        if let Some(existing) = inner.seals.get(&seal.seal_hash) {
            if !existing.matches(seal) {
                return Err(LedgerError::Conflict {
                    seal_hash: seal.seal_hash,
                    reason: "seal hash already recorded with different inputs".to_string(),
                });
            }
            return Ok(CreateOutcome {
                record: existing.clone(),
                created: false,
            });
        }

        let now = Utc::now();
        let record = SealRecord {
            seal_hash: seal.seal_hash,
            source_chain_id: seal.source_chain_id,
            dest_chain_id: seal.dest_chain_id,
            source_contract: seal.source_contract.clone(),
            token_id: seal.token_id.clone(),
            attestation_pubkey: seal.attestation_pubkey,
            nonce: seal.nonce,
            recipient: seal.recipient,
            emitter_chain_id: seal.emitter_chain_id,
            emitter_address: seal.emitter_address,
            sequence: seal.sequence,
            attestation: seal.attestation.clone(),
            status: Status::Pending,
            version: 0,
            source_tx_ref: seal.source_tx_ref.clone(),
            destination_mint: None,
            destination_tx_ref: None,
            attestation_signature: None,
            custody_signature: None,
            error_kind: None,
            error_detail: None,
            audit_flag: false,
            retry_count: 0,
            retry_after: None,
            created_at: now,
            updated_at: now,
        };
        inner.seals.insert(seal.seal_hash, record.clone());
        Ok(CreateOutcome {
            record,
            created: true,
        })
    }

    async fn get(&self, seal_hash: &SealHash) -> Result<Option<SealRecord>, LedgerError> {
        Ok(self.lock().seals.get(seal_hash).cloned())
    }

    async fn transition(
        &self,
        seal_hash: &SealHash,
        from: Status,
        to: Status,
        version: i64,
        update: SealUpdate,
    ) -> Result<SealRecord, LedgerError> {
        check_transition(from, to)?;
        let mut inner = self.lock();
        let record = inner
            .seals
            .get_mut(seal_hash)
            .ok_or(LedgerError::NotFound(*seal_hash))?;

        if record.status != from || record.version != version {
            return Err(LedgerError::Conflict {
                seal_hash: *seal_hash,
                reason: format!(
                    "expected {}@{}, found {}@{}",
                    from, version, record.status, record.version
                ),
            });
        }

        record.status = to;
        record.version += 1;
        record.updated_at = Utc::now();
        update.apply(record);
        Ok(record.clone())
    }

    async fn ready(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SealRecord>, LedgerError> {
        let inner = self.lock();
        let mut ready: Vec<SealRecord> = inner
            .seals
            .values()
            .filter(|r| !r.status.is_terminal())
            .filter(|r| r.retry_after.map_or(true, |t| t <= now))
            .cloned()
            .collect();
        ready.sort_by_key(|r| (r.created_at, r.seal_hash));
        ready.truncate(limit);
        Ok(ready)
    }

    async fn counts_by_status(&self) -> Result<Vec<(Status, i64)>, LedgerError> {
        let inner = self.lock();
        let mut counts: HashMap<Status, i64> = HashMap::new();
        for record in inner.seals.values() {
            *counts.entry(record.status).or_default() += 1;
        }
        Ok(Status::ALL
            .iter()
            .filter_map(|s| counts.get(s).map(|c| (*s, *c)))
            .collect())
    }

    async fn cursor(&self, source_chain_id: u16) -> Result<Option<u64>, LedgerError> {
        Ok(self.lock().cursors.get(&source_chain_id).copied())
    }

    async fn advance_cursor(
        &self,
        source_chain_id: u16,
        sequence: u64,
    ) -> Result<(), LedgerError> {
        let mut inner = self.lock();
        let entry = inner.cursors.entry(source_chain_id).or_insert(sequence);
        *entry = (*entry).max(sequence);
        Ok(())
    }
}

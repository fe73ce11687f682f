//! Replay protection for accepted attestations

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use sqlx::postgres::PgPool;
use sqlx::Row;
use thiserror::Error;

use crate::attestation::AttestationId;
use crate::types::SealHash;

#[derive(Debug, Error)]
pub enum ConsumedSetError {
    #[error("consumed-set storage error: {0}")]
    Storage(String),
}

impl From<sqlx::Error> for ConsumedSetError {
    fn from(e: sqlx::Error) -> Self {
        ConsumedSetError::Storage(e.to_string())
    }
}

/// Set of attestation ids that have already produced a seal.
#[async_trait]
pub trait ConsumedSet: Send + Sync {
    /// Record `id` as consumed by `consumer`. Returns `false` if it was
    /// already present; the check and the insert are one atomic step.
    async fn insert_if_absent(
        &self,
        id: &AttestationId,
        consumer: &SealHash,
    ) -> Result<bool, ConsumedSetError>;

    /// Seal that consumed `id`, if any.
    async fn consumer_of(&self, id: &AttestationId) -> Result<Option<SealHash>, ConsumedSetError>;
}

#[derive(Default)]
pub struct MemoryConsumedSet {
    entries: Mutex<HashMap<AttestationId, SealHash>>,
}

impl MemoryConsumedSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ConsumedSet for MemoryConsumedSet {
    async fn insert_if_absent(
        &self,
        id: &AttestationId,
        consumer: &SealHash,
    ) -> Result<bool, ConsumedSetError> {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        if entries.contains_key(id) {
            return Ok(false);
        }
        entries.insert(*id, *consumer);
        Ok(true)
    }

    async fn consumer_of(&self, id: &AttestationId) -> Result<Option<SealHash>, ConsumedSetError> {
        Ok(self
            .entries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(id)
            .copied())
    }
}

/// Consumed set in the `consumed_attestations` table.
#[derive(Clone)]
pub struct PgConsumedSet {
    pool: PgPool,
}

impl PgConsumedSet {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ConsumedSet for PgConsumedSet {
    async fn insert_if_absent(
        &self,
        id: &AttestationId,
        consumer: &SealHash,
    ) -> Result<bool, ConsumedSetError> {
        let result = sqlx::query(
            r#"
            INSERT INTO consumed_attestations (emitter_chain_id, emitter_address, sequence, consumer)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (emitter_chain_id, emitter_address, sequence) DO NOTHING
            "#,
        )
        .bind(id.emitter_chain_id as i32)
        .bind(id.emitter_address.as_slice())
        .bind(id.sequence as i64)
        .bind(consumer.as_bytes().as_slice())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn consumer_of(&self, id: &AttestationId) -> Result<Option<SealHash>, ConsumedSetError> {
        let row = sqlx::query(
            r#"
            SELECT consumer FROM consumed_attestations
            WHERE emitter_chain_id = $1 AND emitter_address = $2 AND sequence = $3
            "#,
        )
        .bind(id.emitter_chain_id as i32)
        .bind(id.emitter_address.as_slice())
        .bind(id.sequence as i64)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            None => Ok(None),
            Some(row) => {
                let bytes: Vec<u8> = row.get("consumer");
                SealHash::from_slice(&bytes)
                    .map(Some)
                    .ok_or_else(|| ConsumedSetError::Storage("consumer is not 32 bytes".into()))
            }
        }
    }
}

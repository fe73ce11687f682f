//! PostgreSQL-backed ledger

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use eyre::{Result, WrapErr};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use tracing::error;

use super::{
    check_transition, CreateOutcome, LedgerError, NewSeal, SealLedger, SealRecord, SealRow,
    SealUpdate,
};
use crate::types::{SealHash, Status};

const SEAL_COLUMNS: &str = "seal_hash, source_chain_id, dest_chain_id, source_contract, \
    token_id, attestation_pubkey, nonce, recipient, emitter_chain_id, emitter_address, \
    sequence, attestation, status, version, source_tx_ref, destination_mint, \
    destination_tx_ref, attestation_signature, custody_signature, error_kind, error_detail, \
    audit_flag, retry_count, retry_after, created_at, updated_at";

/// Create a database connection pool
pub async fn create_pool(database_url: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .wrap_err("Failed to connect to database")
}

/// Run pending migrations (uses the migration files in migrations/)
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .wrap_err("Failed to run database migrations")?;
    Ok(())
}

#[derive(Clone)]
pub struct PgSealLedger {
    pool: PgPool,
}

impl PgSealLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn fetch(&self, seal_hash: &SealHash) -> Result<Option<SealRecord>, LedgerError> {
        let sql = format!("SELECT {} FROM seals WHERE seal_hash = $1", SEAL_COLUMNS);
        let row = sqlx::query_as::<_, SealRow>(&sql)
            .bind(seal_hash.as_bytes().as_slice())
            .fetch_optional(&self.pool)
            .await?;
        row.map(to_record).transpose()
    }
}

fn to_record(row: SealRow) -> Result<SealRecord, LedgerError> {
    SealRecord::try_from(row).map_err(LedgerError::Corrupt)
}

#[async_trait]
impl SealLedger for PgSealLedger {
    async fn create(&self, seal: &NewSeal) -> Result<CreateOutcome, LedgerError> {
        let sql = format!(
            r#"
            INSERT INTO seals (seal_hash, source_chain_id, dest_chain_id, source_contract,
                token_id, attestation_pubkey, nonce, recipient, emitter_chain_id,
                emitter_address, sequence, attestation, source_tx_ref)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (seal_hash) DO NOTHING
            RETURNING {}
            "#,
            SEAL_COLUMNS
        );
        let inserted = sqlx::query_as::<_, SealRow>(&sql)
            .bind(seal.seal_hash.as_bytes().as_slice())
            .bind(seal.source_chain_id as i32)
            .bind(seal.dest_chain_id as i32)
            .bind(&seal.source_contract)
            .bind(&seal.token_id)
            .bind(seal.attestation_pubkey.as_slice())
            .bind(seal.nonce as i64)
            .bind(seal.recipient.as_slice())
            .bind(seal.emitter_chain_id as i32)
            .bind(seal.emitter_address.as_slice())
            .bind(seal.sequence as i64)
            .bind(&seal.attestation)
            .bind(&seal.source_tx_ref)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                error!(seal_hash = %seal.seal_hash, "SQL error inserting seal: {:?}", e);
                e
            })?;

        if let Some(row) = inserted {
            return Ok(CreateOutcome {
                record: to_record(row)?,
                created: true,
            });
        }

        let existing = self
            .fetch(&seal.seal_hash)
            .await?
            .ok_or(LedgerError::NotFound(seal.seal_hash))?;
        if !existing.matches(seal) {
            return Err(LedgerError::Conflict {
                seal_hash: seal.seal_hash,
                reason: "seal hash already recorded with different inputs".to_string(),
            });
        }
        Ok(CreateOutcome {
            record: existing,
            created: false,
        })
    }

    async fn get(&self, seal_hash: &SealHash) -> Result<Option<SealRecord>, LedgerError> {
        self.fetch(seal_hash).await
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
        let sql = format!(
            r#"
            UPDATE seals SET
                status = $3,
                version = version + 1,
                retry_count = COALESCE($5, retry_count),
                retry_after = $6,
                error_kind = COALESCE($7, error_kind),
                error_detail = COALESCE($8, error_detail),
                attestation_signature = COALESCE($9, attestation_signature),
                custody_signature = COALESCE($10, custody_signature),
                destination_mint = COALESCE($11, destination_mint),
                destination_tx_ref = COALESCE($12, destination_tx_ref),
                audit_flag = audit_flag OR $13,
                updated_at = NOW()
            WHERE seal_hash = $1 AND status = $2 AND version = $4
            RETURNING {}
            "#,
            SEAL_COLUMNS
        );
        let row = sqlx::query_as::<_, SealRow>(&sql)
            .bind(seal_hash.as_bytes().as_slice())
            .bind(from.as_str())
            .bind(to.as_str())
            .bind(version)
            .bind(update.retry_count.map(|c| c as i32))
            .bind(update.retry_after)
            .bind(update.error_kind.map(|k| k.as_str()))
            .bind(&update.error_detail)
            .bind(&update.attestation_signature)
            .bind(&update.custody_signature)
            .bind(&update.destination_mint)
            .bind(&update.destination_tx_ref)
            .bind(update.audit_flag)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => to_record(row),
            None => match self.fetch(seal_hash).await? {
                None => Err(LedgerError::NotFound(*seal_hash)),
                Some(current) => Err(LedgerError::Conflict {
                    seal_hash: *seal_hash,
                    reason: format!(
                        "expected {}@{}, found {}@{}",
                        from, version, current.status, current.version
                    ),
                }),
            },
        }
    }

    async fn ready(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SealRecord>, LedgerError> {
        let sql = format!(
            r#"SELECT {} FROM seals
               WHERE status NOT IN ('completed', 'failed')
                 AND (retry_after IS NULL OR retry_after <= $1)
               ORDER BY created_at, seal_hash
               LIMIT $2"#,
            SEAL_COLUMNS
        );
        let rows = sqlx::query_as::<_, SealRow>(&sql)
            .bind(now)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                error!("SQL error getting ready seals: {:?}", e);
                e
            })?;
        rows.into_iter().map(to_record).collect()
    }

    async fn counts_by_status(&self) -> Result<Vec<(Status, i64)>, LedgerError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM seals GROUP BY status")
            .fetch_all(&self.pool)
            .await?;
        let mut counts = Vec::with_capacity(rows.len());
        for row in rows {
            let status: String = row.get("status");
            let n: i64 = row.get("n");
            counts.push((status.parse().map_err(LedgerError::Corrupt)?, n));
        }
        counts.sort_by_key(|(s, _)| Status::ALL.iter().position(|x| x == s));
        Ok(counts)
    }

    async fn cursor(&self, source_chain_id: u16) -> Result<Option<u64>, LedgerError> {
        let row = sqlx::query("SELECT last_sequence FROM source_cursors WHERE source_chain_id = $1")
            .bind(source_chain_id as i32)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<i64, _>("last_sequence") as u64))
    }

    async fn advance_cursor(
        &self,
        source_chain_id: u16,
        sequence: u64,
    ) -> Result<(), LedgerError> {
        // Sequences are compared as unsigned; the BIGINT holds the raw bits
        sqlx::query(
            r#"
            INSERT INTO source_cursors (source_chain_id, last_sequence, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (source_chain_id) DO UPDATE SET
                last_sequence = CASE
                    WHEN (source_cursors.last_sequence::NUMERIC + CASE WHEN source_cursors.last_sequence < 0 THEN 18446744073709551616 ELSE 0 END)
                       < (EXCLUDED.last_sequence::NUMERIC + CASE WHEN EXCLUDED.last_sequence < 0 THEN 18446744073709551616 ELSE 0 END)
                    THEN EXCLUDED.last_sequence
                    ELSE source_cursors.last_sequence
                END,
                updated_at = NOW()
            "#,
        )
        .bind(source_chain_id as i32)
        .bind(sequence as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

//! Seal state machine
//!
//! ```text
//! PENDING   --claim-->              VERIFYING
//! VERIFYING --ok-->                 SIGNING
//! VERIFYING --retryable-->          PENDING (backoff)
//! SIGNING   --signatures stored-->  BROADCAST
//! SIGNING   --timeout/network-->    SIGNING (backoff)
//! BROADCAST --minted/already-->     COMPLETED
//! BROADCAST --retryable-->          BROADCAST (backoff)
//! any       --fatal/exhausted-->    FAILED
//! ```
//!
//! A worker claims a record with a CAS that also sets a lease in
//! `retry_after`, then issues the stage's side-effecting call. If the worker
//! dies the lease expires and another worker re-issues the same call, which
//! is safe because every stage call is idempotent or guarded: the consumed
//! set remembers which seal consumed an attestation and the destination
//! record account rejects a second mint.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::StreamExt;
use solana_sdk::pubkey::Pubkey;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::attestation::Attestation;
use crate::ledger::{LedgerError, SealLedger, SealRecord, SealUpdate};
use crate::metrics;
use crate::minter::{DestinationMinter, MintError};
use crate::signing::{DwalletId, SealSignature, SigningCoordinator};
use crate::types::{ErrorKind, SealHash, Status};
use crate::verifier::{AttestationVerifier, GuardianOracle, VerificationError, VerifiedDeposit};

pub mod ingest;
pub mod retry;

pub use ingest::SourceWatcher;
pub use retry::{RetryConfig, RetryDecision};

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Records processed concurrently per pass
    pub workers: usize,
    pub poll_interval: Duration,
    /// Records fetched per pass
    pub batch_size: usize,
    /// Bound on each remote call (oracle, signer, chain)
    pub stage_timeout: Duration,
    pub retry: RetryConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            poll_interval: Duration::from_millis(1000),
            batch_size: 64,
            stage_timeout: Duration::from_secs(30),
            retry: RetryConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    /// How long a claimed record stays invisible to other workers.
    fn lease(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.stage_timeout * 3).unwrap_or(chrono::Duration::minutes(5))
    }
}

/// Result of driving one record one step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// Moved to a new working or terminal status
    Advanced(Status),
    /// Retryable failure, rescheduled in the given status
    Retrying(Status),
    Failed(ErrorKind),
    /// Not ready, terminal, or claimed by another worker
    Skipped,
}

#[derive(Debug, Error)]
pub enum CancelError {
    #[error("seal {0} not found")]
    NotFound(SealHash),
    /// The record already left PENDING; it must run to completion.
    #[error("cancellation withdrawn: seal is {0}")]
    Withdrawn(Status),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

pub struct Orchestrator {
    ledger: Arc<dyn SealLedger>,
    verifier: Arc<AttestationVerifier>,
    oracle: Arc<dyn GuardianOracle>,
    signer: Arc<SigningCoordinator>,
    minter: Arc<DestinationMinter>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        ledger: Arc<dyn SealLedger>,
        verifier: Arc<AttestationVerifier>,
        oracle: Arc<dyn GuardianOracle>,
        signer: Arc<SigningCoordinator>,
        minter: Arc<DestinationMinter>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            ledger,
            verifier,
            oracle,
            signer,
            minter,
            config,
        }
    }

    pub fn ledger(&self) -> &Arc<dyn SealLedger> {
        &self.ledger
    }

    /// Run the worker pool until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> eyre::Result<()> {
        info!(
            workers = self.config.workers,
            batch = self.config.batch_size,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "Orchestrator starting"
        );

        let mut passes: u64 = 0;
        let mut consecutive_errors: u32 = 0;
        let heartbeat_every = 60_000 / self.config.poll_interval.as_millis().max(1) as u64;

        loop {
            match self.process_ready().await {
                Ok(n) => {
                    consecutive_errors = 0;
                    if n > 0 {
                        debug!(processed = n, "Orchestrator pass complete");
                    }
                }
                Err(e) => {
                    consecutive_errors += 1;
                    error!(error = %e, consecutive_errors, "Orchestrator pass failed");
                }
            }

            passes += 1;
            if heartbeat_every > 0 && passes % heartbeat_every == 0 {
                self.report_status_counts().await;
            }

            // Back off harder while the ledger keeps failing
            let delay = self.config.poll_interval * (1 + consecutive_errors.min(10));
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("Orchestrator shutting down");
                    return Ok(());
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// One scheduler pass: fetch ready records and step each once.
    pub async fn process_ready(&self) -> Result<usize, LedgerError> {
        let ready = self
            .ledger
            .ready(Utc::now(), self.config.batch_size)
            .await?;
        let count = ready.len();

        let results: Vec<Result<StepOutcome, LedgerError>> = futures::stream::iter(ready)
            .map(|record| self.step(record))
            .buffer_unordered(self.config.workers.max(1))
            .collect()
            .await;

        for result in results {
            result?;
        }
        Ok(count)
    }

    /// Drive `record` through its current stage.
    pub async fn step(&self, record: SealRecord) -> Result<StepOutcome, LedgerError> {
        let now = Utc::now();
        if record.status.is_terminal()
            || !self.config.retry.is_ready_for_retry(record.retry_after, now)
        {
            return Ok(StepOutcome::Skipped);
        }

        let claim_to = match record.status {
            Status::Pending => Status::Verifying,
            other => other,
        };
        let claimed = match self
            .transition(&record, claim_to, SealUpdate::new().lease(now + self.config.lease()))
            .await
        {
            Ok(claimed) => claimed,
            Err(e) if e.is_conflict() => {
                debug!(seal_hash = %record.seal_hash, "Seal claimed by another worker");
                return Ok(StepOutcome::Skipped);
            }
            Err(e) => return Err(e),
        };

        let started = Instant::now();
        let stage = claimed.status;
        let outcome = match stage {
            Status::Verifying => self.verify_stage(claimed).await,
            Status::Signing => self.signing_stage(claimed).await,
            Status::Broadcast => self.broadcast_stage(claimed).await,
            _ => Ok(StepOutcome::Skipped),
        };
        metrics::STAGE_LATENCY
            .with_label_values(&[stage.as_str()])
            .observe(started.elapsed().as_secs_f64());

        match outcome {
            // Lost the lease mid-stage; the new owner carries on
            Err(e) if e.is_conflict() => {
                warn!(error = %e, "Seal changed underneath the worker");
                Ok(StepOutcome::Skipped)
            }
            other => other,
        }
    }

    /// Cancel a seal that has not started verification.
    pub async fn cancel(&self, seal_hash: &SealHash) -> Result<SealRecord, CancelError> {
        let record = self
            .ledger
            .get(seal_hash)
            .await?
            .ok_or(CancelError::NotFound(*seal_hash))?;
        if record.status != Status::Pending {
            return Err(CancelError::Withdrawn(record.status));
        }

        let update = SealUpdate::new().error(ErrorKind::Cancelled, "cancelled by operator");
        match self.transition(&record, Status::Failed, update).await {
            Ok(cancelled) => {
                metrics::SEALS_FAILED
                    .with_label_values(&[ErrorKind::Cancelled.as_str()])
                    .inc();
                info!(%seal_hash, "Seal cancelled");
                Ok(cancelled)
            }
            Err(e) if e.is_conflict() => {
                let status = self
                    .ledger
                    .get(seal_hash)
                    .await?
                    .map_or(record.status, |r| r.status);
                Err(CancelError::Withdrawn(status))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn verify_stage(&self, record: SealRecord) -> Result<StepOutcome, LedgerError> {
        let timeout = self.config.stage_timeout;
        // Unparseable bytes are checked against the current set and rejected
        // by the verifier
        let signed_under = Attestation::parse(&record.attestation)
            .ok()
            .map(|a| a.guardian_set_index);
        let chain_id = record.emitter_chain_id;
        let oracle = &self.oracle;
        let lookup = async move {
            match signed_under {
                Some(index) => oracle.guardian_set_for(chain_id, index).await,
                None => oracle.current_guardian_set(chain_id).await,
            }
        };
        let guardian_set = match tokio::time::timeout(timeout, lookup).await {
            Ok(Ok(set)) => set,
            Ok(Err(e)) => return self.retry_or_fail(record, Status::Pending, e.to_string()).await,
            Err(_) => {
                return self
                    .retry_or_fail(record, Status::Pending, "guardian oracle timed out".into())
                    .await
            }
        };

        let verified =
            tokio::time::timeout(timeout, self.verifier.verify(&record.attestation, &guardian_set))
                .await;
        match verified {
            Err(_) => {
                self.retry_or_fail(record, Status::Pending, "verification timed out".into())
                    .await
            }
            Ok(Ok(_)) => self.advance(record, Status::Signing).await,
            // Consumed by this very seal on an earlier attempt
            Ok(Err(VerificationError::AlreadyConsumed {
                consumer: Some(consumer),
                ..
            })) if consumer == record.seal_hash => {
                info!(seal_hash = %record.seal_hash, "Resuming seal after earlier verification");
                self.advance(record, Status::Signing).await
            }
            Ok(Err(e)) if e.is_retryable() => {
                self.retry_or_fail(record, Status::Pending, e.to_string()).await
            }
            Ok(Err(e)) => self.fail(record, e.kind(), e.to_string(), false).await,
        }
    }

    async fn signing_stage(&self, record: SealRecord) -> Result<StepOutcome, LedgerError> {
        let dwallet = DwalletId::from_pubkey(&record.attestation_pubkey);
        let result = self
            .signer
            .request_signature(
                record.source_chain_id,
                &dwallet,
                record.seal_hash.as_bytes(),
                self.config.stage_timeout,
            )
            .await;

        match result {
            Ok(signature) => {
                let update = SealUpdate::new()
                    .retry(0, None)
                    .signatures(signature.attestation.to_vec(), signature.custody);
                let next = self.transition(&record, Status::Broadcast, update).await?;
                self.record_transition(Status::Signing, next.status);
                Ok(StepOutcome::Advanced(Status::Broadcast))
            }
            Err(e) if e.is_retryable() => {
                self.retry_or_fail(record, Status::Signing, e.to_string()).await
            }
            Err(e) => {
                let audit = e.kind() == ErrorKind::InvalidSignature;
                self.fail(record, e.kind(), e.to_string(), audit).await
            }
        }
    }

    async fn broadcast_stage(&self, record: SealRecord) -> Result<StepOutcome, LedgerError> {
        // Verification already passed for this record; rebuild its deposit
        let deposit = match Attestation::parse(&record.attestation) {
            Ok(attestation) => match VerifiedDeposit::from_recorded(&attestation) {
                Ok(deposit) => deposit,
                Err(e) => return self.fail(record, e.kind(), e.to_string(), true).await,
            },
            Err(e) => {
                return self
                    .fail(record, ErrorKind::MalformedAttestation, e.to_string(), true)
                    .await
            }
        };
        let attestation_signature = record
            .attestation_signature
            .as_deref()
            .and_then(|s| <[u8; 64]>::try_from(s).ok());
        let Some(attestation_signature) = attestation_signature else {
            return self
                .fail(
                    record,
                    ErrorKind::InvalidSignature,
                    "missing stored seal signature".into(),
                    true,
                )
                .await;
        };
        let signature = SealSignature {
            message: record.seal_hash.0,
            attestation: attestation_signature,
            custody: record.custody_signature.clone(),
        };
        let recipient = Pubkey::new_from_array(record.recipient);

        let minted = tokio::time::timeout(
            self.config.stage_timeout,
            self.minter
                .mint(&record.seal_hash, &deposit, &signature, &recipient),
        )
        .await;

        match minted {
            Err(_) => {
                self.retry_or_fail(record, Status::Broadcast, "mint timed out".into())
                    .await
            }
            Ok(Ok(result)) => self.complete(record, result.mint_address, Some(result.tx_ref)).await,
            Ok(Err(MintError::AlreadyMinted { mint_address })) => {
                self.complete(record, mint_address, None).await
            }
            Ok(Err(e)) if e.is_retryable() => {
                self.retry_or_fail(record, Status::Broadcast, e.to_string()).await
            }
            Ok(Err(e @ MintError::InvalidSignature(_))) => {
                self.fail(record, e.kind(), e.to_string(), true).await
            }
            Ok(Err(e)) => self.fail(record, e.kind(), e.to_string(), false).await,
        }
    }

    async fn advance(&self, record: SealRecord, to: Status) -> Result<StepOutcome, LedgerError> {
        let from = record.status;
        self.transition(&record, to, SealUpdate::new().retry(0, None))
            .await?;
        self.record_transition(from, to);
        Ok(StepOutcome::Advanced(to))
    }

    async fn complete(
        &self,
        record: SealRecord,
        mint_address: String,
        tx_ref: Option<String>,
    ) -> Result<StepOutcome, LedgerError> {
        let seal_hash = record.seal_hash;
        let update = SealUpdate::new()
            .retry(0, None)
            .minted(mint_address.clone(), tx_ref);
        self.transition(&record, Status::Completed, update).await?;
        self.record_transition(Status::Broadcast, Status::Completed);
        info!(%seal_hash, %mint_address, "Seal completed");
        Ok(StepOutcome::Advanced(Status::Completed))
    }

    async fn retry_or_fail(
        &self,
        record: SealRecord,
        back_to: Status,
        detail: String,
    ) -> Result<StepOutcome, LedgerError> {
        match self.config.retry.decide(record.retry_count, Utc::now()) {
            RetryDecision::RetryAt { attempt, at } => {
                warn!(
                    seal_hash = %record.seal_hash,
                    stage = %record.status,
                    attempt,
                    max = self.config.retry.max_attempts,
                    retry_after = %at,
                    error = %detail,
                    "Stage failed, retrying after backoff"
                );
                metrics::STAGE_RETRIES
                    .with_label_values(&[record.status.as_str()])
                    .inc();
                let mut update = SealUpdate::new().retry(attempt, Some(at));
                update.error_detail = Some(detail);
                self.transition(&record, back_to, update).await?;
                Ok(StepOutcome::Retrying(back_to))
            }
            RetryDecision::Exhausted => {
                self.fail(record, ErrorKind::RetriesExhausted, detail, false)
                    .await
            }
        }
    }

    async fn fail(
        &self,
        record: SealRecord,
        kind: ErrorKind,
        detail: String,
        audit: bool,
    ) -> Result<StepOutcome, LedgerError> {
        let from = record.status;
        let mut update = SealUpdate::new().retry(record.retry_count, None).error(kind, detail.clone());
        if audit {
            update = update.audit();
            metrics::AUDIT_FLAGS.inc();
            error!(
                seal_hash = %record.seal_hash,
                error_kind = %kind,
                error = %detail,
                "Seal failed and flagged for manual audit"
            );
        } else {
            warn!(seal_hash = %record.seal_hash, error_kind = %kind, error = %detail, "Seal failed");
        }
        self.transition(&record, Status::Failed, update).await?;
        self.record_transition(from, Status::Failed);
        metrics::SEALS_FAILED
            .with_label_values(&[kind.as_str()])
            .inc();
        Ok(StepOutcome::Failed(kind))
    }

    async fn transition(
        &self,
        record: &SealRecord,
        to: Status,
        update: SealUpdate,
    ) -> Result<SealRecord, LedgerError> {
        self.ledger
            .transition(&record.seal_hash, record.status, to, record.version, update)
            .await
    }

    fn record_transition(&self, from: Status, to: Status) {
        metrics::STAGE_TRANSITIONS
            .with_label_values(&[from.as_str(), to.as_str()])
            .inc();
    }

    async fn report_status_counts(&self) {
        match self.ledger.counts_by_status().await {
            Ok(counts) => {
                for status in Status::ALL {
                    let n = counts
                        .iter()
                        .find(|(s, _)| *s == status)
                        .map_or(0, |(_, n)| *n);
                    metrics::SEALS_BY_STATUS
                        .with_label_values(&[status.as_str()])
                        .set(n as f64);
                }
                info!(?counts, "Orchestrator heartbeat");
            }
            Err(e) => warn!(error = %e, "Failed to read seal counts"),
        }
    }
}

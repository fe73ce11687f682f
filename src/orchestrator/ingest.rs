//! Source watcher
//!
//! Polls the feed for every trusted emitter, creates a PENDING ledger record
//! per deposit, and advances the per-chain cursor only after the record is
//! durable. A restart resumes from the stored cursor; replayed attestations
//! hit the ledger's idempotent create.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::attestation::Attestation;
use crate::codec::DecodeError;
use crate::feed::{next_sequence, FeedItem, SourceFeed};
use crate::ledger::{LedgerError, NewSeal, SealLedger};
use crate::metrics;
use crate::verifier::TrustedEmitter;

/// What happened to one fetched attestation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Created,
    /// Identical record already present
    Duplicate,
    /// Not a deposit, or not parseable; the cursor still moves past it
    Skipped(String),
    /// Different inputs under an existing seal hash
    Conflict,
}

pub struct SourceWatcher {
    feed: Arc<dyn SourceFeed>,
    ledger: Arc<dyn SealLedger>,
    emitters: Vec<TrustedEmitter>,
    poll_interval: Duration,
    /// Upper bound on attestations taken per emitter per poll
    max_batch: usize,
}

impl SourceWatcher {
    pub fn new(
        feed: Arc<dyn SourceFeed>,
        ledger: Arc<dyn SealLedger>,
        emitters: Vec<TrustedEmitter>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            feed,
            ledger,
            emitters,
            poll_interval,
            max_batch: 100,
        }
    }

    pub fn with_max_batch(mut self, max_batch: usize) -> Self {
        self.max_batch = max_batch.max(1);
        self
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> eyre::Result<()> {
        info!(
            emitters = self.emitters.len(),
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "Source watcher starting"
        );

        loop {
            if let Err(e) = self.poll_once().await {
                error!(error = %e, "Source poll failed");
            }

            tokio::select! {
                _ = shutdown.changed() => {
                    info!("Source watcher shutting down");
                    return Ok(());
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    /// Poll every emitter once. Returns the number of records created.
    pub async fn poll_once(&self) -> Result<usize, LedgerError> {
        let mut created = 0;
        for emitter in &self.emitters {
            created += self.poll_emitter(emitter).await?;
        }
        Ok(created)
    }

    pub async fn poll_emitter(&self, emitter: &TrustedEmitter) -> Result<usize, LedgerError> {
        let chain = emitter.chain_id.to_string();
        let mut cursor = self.ledger.cursor(emitter.chain_id).await?;
        let mut created = 0;

        for _ in 0..self.max_batch {
            let raw = match self.feed.next(emitter, cursor).await {
                Ok(FeedItem::Attestation(raw)) => raw,
                Ok(FeedItem::EndOfStream) => break,
                Err(e) => {
                    warn!(chain_id = emitter.chain_id, ?cursor, error = %e, "Feed request failed");
                    metrics::INGEST_ERRORS
                        .with_label_values(&[chain.as_str(), "feed"])
                        .inc();
                    break;
                }
            };

            let sequence = next_sequence(cursor);
            match self.ingest(emitter, sequence, &raw).await? {
                IngestOutcome::Created => created += 1,
                IngestOutcome::Duplicate => {}
                IngestOutcome::Skipped(reason) => {
                    debug!(chain_id = emitter.chain_id, sequence, %reason, "Skipped source event");
                }
                IngestOutcome::Conflict => {
                    metrics::INGEST_ERRORS
                        .with_label_values(&[chain.as_str(), "conflict"])
                        .inc();
                }
            }

            self.ledger
                .advance_cursor(emitter.chain_id, sequence)
                .await?;
            metrics::SOURCE_CURSOR
                .with_label_values(&[chain.as_str()])
                .set(sequence as f64);
            cursor = Some(sequence);
        }

        if created > 0 {
            info!(chain_id = emitter.chain_id, created, ?cursor, "Ingested deposits");
        }
        Ok(created)
    }

    /// Turn one raw attestation into a ledger record.
    pub async fn ingest(
        &self,
        emitter: &TrustedEmitter,
        sequence: u64,
        raw: &[u8],
    ) -> Result<IngestOutcome, LedgerError> {
        let chain = emitter.chain_id.to_string();
        let attestation = match Attestation::parse(raw) {
            Ok(a) => a,
            Err(e) => {
                warn!(chain_id = emitter.chain_id, sequence, error = %e, "Unparseable attestation");
                metrics::INGEST_ERRORS
                    .with_label_values(&[chain.as_str(), "malformed"])
                    .inc();
                return Ok(IngestOutcome::Skipped(e.to_string()));
            }
        };

        if attestation.emitter_chain_id != emitter.chain_id
            || attestation.emitter_address != emitter.address
            || attestation.sequence != sequence
        {
            warn!(
                attestation = %attestation.id(),
                expected_sequence = sequence,
                "Feed returned an attestation for a different slot"
            );
            metrics::INGEST_ERRORS
                .with_label_values(&[chain.as_str(), "wrong_slot"])
                .inc();
            return Ok(IngestOutcome::Skipped("attestation for a different slot".into()));
        }

        let seal = match NewSeal::from_attestation(&attestation, raw) {
            Ok(seal) => seal,
            // Other message types share the emitter
            Err(DecodeError::WrongPayloadId(id)) => {
                return Ok(IngestOutcome::Skipped(format!("payload id {}", id)));
            }
            Err(e) => {
                warn!(attestation = %attestation.id(), error = %e, "Undecodable deposit payload");
                metrics::INGEST_ERRORS
                    .with_label_values(&[chain.as_str(), e.kind().as_str()])
                    .inc();
                return Ok(IngestOutcome::Skipped(e.to_string()));
            }
        };

        match self.ledger.create(&seal).await {
            Ok(outcome) if outcome.created => {
                info!(
                    seal_hash = %seal.seal_hash,
                    attestation = %attestation.id(),
                    "Seal created"
                );
                metrics::SEALS_INGESTED
                    .with_label_values(&[chain.as_str()])
                    .inc();
                Ok(IngestOutcome::Created)
            }
            Ok(_) => Ok(IngestOutcome::Duplicate),
            Err(e) if e.is_conflict() => {
                error!(
                    seal_hash = %seal.seal_hash,
                    attestation = %attestation.id(),
                    error = %e,
                    "Seal hash already bound to different inputs"
                );
                Ok(IngestOutcome::Conflict)
            }
            Err(e) => Err(e),
        }
    }
}

//! Seal ledger records

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;

use crate::attestation::{Attestation, AttestationId};
use crate::codec::{DecodeError, DEST_CHAIN_ID};
use crate::types::{ErrorKind, SealHash, Status};

/// One seal as tracked by the ledger
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SealRecord {
    pub seal_hash: SealHash,
    pub source_chain_id: u16,
    pub dest_chain_id: u16,
    #[serde(with = "hex_bytes")]
    pub source_contract: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub token_id: Vec<u8>,
    #[serde(with = "hex_bytes")]
    pub attestation_pubkey: [u8; 32],
    pub nonce: u64,
    /// Destination owner; the depositor field of the deposit payload.
    #[serde(serialize_with = "base58")]
    pub recipient: [u8; 32],
    pub emitter_chain_id: u16,
    #[serde(with = "hex_bytes")]
    pub emitter_address: [u8; 32],
    pub sequence: u64,
    /// Raw signed attestation as received from the feed.
    #[serde(skip)]
    pub attestation: Vec<u8>,
    pub status: Status,
    pub version: i64,
    pub source_tx_ref: Option<String>,
    pub destination_mint: Option<String>,
    pub destination_tx_ref: Option<String>,
    #[serde(skip)]
    pub attestation_signature: Option<Vec<u8>>,
    #[serde(skip)]
    pub custody_signature: Option<Vec<u8>>,
    pub error_kind: Option<ErrorKind>,
    pub error_detail: Option<String>,
    pub audit_flag: bool,
    pub retry_count: u32,
    pub retry_after: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SealRecord {
    pub fn attestation_id(&self) -> AttestationId {
        AttestationId {
            emitter_chain_id: self.emitter_chain_id,
            emitter_address: self.emitter_address,
            sequence: self.sequence,
        }
    }

    /// Whether two records describe the same seal inputs.
    pub fn matches(&self, seal: &NewSeal) -> bool {
        self.seal_hash == seal.seal_hash
            && self.source_chain_id == seal.source_chain_id
            && self.dest_chain_id == seal.dest_chain_id
            && self.source_contract == seal.source_contract
            && self.token_id == seal.token_id
            && self.attestation_pubkey == seal.attestation_pubkey
            && self.nonce == seal.nonce
            && self.recipient == seal.recipient
    }
}

/// New seal for insertion
#[derive(Debug, Clone, PartialEq)]
pub struct NewSeal {
    pub seal_hash: SealHash,
    pub source_chain_id: u16,
    pub dest_chain_id: u16,
    pub source_contract: Vec<u8>,
    pub token_id: Vec<u8>,
    pub attestation_pubkey: [u8; 32],
    pub nonce: u64,
    pub recipient: [u8; 32],
    pub emitter_chain_id: u16,
    pub emitter_address: [u8; 32],
    pub sequence: u64,
    pub attestation: Vec<u8>,
    pub source_tx_ref: Option<String>,
}

impl NewSeal {
    /// Build the ledger entry for a fetched attestation. Signatures are not
    /// checked here; that is the verifier's job once the record is claimed.
    pub fn from_attestation(attestation: &Attestation, raw: &[u8]) -> Result<Self, DecodeError> {
        let payload = attestation.decode_deposit()?;
        Ok(Self {
            seal_hash: payload.seal_hash(),
            source_chain_id: payload.source_chain_id,
            dest_chain_id: DEST_CHAIN_ID,
            source_contract: payload.source_contract.to_vec(),
            token_id: payload.token_id.to_vec(),
            attestation_pubkey: payload.dwallet,
            nonce: payload.seal_nonce,
            recipient: payload.depositor,
            emitter_chain_id: attestation.emitter_chain_id,
            emitter_address: attestation.emitter_address,
            sequence: attestation.sequence,
            attestation: raw.to_vec(),
            source_tx_ref: Some(attestation.id().to_string()),
        })
    }
}

/// Fields written alongside a status transition. `None` leaves the stored
/// value unchanged, except `retry_after` which is always overwritten.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SealUpdate {
    pub retry_count: Option<u32>,
    pub retry_after: Option<DateTime<Utc>>,
    pub error_kind: Option<ErrorKind>,
    pub error_detail: Option<String>,
    pub attestation_signature: Option<Vec<u8>>,
    pub custody_signature: Option<Vec<u8>>,
    pub destination_mint: Option<String>,
    pub destination_tx_ref: Option<String>,
    pub audit_flag: bool,
}

impl SealUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn retry(mut self, count: u32, after: Option<DateTime<Utc>>) -> Self {
        self.retry_count = Some(count);
        self.retry_after = after;
        self
    }

    pub fn lease(mut self, until: DateTime<Utc>) -> Self {
        self.retry_after = Some(until);
        self
    }

    pub fn error(mut self, kind: ErrorKind, detail: impl Into<String>) -> Self {
        self.error_kind = Some(kind);
        self.error_detail = Some(detail.into());
        self
    }

    pub fn signatures(mut self, attestation: Vec<u8>, custody: Option<Vec<u8>>) -> Self {
        self.attestation_signature = Some(attestation);
        self.custody_signature = custody;
        self
    }

    pub fn minted(mut self, mint: String, tx_ref: Option<String>) -> Self {
        self.destination_mint = Some(mint);
        self.destination_tx_ref = tx_ref;
        self
    }

    pub fn audit(mut self) -> Self {
        self.audit_flag = true;
        self
    }

    /// Apply onto an in-memory record the way the SQL UPDATE does.
    pub(crate) fn apply(self, record: &mut SealRecord) {
        if let Some(count) = self.retry_count {
            record.retry_count = count;
        }
        record.retry_after = self.retry_after;
        if self.error_kind.is_some() {
            record.error_kind = self.error_kind;
        }
        if self.error_detail.is_some() {
            record.error_detail = self.error_detail;
        }
        if self.attestation_signature.is_some() {
            record.attestation_signature = self.attestation_signature;
        }
        if self.custody_signature.is_some() {
            record.custody_signature = self.custody_signature;
        }
        if self.destination_mint.is_some() {
            record.destination_mint = self.destination_mint;
        }
        if self.destination_tx_ref.is_some() {
            record.destination_tx_ref = self.destination_tx_ref;
        }
        record.audit_flag |= self.audit_flag;
    }
}

/// Row shape of the `seals` table
///
/// Unsigned integers are stored in the next-wider signed column, except the
/// 64-bit nonce and sequence which are stored bit-for-bit in BIGINT.
#[derive(Debug, Clone, FromRow)]
pub struct SealRow {
    pub seal_hash: Vec<u8>,
    pub source_chain_id: i32,
    pub dest_chain_id: i32,
    pub source_contract: Vec<u8>,
    pub token_id: Vec<u8>,
    pub attestation_pubkey: Vec<u8>,
    pub nonce: i64,
    pub recipient: Vec<u8>,
    pub emitter_chain_id: i32,
    pub emitter_address: Vec<u8>,
    pub sequence: i64,
    pub attestation: Vec<u8>,
    pub status: String,
    pub version: i64,
    pub source_tx_ref: Option<String>,
    pub destination_mint: Option<String>,
    pub destination_tx_ref: Option<String>,
    pub attestation_signature: Option<Vec<u8>>,
    pub custody_signature: Option<Vec<u8>>,
    pub error_kind: Option<String>,
    pub error_detail: Option<String>,
    pub audit_flag: bool,
    pub retry_count: i32,
    pub retry_after: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<SealRow> for SealRecord {
    type Error = String;

    fn try_from(row: SealRow) -> Result<Self, Self::Error> {
        let seal_hash = SealHash::from_slice(&row.seal_hash)
            .ok_or_else(|| format!("seal_hash is {} bytes", row.seal_hash.len()))?;
        Ok(SealRecord {
            seal_hash,
            source_chain_id: narrow_u16("source_chain_id", row.source_chain_id)?,
            dest_chain_id: narrow_u16("dest_chain_id", row.dest_chain_id)?,
            source_contract: row.source_contract,
            token_id: row.token_id,
            attestation_pubkey: bytes32("attestation_pubkey", &row.attestation_pubkey)?,
            nonce: row.nonce as u64,
            recipient: bytes32("recipient", &row.recipient)?,
            emitter_chain_id: narrow_u16("emitter_chain_id", row.emitter_chain_id)?,
            emitter_address: bytes32("emitter_address", &row.emitter_address)?,
            sequence: row.sequence as u64,
            attestation: row.attestation,
            status: row.status.parse()?,
            version: row.version,
            source_tx_ref: row.source_tx_ref,
            destination_mint: row.destination_mint,
            destination_tx_ref: row.destination_tx_ref,
            attestation_signature: row.attestation_signature,
            custody_signature: row.custody_signature,
            error_kind: row.error_kind.map(|k| k.parse()).transpose()?,
            error_detail: row.error_detail,
            audit_flag: row.audit_flag,
            retry_count: u32::try_from(row.retry_count)
                .map_err(|_| format!("retry_count {} is negative", row.retry_count))?,
            retry_after: row.retry_after,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn narrow_u16(column: &str, value: i32) -> Result<u16, String> {
    u16::try_from(value).map_err(|_| format!("{} {} out of range", column, value))
}

fn bytes32(column: &str, value: &[u8]) -> Result<[u8; 32], String> {
    <[u8; 32]>::try_from(value).map_err(|_| format!("{} is {} bytes", column, value.len()))
}

fn base58<S: serde::Serializer>(bytes: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&bs58::encode(bytes).into_string())
}

mod hex_bytes {
    use serde::Serializer;

    pub fn serialize<S, T>(bytes: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        T: AsRef<[u8]>,
    {
        serializer.serialize_str(&format!("0x{}", hex::encode(bytes.as_ref())))
    }
}

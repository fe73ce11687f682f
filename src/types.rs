//! Common types for the seal pipeline
//!
//! Seal identifiers, the lifecycle status enum persisted by the ledger and the
//! error-kind vocabulary recorded on failed seals.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// SHA-256 digest identifying one sealed NFT across all chains.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SealHash(pub [u8; 32]);

impl SealHash {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Parse from hex, with or without a `0x` prefix.
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        let mut out = [0u8; 32];
        hex::decode_to_slice(s, &mut out)?;
        Ok(Self(out))
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; 32]>::try_from(bytes).ok().map(Self)
    }

    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }
}

impl fmt::Display for SealHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for SealHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SealHash({})", self)
    }
}

impl FromStr for SealHash {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for SealHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for SealHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Lifecycle status of a seal record
///
/// ```text
/// PENDING -> VERIFYING -> SIGNING -> BROADCAST -> COMPLETED
///              |            |           |
///              +------------+-----------+--> FAILED
/// ```
///
/// `VERIFYING -> PENDING` is the retryable-verification path. Self transitions
/// on the three working states renew a worker's lease or record a retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Pending,
    Verifying,
    Signing,
    Broadcast,
    Completed,
    Failed,
}

impl Status {
    pub const ALL: [Status; 6] = [
        Status::Pending,
        Status::Verifying,
        Status::Signing,
        Status::Broadcast,
        Status::Completed,
        Status::Failed,
    ];

    /// Get the status as a lowercase string
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::Verifying => "verifying",
            Status::Signing => "signing",
            Status::Broadcast => "broadcast",
            Status::Completed => "completed",
            Status::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Completed | Status::Failed)
    }

    /// Whether `self -> to` is an edge of the lifecycle graph.
    pub fn can_transition_to(&self, to: Status) -> bool {
        use Status::*;
        match (self, to) {
            (Pending, Verifying) | (Pending, Failed) => true,
            (Verifying, Verifying) | (Verifying, Signing) | (Verifying, Pending) => true,
            (Verifying, Failed) => true,
            (Signing, Signing) | (Signing, Broadcast) | (Signing, Failed) => true,
            (Broadcast, Broadcast) | (Broadcast, Completed) | (Broadcast, Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Status::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown seal status: {}", s))
    }
}

/// Reason a seal ended in FAILED, persisted alongside the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    FieldTooLong,
    MalformedAttestation,
    TruncatedPayload,
    WrongPayloadId,
    NonceOutOfRange,
    UntrustedEmitter,
    GuardianSetMismatch,
    InsufficientSignatures,
    AlreadyConsumed,
    PermanentlyRevoked,
    InvalidSignature,
    InvalidRecipient,
    RetriesExhausted,
    Cancelled,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 14] = [
        ErrorKind::FieldTooLong,
        ErrorKind::MalformedAttestation,
        ErrorKind::TruncatedPayload,
        ErrorKind::WrongPayloadId,
        ErrorKind::NonceOutOfRange,
        ErrorKind::UntrustedEmitter,
        ErrorKind::GuardianSetMismatch,
        ErrorKind::InsufficientSignatures,
        ErrorKind::AlreadyConsumed,
        ErrorKind::PermanentlyRevoked,
        ErrorKind::InvalidSignature,
        ErrorKind::InvalidRecipient,
        ErrorKind::RetriesExhausted,
        ErrorKind::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::FieldTooLong => "field_too_long",
            ErrorKind::MalformedAttestation => "malformed_attestation",
            ErrorKind::TruncatedPayload => "truncated_payload",
            ErrorKind::WrongPayloadId => "wrong_payload_id",
            ErrorKind::NonceOutOfRange => "nonce_out_of_range",
            ErrorKind::UntrustedEmitter => "untrusted_emitter",
            ErrorKind::GuardianSetMismatch => "guardian_set_mismatch",
            ErrorKind::InsufficientSignatures => "insufficient_signatures",
            ErrorKind::AlreadyConsumed => "already_consumed",
            ErrorKind::PermanentlyRevoked => "permanently_revoked",
            ErrorKind::InvalidSignature => "invalid_signature",
            ErrorKind::InvalidRecipient => "invalid_recipient",
            ErrorKind::RetriesExhausted => "retries_exhausted",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ErrorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ErrorKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown error kind: {}", s))
    }
}

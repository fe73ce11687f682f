//! Guardian-signed attestation envelope (Wormhole VAA v1)
//!
//! ```text
//! header: version u8 | guardian_set_index u32 | n u8 | n * (index u8, sig[65])
//! body:   timestamp u32 | nonce u32 | emitter_chain u16 | emitter[32]
//!         | sequence u64 | consistency u8 | payload
//! ```
//!
//! Guardians sign `keccak256(keccak256(body))`.

use std::fmt;

use thiserror::Error;

use crate::codec::{decode_deposit_payload, keccak256, DecodeError, DepositPayload};

pub const VAA_VERSION: u8 = 1;
const HEADER_FIXED_LEN: usize = 6;
const SIGNATURE_LEN: usize = 66;
const BODY_FIXED_LEN: usize = 51;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AttestationError {
    #[error("attestation truncated: need {need} bytes at offset {offset}, have {have}")]
    Truncated {
        offset: usize,
        need: usize,
        have: usize,
    },
    #[error("unsupported attestation version {0}")]
    UnsupportedVersion(u8),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardianSignature {
    pub guardian_index: u8,
    /// r || s || v
    pub signature: [u8; 65],
}

/// Replay key of an attestation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttestationId {
    pub emitter_chain_id: u16,
    pub emitter_address: [u8; 32],
    pub sequence: u64,
}

impl fmt::Display for AttestationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.emitter_chain_id,
            hex::encode(self.emitter_address),
            self.sequence
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attestation {
    pub version: u8,
    pub guardian_set_index: u32,
    pub signatures: Vec<GuardianSignature>,
    pub timestamp: u32,
    pub nonce: u32,
    pub emitter_chain_id: u16,
    pub emitter_address: [u8; 32],
    pub sequence: u64,
    pub consistency_level: u8,
    pub payload: Vec<u8>,
}

impl Attestation {
    pub fn parse(bytes: &[u8]) -> Result<Self, AttestationError> {
        let mut cur = Cursor::new(bytes);
        let version = cur.u8()?;
        if version != VAA_VERSION {
            return Err(AttestationError::UnsupportedVersion(version));
        }
        let guardian_set_index = cur.u32()?;
        let count = cur.u8()? as usize;
        let mut signatures = Vec::with_capacity(count);
        for _ in 0..count {
            let guardian_index = cur.u8()?;
            let signature = cur.array::<65>()?;
            signatures.push(GuardianSignature {
                guardian_index,
                signature,
            });
        }

        let timestamp = cur.u32()?;
        let nonce = cur.u32()?;
        let emitter_chain_id = cur.u16()?;
        let emitter_address = cur.array::<32>()?;
        let sequence = cur.u64()?;
        let consistency_level = cur.u8()?;
        let payload = cur.rest().to_vec();

        Ok(Self {
            version,
            guardian_set_index,
            signatures,
            timestamp,
            nonce,
            emitter_chain_id,
            emitter_address,
            sequence,
            consistency_level,
            payload,
        })
    }

    /// The signed portion of the envelope.
    pub fn body(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(BODY_FIXED_LEN + self.payload.len());
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        out.extend_from_slice(&self.nonce.to_be_bytes());
        out.extend_from_slice(&self.emitter_chain_id.to_be_bytes());
        out.extend_from_slice(&self.emitter_address);
        out.extend_from_slice(&self.sequence.to_be_bytes());
        out.push(self.consistency_level);
        out.extend_from_slice(&self.payload);
        out
    }

    /// Digest each guardian signs.
    pub fn digest(&self) -> [u8; 32] {
        keccak256(&keccak256(&self.body()))
    }

    pub fn serialize(&self) -> Vec<u8> {
        let body = self.body();
        let mut out =
            Vec::with_capacity(HEADER_FIXED_LEN + self.signatures.len() * SIGNATURE_LEN + body.len());
        out.push(self.version);
        out.extend_from_slice(&self.guardian_set_index.to_be_bytes());
        out.push(self.signatures.len() as u8);
        for sig in &self.signatures {
            out.push(sig.guardian_index);
            out.extend_from_slice(&sig.signature);
        }
        out.extend_from_slice(&body);
        out
    }

    pub fn id(&self) -> AttestationId {
        AttestationId {
            emitter_chain_id: self.emitter_chain_id,
            emitter_address: self.emitter_address,
            sequence: self.sequence,
        }
    }

    pub fn decode_deposit(&self) -> Result<DepositPayload, DecodeError> {
        decode_deposit_payload(&self.payload)
    }
}

/// 32-bit message nonce used by the legacy seal-initiator bridge messages.
///
/// Sequences above `u32::MAX` wrap; replay protection always keys on the full
/// 64-bit sequence in [`AttestationId`].
pub fn legacy_message_nonce(sequence: u64) -> u32 {
    (sequence & 0xFFFF_FFFF) as u32
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], AttestationError> {
        let remaining = self.buf.len() - self.pos;
        if remaining < N {
            return Err(AttestationError::Truncated {
                offset: self.pos,
                need: N,
                have: remaining,
            });
        }
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[self.pos..self.pos + N]);
        self.pos += N;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, AttestationError> {
        Ok(self.array::<1>()?[0])
    }

    fn u16(&mut self) -> Result<u16, AttestationError> {
        Ok(u16::from_be_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32, AttestationError> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64, AttestationError> {
        Ok(u64::from_be_bytes(self.array()?))
    }

    fn rest(&mut self) -> &'a [u8] {
        let out = &self.buf[self.pos..];
        self.pos = self.buf.len();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Attestation {
        Attestation {
            version: VAA_VERSION,
            guardian_set_index: 4,
            signatures: vec![
                GuardianSignature {
                    guardian_index: 0,
                    signature: [0xaa; 65],
                },
                GuardianSignature {
                    guardian_index: 3,
                    signature: [0xbb; 65],
                },
            ],
            timestamp: 1_700_000_000,
            nonce: 9,
            emitter_chain_id: 2,
            emitter_address: [0x0e; 32],
            sequence: 0x1_0000_0005,
            consistency_level: 15,
            payload: vec![1, 2, 3],
        }
    }

    #[test]
    fn test_parse_serialized() {
        let att = sample();
        let bytes = att.serialize();
        assert_eq!(bytes.len(), 6 + 2 * 66 + 51 + 3);
        assert_eq!(Attestation::parse(&bytes).unwrap(), att);
    }

    #[test]
    fn test_digest_covers_body_only() {
        let att = sample();
        let mut resigned = att.clone();
        resigned.signatures.truncate(1);
        resigned.guardian_set_index = 5;
        assert_eq!(att.digest(), resigned.digest());

        let mut other = att.clone();
        other.sequence += 1;
        assert_ne!(att.digest(), other.digest());
        assert_eq!(att.digest(), keccak256(&keccak256(&att.body())));
    }

    #[test]
    fn test_truncated_header() {
        let bytes = sample().serialize();
        let err = Attestation::parse(&bytes[..40]).unwrap_err();
        assert!(matches!(err, AttestationError::Truncated { offset: 7, .. }));
        assert!(Attestation::parse(&[]).is_err());
    }

    #[test]
    fn test_truncated_body() {
        let bytes = sample().serialize();
        // header intact, body cut inside the emitter address
        assert!(matches!(
            Attestation::parse(&bytes[..6 + 132 + 20]),
            Err(AttestationError::Truncated { .. })
        ));
    }

    #[test]
    fn test_unsupported_version() {
        let mut bytes = sample().serialize();
        bytes[0] = 2;
        assert_eq!(
            Attestation::parse(&bytes),
            Err(AttestationError::UnsupportedVersion(2))
        );
    }

    #[test]
    fn test_id_display() {
        let id = sample().id();
        assert_eq!(id.sequence, 0x1_0000_0005);
        assert!(id.to_string().starts_with("2/0e0e"));
        assert!(id.to_string().ends_with("/4294967301"));
    }

    #[test]
    fn test_legacy_message_nonce_wraps() {
        assert_eq!(legacy_message_nonce(5), 5);
        assert_eq!(legacy_message_nonce(0x1_0000_0005), 5);
        assert_eq!(legacy_message_nonce(u64::MAX), u32::MAX);
    }
}

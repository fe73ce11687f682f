//! Attestation verification
//!
//! An attestation is accepted when:
//!
//! 1. It parses as a v1 envelope
//! 2. Its emitter is one of the trusted source contracts
//! 3. It was signed under the current guardian set
//! 4. At least `quorum` distinct guardians signed the body digest
//! 5. Its payload decodes as a deposit
//! 6. Its id has not been consumed before
//!
//! Step 6 records the id atomically, so a given attestation is accepted at
//! most once across all workers sharing the consumed set.

use std::collections::HashSet;
use std::sync::Arc;

use k256::ecdsa::{RecoveryId, Signature, VerifyingKey};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::attestation::{Attestation, AttestationError, AttestationId};
use crate::codec::{DecodeError, DepositPayload};
use crate::types::{ErrorKind, SealHash};

pub mod consumed;
pub mod guardian;

pub use consumed::{ConsumedSet, ConsumedSetError, MemoryConsumedSet, PgConsumedSet};
pub use guardian::{
    guardian_address, CachedGuardianOracle, GuardianAddress, GuardianOracle, GuardianSet,
    HttpGuardianOracle, OracleError,
};

#[derive(Debug, Error)]
pub enum VerificationError {
    #[error("malformed attestation: {0}")]
    MalformedAttestation(String),
    #[error("emitter {emitter_chain_id}/{} is not trusted", hex::encode(.emitter_address))]
    UntrustedEmitter {
        emitter_chain_id: u16,
        emitter_address: [u8; 32],
    },
    #[error("attestation signed by guardian set {got}, current is {expected}")]
    GuardianSetMismatch { expected: u32, got: u32 },
    #[error("{valid} valid guardian signatures, {required} required")]
    InsufficientSignatures { valid: usize, required: usize },
    #[error("payload: {0}")]
    Payload(#[from] DecodeError),
    #[error("attestation {id} already consumed")]
    AlreadyConsumed {
        id: AttestationId,
        consumer: Option<SealHash>,
    },
    #[error(transparent)]
    ConsumedSet(#[from] ConsumedSetError),
}

impl From<AttestationError> for VerificationError {
    fn from(e: AttestationError) -> Self {
        VerificationError::MalformedAttestation(e.to_string())
    }
}

impl VerificationError {
    /// Storage trouble and a guardian set we have not seen yet are worth
    /// retrying; everything else is a property of the attestation bytes.
    pub fn is_retryable(&self) -> bool {
        match self {
            VerificationError::ConsumedSet(_) => true,
            VerificationError::GuardianSetMismatch { expected, got } => got > expected,
            _ => false,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            VerificationError::MalformedAttestation(_) => ErrorKind::MalformedAttestation,
            VerificationError::UntrustedEmitter { .. } => ErrorKind::UntrustedEmitter,
            VerificationError::GuardianSetMismatch { .. } => ErrorKind::GuardianSetMismatch,
            VerificationError::InsufficientSignatures { .. } => ErrorKind::InsufficientSignatures,
            VerificationError::Payload(e) => e.kind(),
            VerificationError::AlreadyConsumed { .. } => ErrorKind::AlreadyConsumed,
            VerificationError::ConsumedSet(_) => ErrorKind::RetriesExhausted,
        }
    }
}

/// A source contract allowed to emit deposits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TrustedEmitter {
    pub chain_id: u16,
    pub address: [u8; 32],
}

/// An attestation that passed every check and has been marked consumed.
#[derive(Debug, Clone)]
pub struct VerifiedDeposit {
    pub id: AttestationId,
    pub payload: DepositPayload,
    pub seal_hash: SealHash,
    pub valid_signatures: usize,
}

impl VerifiedDeposit {
    /// Rebuild from an attestation the ledger already recorded as verified.
    pub(crate) fn from_recorded(attestation: &Attestation) -> Result<Self, DecodeError> {
        let payload = attestation.decode_deposit()?;
        Ok(Self {
            id: attestation.id(),
            seal_hash: payload.seal_hash(),
            payload,
            valid_signatures: 0,
        })
    }
}

pub struct AttestationVerifier {
    trusted: HashSet<TrustedEmitter>,
    consumed: Arc<dyn ConsumedSet>,
}

impl AttestationVerifier {
    pub fn new(
        trusted: impl IntoIterator<Item = TrustedEmitter>,
        consumed: Arc<dyn ConsumedSet>,
    ) -> Self {
        Self {
            trusted: trusted.into_iter().collect(),
            consumed,
        }
    }

    pub fn is_trusted(&self, chain_id: u16, address: &[u8; 32]) -> bool {
        self.trusted.contains(&TrustedEmitter {
            chain_id,
            address: *address,
        })
    }

    pub async fn verify(
        &self,
        raw: &[u8],
        guardian_set: &GuardianSet,
    ) -> Result<VerifiedDeposit, VerificationError> {
        let attestation = Attestation::parse(raw)?;
        let id = attestation.id();

        if !self.is_trusted(attestation.emitter_chain_id, &attestation.emitter_address) {
            warn!(attestation = %id, "Attestation from untrusted emitter");
            return Err(VerificationError::UntrustedEmitter {
                emitter_chain_id: attestation.emitter_chain_id,
                emitter_address: attestation.emitter_address,
            });
        }

        if attestation.guardian_set_index != guardian_set.index {
            return Err(VerificationError::GuardianSetMismatch {
                expected: guardian_set.index,
                got: attestation.guardian_set_index,
            });
        }

        let valid = count_valid_signatures(&attestation, guardian_set);
        if valid < guardian_set.quorum {
            warn!(
                attestation = %id,
                valid,
                required = guardian_set.quorum,
                "Attestation below guardian quorum"
            );
            return Err(VerificationError::InsufficientSignatures {
                valid,
                required: guardian_set.quorum,
            });
        }

        // Decode before consuming so a bad payload never burns the id
        let payload = attestation.decode_deposit()?;
        if payload.source_chain_id != attestation.emitter_chain_id {
            return Err(VerificationError::MalformedAttestation(format!(
                "payload source chain {} differs from emitter chain {}",
                payload.source_chain_id, attestation.emitter_chain_id
            )));
        }
        let seal_hash = payload.seal_hash();

        if !self.consumed.insert_if_absent(&id, &seal_hash).await? {
            let consumer = self.consumed.consumer_of(&id).await?;
            debug!(attestation = %id, ?consumer, "Attestation already consumed");
            return Err(VerificationError::AlreadyConsumed { id, consumer });
        }

        info!(
            attestation = %id,
            seal_hash = %seal_hash,
            signatures = valid,
            "Attestation verified"
        );
        Ok(VerifiedDeposit {
            id,
            payload,
            seal_hash,
            valid_signatures: valid,
        })
    }
}

/// Count distinct guardians whose signature recovers to their registered key.
pub fn count_valid_signatures(attestation: &Attestation, set: &GuardianSet) -> usize {
    let digest = attestation.digest();
    let mut seen = vec![false; set.len()];
    let mut valid = 0;
    for sig in &attestation.signatures {
        let index = sig.guardian_index as usize;
        if index >= set.len() || seen[index] {
            continue;
        }
        match recover_address(&digest, &sig.signature) {
            Some(address) if address == set.keys[index] => {
                seen[index] = true;
                valid += 1;
            }
            _ => debug!(guardian = index, "Guardian signature did not verify"),
        }
    }
    valid
}

/// Recover the signer address of a 65-byte `r || s || v` signature.
pub fn recover_address(digest: &[u8; 32], signature: &[u8; 65]) -> Option<GuardianAddress> {
    let v = match signature[64] {
        v @ 0..=1 => v,
        v @ 27..=28 => v - 27,
        _ => return None,
    };
    let recovery_id = RecoveryId::from_byte(v)?;
    let sig = Signature::from_slice(&signature[..64]).ok()?;
    let key = VerifyingKey::recover_from_prehash(digest, &sig, recovery_id).ok()?;
    Some(guardian_address(&key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attestation::{GuardianSignature, VAA_VERSION};
    use crate::codec::{encode_deposit_payload, left_pad32};
    use k256::ecdsa::SigningKey;

    const EMITTER: [u8; 32] = [0x0e; 32];

    fn guardians(n: usize) -> Vec<SigningKey> {
        (1..=n)
            .map(|i| {
                let mut secret = [0u8; 32];
                secret[31] = i as u8;
                secret[0] = 0x42;
                SigningKey::from_slice(&secret).unwrap()
            })
            .collect()
    }

    fn guardian_set(keys: &[SigningKey]) -> GuardianSet {
        GuardianSet::new(
            0,
            keys.iter().map(|k| guardian_address(k.verifying_key())).collect(),
        )
    }

    fn payload(nonce: u64) -> DepositPayload {
        DepositPayload {
            source_chain_id: 2,
            source_contract: left_pad32(&[0xab, 0xcd]).unwrap(),
            token_id: left_pad32(&[42]).unwrap(),
            depositor: [0x33; 32],
            dwallet: [0x11; 32],
            deposit_block: 100,
            seal_nonce: nonce,
        }
    }

    fn signed(keys: &[SigningKey], signers: &[usize], sequence: u64, body: Vec<u8>) -> Vec<u8> {
        let mut att = Attestation {
            version: VAA_VERSION,
            guardian_set_index: 0,
            signatures: vec![],
            timestamp: 1,
            nonce: 0,
            emitter_chain_id: 2,
            emitter_address: EMITTER,
            sequence,
            consistency_level: 1,
            payload: body,
        };
        let digest = att.digest();
        for &i in signers {
            let (sig, recid) = keys[i].sign_prehash_recoverable(&digest).unwrap();
            let mut bytes = [0u8; 65];
            bytes[..64].copy_from_slice(&sig.to_bytes());
            bytes[64] = recid.to_byte();
            att.signatures.push(GuardianSignature {
                guardian_index: i as u8,
                signature: bytes,
            });
        }
        att.serialize()
    }

    fn verifier() -> AttestationVerifier {
        AttestationVerifier::new(
            [TrustedEmitter {
                chain_id: 2,
                address: EMITTER,
            }],
            Arc::new(MemoryConsumedSet::new()),
        )
    }

    #[tokio::test]
    async fn test_quorum_accepts() {
        let keys = guardians(19);
        let set = guardian_set(&keys);
        let signers: Vec<usize> = (0..13).collect();
        let raw = signed(&keys, &signers, 1, encode_deposit_payload(&payload(7)));

        let verified = verifier().verify(&raw, &set).await.unwrap();
        assert_eq!(verified.valid_signatures, 13);
        assert_eq!(verified.seal_hash, payload(7).seal_hash());
        assert_eq!(verified.id.sequence, 1);
    }

    #[tokio::test]
    async fn test_below_quorum_rejects() {
        let keys = guardians(19);
        let set = guardian_set(&keys);
        let signers: Vec<usize> = (0..10).collect();
        let raw = signed(&keys, &signers, 1, encode_deposit_payload(&payload(7)));

        let err = verifier().verify(&raw, &set).await.unwrap_err();
        assert!(matches!(
            err,
            VerificationError::InsufficientSignatures {
                valid: 10,
                required: 13
            }
        ));
    }

    #[tokio::test]
    async fn test_duplicate_signatures_count_once() {
        let keys = guardians(4);
        let set = guardian_set(&keys);
        assert_eq!(set.quorum, 3);
        let raw = signed(&keys, &[0, 0, 1, 1], 1, encode_deposit_payload(&payload(7)));

        let err = verifier().verify(&raw, &set).await.unwrap_err();
        assert!(matches!(
            err,
            VerificationError::InsufficientSignatures { valid: 2, .. }
        ));
    }

    #[tokio::test]
    async fn test_signature_from_wrong_slot_is_invalid() {
        let keys = guardians(4);
        let set = guardian_set(&keys);
        let mut raw = signed(&keys, &[0, 1, 2], 1, encode_deposit_payload(&payload(7)));
        // Relabel the third signature as guardian 3
        raw[6 + 66 * 2] = 3;

        let err = verifier().verify(&raw, &set).await.unwrap_err();
        assert!(matches!(
            err,
            VerificationError::InsufficientSignatures { valid: 2, .. }
        ));
    }

    #[tokio::test]
    async fn test_wrong_payload_id_does_not_consume() {
        let keys = guardians(4);
        let set = guardian_set(&keys);
        let mut body = encode_deposit_payload(&payload(7));
        body[0] = 2;
        let raw = signed(&keys, &[0, 1, 2], 1, body);

        let consumed = Arc::new(MemoryConsumedSet::new());
        let verifier = AttestationVerifier::new(
            [TrustedEmitter {
                chain_id: 2,
                address: EMITTER,
            }],
            consumed.clone(),
        );
        let err = verifier.verify(&raw, &set).await.unwrap_err();
        assert!(matches!(
            err,
            VerificationError::Payload(DecodeError::WrongPayloadId(2))
        ));
        assert_eq!(err.kind(), ErrorKind::WrongPayloadId);
        assert!(consumed.is_empty());
    }

    #[tokio::test]
    async fn test_untrusted_emitter() {
        let keys = guardians(4);
        let set = guardian_set(&keys);
        let raw = signed(&keys, &[0, 1, 2], 1, encode_deposit_payload(&payload(7)));
        let verifier = AttestationVerifier::new(
            [TrustedEmitter {
                chain_id: 2,
                address: [0xff; 32],
            }],
            Arc::new(MemoryConsumedSet::new()),
        );
        let err = verifier.verify(&raw, &set).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UntrustedEmitter);
    }

    #[tokio::test]
    async fn test_guardian_set_mismatch() {
        let keys = guardians(4);
        let set = GuardianSet {
            index: 1,
            ..guardian_set(&keys)
        };
        let raw = signed(&keys, &[0, 1, 2], 1, encode_deposit_payload(&payload(7)));
        let err = verifier().verify(&raw, &set).await.unwrap_err();
        assert!(matches!(
            err,
            VerificationError::GuardianSetMismatch {
                expected: 1,
                got: 0
            }
        ));
        // Signed under an expired set
        assert!(!err.is_retryable());

        // Signed under a set not yet published to us
        let set = GuardianSet {
            index: 0,
            ..guardian_set(&keys)
        };
        let mut attestation = Attestation::parse(&raw).unwrap();
        attestation.guardian_set_index = 2;
        let err = verifier()
            .verify(&attestation.serialize(), &set)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            VerificationError::GuardianSetMismatch {
                expected: 0,
                got: 2
            }
        ));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_malformed() {
        let keys = guardians(4);
        let set = guardian_set(&keys);
        let err = verifier().verify(&[1, 0, 0], &set).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedAttestation);
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_second_verify_is_already_consumed() {
        let keys = guardians(4);
        let set = guardian_set(&keys);
        let raw = signed(&keys, &[0, 1, 2], 9, encode_deposit_payload(&payload(7)));
        let verifier = verifier();

        let first = verifier.verify(&raw, &set).await.unwrap();
        match verifier.verify(&raw, &set).await.unwrap_err() {
            VerificationError::AlreadyConsumed { id, consumer } => {
                assert_eq!(id.sequence, 9);
                assert_eq!(consumer, Some(first.seal_hash));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_concurrent_verify_single_winner() {
        let keys = guardians(4);
        let set = Arc::new(guardian_set(&keys));
        let raw = Arc::new(signed(&keys, &[0, 1, 2], 3, encode_deposit_payload(&payload(7))));
        let verifier = Arc::new(verifier());

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let (v, s, r) = (verifier.clone(), set.clone(), raw.clone());
                tokio::spawn(async move { v.verify(&r, &s).await })
            })
            .collect();

        let mut ok = 0;
        let mut consumed = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => ok += 1,
                Err(VerificationError::AlreadyConsumed { .. }) => consumed += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(ok, 1);
        assert_eq!(consumed, 7);
    }

    #[test]
    fn test_recover_address_accepts_both_v_forms() {
        let keys = guardians(1);
        let digest = [7u8; 32];
        let (sig, recid) = keys[0].sign_prehash_recoverable(&digest).unwrap();
        let mut bytes = [0u8; 65];
        bytes[..64].copy_from_slice(&sig.to_bytes());
        bytes[64] = recid.to_byte() + 27;
        let expected = guardian_address(keys[0].verifying_key());
        assert_eq!(recover_address(&digest, &bytes), Some(expected));

        bytes[64] = 5;
        assert_eq!(recover_address(&digest, &bytes), None);
    }
}

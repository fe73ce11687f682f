//! Canonical byte encodings for seals
//!
//! The seal preimage and the deposit payload are shared with the source-chain
//! seal initiators and the Solana program. All integers are big-endian and
//! every variable-length field carries a one-byte length prefix, so two
//! distinct field tuples can never produce the same preimage.

use sha2::{Digest, Sha256};
use thiserror::Error;
use tiny_keccak::{Hasher, Keccak};

use crate::types::{ErrorKind, SealHash};

/// Wormhole chain id of the destination chain (Solana).
pub const DEST_CHAIN_ID: u16 = 1;

/// First byte of every deposit payload.
pub const PAYLOAD_ID_DEPOSIT: u8 = 1;

/// 1 + 2 + 32 + 32 + 32 + 32 + 8 + 32
pub const DEPOSIT_PAYLOAD_LEN: usize = 171;

/// Bytes of the preimage that do not depend on contract or token length.
pub const SEAL_PREIMAGE_FIXED_LEN: usize = 46;

/// Upper bound for any length-prefixed field.
pub const MAX_FIELD_LEN: usize = u8::MAX as usize;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodingError {
    #[error("{field} is {len} bytes, maximum is 255")]
    FieldTooLong { field: &'static str, len: usize },
}

impl EncodingError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::FieldTooLong
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("deposit payload is {got} bytes, expected {expected}")]
    TruncatedPayload { expected: usize, got: usize },
    #[error("payload id {0} is not a deposit")]
    WrongPayloadId(u8),
    #[error("seal nonce does not fit in 64 bits")]
    NonceOutOfRange,
}

impl DecodeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DecodeError::TruncatedPayload { .. } => ErrorKind::TruncatedPayload,
            DecodeError::WrongPayloadId(_) => ErrorKind::WrongPayloadId,
            DecodeError::NonceOutOfRange => ErrorKind::NonceOutOfRange,
        }
    }
}

/// Compute keccak256 hash of data
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak::v256();
    hasher.update(data);
    let mut output = [0u8; 32];
    hasher.finalize(&mut output);
    output
}

pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Build the seal preimage:
///
/// ```text
/// source_chain_id  u16 BE
/// dest_chain_id    u16 BE   (always DEST_CHAIN_ID)
/// len(contract)    u8
/// contract         bytes
/// len(token_id)    u8
/// token_id         bytes
/// attestation_pk   32 bytes
/// nonce            u64 BE
/// ```
pub fn encode_seal_preimage(
    source_chain_id: u16,
    source_contract: &[u8],
    token_id: &[u8],
    attestation_pubkey: &[u8; 32],
    nonce: u64,
) -> Result<Vec<u8>, EncodingError> {
    if source_contract.len() > MAX_FIELD_LEN {
        return Err(EncodingError::FieldTooLong {
            field: "source_contract",
            len: source_contract.len(),
        });
    }
    if token_id.len() > MAX_FIELD_LEN {
        return Err(EncodingError::FieldTooLong {
            field: "token_id",
            len: token_id.len(),
        });
    }

    let mut out =
        Vec::with_capacity(SEAL_PREIMAGE_FIXED_LEN + source_contract.len() + token_id.len());
    out.extend_from_slice(&source_chain_id.to_be_bytes());
    out.extend_from_slice(&DEST_CHAIN_ID.to_be_bytes());
    out.push(source_contract.len() as u8);
    out.extend_from_slice(source_contract);
    out.push(token_id.len() as u8);
    out.extend_from_slice(token_id);
    out.extend_from_slice(attestation_pubkey);
    out.extend_from_slice(&nonce.to_be_bytes());
    Ok(out)
}

/// SHA-256 of a preimage produced by [`encode_seal_preimage`].
pub fn seal_hash(preimage: &[u8]) -> SealHash {
    SealHash(sha256(preimage))
}

/// Encode and hash in one step.
pub fn compute_seal_hash(
    source_chain_id: u16,
    source_contract: &[u8],
    token_id: &[u8],
    attestation_pubkey: &[u8; 32],
    nonce: u64,
) -> Result<SealHash, EncodingError> {
    let preimage = encode_seal_preimage(
        source_chain_id,
        source_contract,
        token_id,
        attestation_pubkey,
        nonce,
    )?;
    Ok(seal_hash(&preimage))
}

/// Deposit payload carried in the body of a source-chain attestation.
///
/// `source_contract` and `token_id` are the 32-byte left-padded forms used on
/// the wire; `dwallet` is the Ed25519 public key of the dWallet that will sign
/// the seal hash and doubles as the attestation public key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepositPayload {
    pub source_chain_id: u16,
    pub source_contract: [u8; 32],
    pub token_id: [u8; 32],
    pub depositor: [u8; 32],
    pub dwallet: [u8; 32],
    pub deposit_block: u64,
    pub seal_nonce: u64,
}

impl DepositPayload {
    /// Seal preimage for this deposit. Contract and token are hashed in their
    /// full 32-byte form, which is what the source-side initiators commit to.
    pub fn seal_preimage(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(SEAL_PREIMAGE_FIXED_LEN + 64);
        out.extend_from_slice(&self.source_chain_id.to_be_bytes());
        out.extend_from_slice(&DEST_CHAIN_ID.to_be_bytes());
        out.push(32);
        out.extend_from_slice(&self.source_contract);
        out.push(32);
        out.extend_from_slice(&self.token_id);
        out.extend_from_slice(&self.dwallet);
        out.extend_from_slice(&self.seal_nonce.to_be_bytes());
        out
    }

    pub fn seal_hash(&self) -> SealHash {
        seal_hash(&self.seal_preimage())
    }
}

/// Encode a deposit payload
///
/// The seal nonce occupies a 32-byte word on the wire; only the low 8 bytes
/// are ever non-zero.
pub fn encode_deposit_payload(payload: &DepositPayload) -> Vec<u8> {
    let mut out = Vec::with_capacity(DEPOSIT_PAYLOAD_LEN);
    out.push(PAYLOAD_ID_DEPOSIT);
    out.extend_from_slice(&payload.source_chain_id.to_be_bytes());
    out.extend_from_slice(&payload.source_contract);
    out.extend_from_slice(&payload.token_id);
    out.extend_from_slice(&payload.depositor);
    out.extend_from_slice(&payload.dwallet);
    out.extend_from_slice(&payload.deposit_block.to_be_bytes());
    out.extend_from_slice(&[0u8; 24]);
    out.extend_from_slice(&payload.seal_nonce.to_be_bytes());
    out
}

/// Decode a deposit payload
///
/// The length check happens before the id check so a short buffer with the
/// wrong id reports truncation.
pub fn decode_deposit_payload(bytes: &[u8]) -> Result<DepositPayload, DecodeError> {
    if bytes.len() != DEPOSIT_PAYLOAD_LEN {
        return Err(DecodeError::TruncatedPayload {
            expected: DEPOSIT_PAYLOAD_LEN,
            got: bytes.len(),
        });
    }
    if bytes[0] != PAYLOAD_ID_DEPOSIT {
        return Err(DecodeError::WrongPayloadId(bytes[0]));
    }

    let mut reader = Reader::new(&bytes[1..]);
    let source_chain_id = reader.u16();
    let source_contract = reader.bytes32();
    let token_id = reader.bytes32();
    let depositor = reader.bytes32();
    let dwallet = reader.bytes32();
    let deposit_block = reader.u64();
    let nonce_word = reader.bytes32();

    if nonce_word[..24].iter().any(|b| *b != 0) {
        return Err(DecodeError::NonceOutOfRange);
    }
    let mut low = [0u8; 8];
    low.copy_from_slice(&nonce_word[24..]);

    Ok(DepositPayload {
        source_chain_id,
        source_contract,
        token_id,
        depositor,
        dwallet,
        deposit_block,
        seal_nonce: u64::from_be_bytes(low),
    })
}

/// Cursor over a buffer whose length has already been checked.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[self.pos..self.pos + N]);
        self.pos += N;
        out
    }

    fn u16(&mut self) -> u16 {
        u16::from_be_bytes(self.take())
    }

    fn u64(&mut self) -> u64 {
        u64::from_be_bytes(self.take())
    }

    fn bytes32(&mut self) -> [u8; 32] {
        self.take()
    }
}

/// Format bytes32 as a 0x-prefixed hex string
pub fn bytes32_to_hex(bytes: &[u8; 32]) -> String {
    format!("0x{}", hex::encode(bytes))
}

/// Parse a 0x-prefixed (or bare) hex string into bytes32
pub fn hex_to_bytes32(s: &str) -> Result<[u8; 32], hex::FromHexError> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    let mut out = [0u8; 32];
    hex::decode_to_slice(s, &mut out)?;
    Ok(out)
}

/// Left-pad up to 32 bytes into a word.
pub fn left_pad32(bytes: &[u8]) -> Option<[u8; 32]> {
    if bytes.len() > 32 {
        return None;
    }
    let mut out = [0u8; 32];
    out[32 - bytes.len()..].copy_from_slice(bytes);
    Some(out)
}

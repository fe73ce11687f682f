//! Threshold signing of seal hashes
//!
//! Every seal needs an Ed25519 signature from the deposit's dWallet over the
//! seal hash. Source chains configured for dual signing additionally need a
//! secp256k1 signature from a custody dWallet; both requests run concurrently
//! and the seal only advances when both succeed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use k256::ecdsa::VerifyingKey;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::types::ErrorKind;
use crate::verifier::{guardian_address, recover_address};

pub mod remote;

pub use remote::{Curve, DwalletId, HttpRemoteSigner, RemoteSigner, RemoteSignerError, SignRequest};

/// Ed25519 signing by the deposit's own dWallet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ed25519;

/// secp256k1 signing by a fixed custody dWallet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Secp256k1 {
    pub custody_dwallet: DwalletId,
    /// Public key the custody signature must recover to
    pub custody_key: VerifyingKey,
}

/// Which signatures a source chain requires
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SigningTopology {
    Single(Ed25519),
    Dual(Secp256k1, Ed25519),
}

impl Default for SigningTopology {
    fn default() -> Self {
        SigningTopology::Single(Ed25519)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SigningError {
    #[error("signing timed out after {0:?}")]
    Timeout(Duration),
    #[error("signing network error: {0}")]
    NetworkError(String),
    #[error("signing capability permanently revoked: {0}")]
    PermanentlyRevoked(String),
    #[error("signer returned an invalid signature: {0}")]
    InvalidSignature(String),
}

impl SigningError {
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            SigningError::PermanentlyRevoked(_) | SigningError::InvalidSignature(_)
        )
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            SigningError::PermanentlyRevoked(_) => ErrorKind::PermanentlyRevoked,
            SigningError::InvalidSignature(_) => ErrorKind::InvalidSignature,
            _ => ErrorKind::RetriesExhausted,
        }
    }
}

impl From<RemoteSignerError> for SigningError {
    fn from(e: RemoteSignerError) -> Self {
        match e {
            RemoteSignerError::Revoked(reason) => SigningError::PermanentlyRevoked(reason),
            other => SigningError::NetworkError(other.to_string()),
        }
    }
}

/// Signatures produced for one seal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealSignature {
    pub message: [u8; 32],
    /// Ed25519 signature by the attestation dWallet.
    pub attestation: [u8; 64],
    /// secp256k1 signature by the custody dWallet, for dual-signed chains.
    pub custody: Option<Vec<u8>>,
}

pub struct SigningCoordinator {
    signer: Arc<dyn RemoteSigner>,
    topologies: HashMap<u16, SigningTopology>,
}

impl SigningCoordinator {
    pub fn new(signer: Arc<dyn RemoteSigner>, topologies: HashMap<u16, SigningTopology>) -> Self {
        Self { signer, topologies }
    }

    /// Topology for a source chain; chains not configured otherwise are single-signed.
    pub fn topology_for(&self, source_chain_id: u16) -> SigningTopology {
        self.topologies
            .get(&source_chain_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Sign `message` (a seal hash) for a seal from `source_chain_id`.
    ///
    /// Each remote call is bounded by `timeout`. For dual topologies a failure
    /// of either half fails the whole request and the other half is dropped.
    pub async fn request_signature(
        &self,
        source_chain_id: u16,
        dwallet_id: &DwalletId,
        message: &[u8; 32],
        timeout: Duration,
    ) -> Result<SealSignature, SigningError> {
        let ed_request = SignRequest {
            dwallet_id: dwallet_id.clone(),
            curve: Curve::Ed25519,
            message: *message,
        };

        match self.topology_for(source_chain_id) {
            SigningTopology::Single(Ed25519) => {
                let attestation = self.sign_ed25519(&ed_request, timeout).await?;
                debug!(dwallet = %dwallet_id, "Ed25519 signature obtained");
                Ok(SealSignature {
                    message: *message,
                    attestation,
                    custody: None,
                })
            }
            SigningTopology::Dual(
                Secp256k1 {
                    custody_dwallet,
                    custody_key,
                },
                Ed25519,
            ) => {
                let custody_request = SignRequest {
                    dwallet_id: custody_dwallet,
                    curve: Curve::Secp256k1,
                    message: *message,
                };
                let (custody, attestation) = futures::future::try_join(
                    self.sign_raw(&custody_request, timeout),
                    self.sign_ed25519(&ed_request, timeout),
                )
                .await?;
                verify_custody_signature(&custody_key, message, &custody)?;
                info!(
                    dwallet = %dwallet_id,
                    custody = %custody_request.dwallet_id,
                    "Dual signature obtained"
                );
                Ok(SealSignature {
                    message: *message,
                    attestation,
                    custody: Some(custody),
                })
            }
        }
    }

    async fn sign_ed25519(
        &self,
        request: &SignRequest,
        timeout: Duration,
    ) -> Result<[u8; 64], SigningError> {
        let raw = self.sign_raw(request, timeout).await?;
        <[u8; 64]>::try_from(raw.as_slice()).map_err(|_| {
            SigningError::NetworkError(format!("ed25519 signature is {} bytes", raw.len()))
        })
    }

    async fn sign_raw(
        &self,
        request: &SignRequest,
        timeout: Duration,
    ) -> Result<Vec<u8>, SigningError> {
        let signature = match tokio::time::timeout(timeout, self.signer.sign(request)).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(dwallet = %request.dwallet_id, curve = ?request.curve, ?timeout, "Signing timed out");
                return Err(SigningError::Timeout(timeout));
            }
        };
        if signature.len() != request.curve.signature_len() {
            return Err(SigningError::NetworkError(format!(
                "{:?} signature is {} bytes",
                request.curve,
                signature.len()
            )));
        }
        Ok(signature)
    }
}

/// Check a 65-byte `r || s || v` custody signature over `message` recovers
/// to `custody_key`.
pub fn verify_custody_signature(
    custody_key: &VerifyingKey,
    message: &[u8; 32],
    signature: &[u8],
) -> Result<(), SigningError> {
    let signature = <[u8; 65]>::try_from(signature).map_err(|_| {
        SigningError::InvalidSignature(format!("custody signature is {} bytes", signature.len()))
    })?;
    match recover_address(message, &signature) {
        Some(address) if address == guardian_address(custody_key) => Ok(()),
        _ => {
            error!("Custody signature does not recover to the custody key");
            Err(SigningError::InvalidSignature(
                "custody signature does not recover to the custody key".to_string(),
            ))
        }
    }
}

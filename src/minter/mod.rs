//! Exactly-once minting on the destination chain
//!
//! The replay guard is the per-seal record account: the program creates it
//! with `init`, so a second mint for the same seal hash fails on-chain no
//! matter how many relayers race. The existence check here only saves a
//! doomed transaction.

use std::sync::Arc;

use ed25519_dalek::{Signature, VerifyingKey};
use solana_sdk::pubkey::Pubkey;
use solana_sdk::system_program;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::signing::SealSignature;
use crate::types::{ErrorKind, SealHash};
use crate::verifier::VerifiedDeposit;

pub mod chain;
pub mod derivation;
pub mod instruction;
pub mod solana;

pub use chain::{ChainError, DestinationChain};
pub use derivation::MintAuthorityDerivation;
pub use instruction::{build_mint_instructions, MintInstruction};
pub use solana::SolanaChain;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MintError {
    #[error("seal already minted at {mint_address}")]
    AlreadyMinted { mint_address: String },
    #[error("invalid seal signature: {0}")]
    InvalidSignature(String),
    #[error("invalid recipient: {0}")]
    InvalidRecipient(String),
    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),
    #[error("network error: {0}")]
    NetworkError(String),
}

impl MintError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MintError::InsufficientFunds(_) | MintError::NetworkError(_)
        )
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            MintError::InvalidSignature(_) => ErrorKind::InvalidSignature,
            MintError::InvalidRecipient(_) => ErrorKind::InvalidRecipient,
            _ => ErrorKind::RetriesExhausted,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MintResult {
    pub mint_address: String,
    pub tx_ref: String,
}

pub struct DestinationMinter {
    chain: Arc<dyn DestinationChain>,
    program_id: Pubkey,
}

impl DestinationMinter {
    pub fn new(chain: Arc<dyn DestinationChain>, program_id: Pubkey) -> Self {
        Self { chain, program_id }
    }

    pub fn derive(&self, seal_hash: &SealHash) -> MintAuthorityDerivation {
        MintAuthorityDerivation::derive(&self.program_id, seal_hash)
    }

    pub async fn mint(
        &self,
        seal_hash: &SealHash,
        deposit: &VerifiedDeposit,
        signature: &SealSignature,
        recipient: &Pubkey,
    ) -> Result<MintResult, MintError> {
        let derivation = self.derive(seal_hash);
        let mint_address = derivation.asset.to_string();

        if self
            .chain
            .account_exists(&derivation.destination_address)
            .await
            .map_err(chain_to_mint_error)?
        {
            info!(%seal_hash, %mint_address, "Seal already minted");
            return Err(MintError::AlreadyMinted { mint_address });
        }

        verify_seal_signature(seal_hash, deposit, signature)?;
        check_recipient(recipient, &self.program_id)?;

        let mint = MintInstruction {
            seal_hash: *seal_hash,
            derivation,
            recipient: *recipient,
            attestation_pubkey: deposit.payload.dwallet,
            signature: signature.attestation,
            source_chain_id: deposit.payload.source_chain_id,
            source_contract: deposit.payload.source_contract.to_vec(),
            token_id: deposit.payload.token_id.to_vec(),
        };
        let instructions = build_mint_instructions(&self.program_id, &self.chain.payer(), &mint)
            .map_err(|e| MintError::NetworkError(format!("encode mint instruction: {}", e)))?;

        match self.chain.submit(instructions).await {
            Ok(tx_ref) => {
                info!(%seal_hash, %mint_address, %tx_ref, "Seal minted");
                Ok(MintResult {
                    mint_address,
                    tx_ref,
                })
            }
            Err(ChainError::AccountInUse(detail)) => {
                warn!(%seal_hash, %detail, "Lost mint race; seal already minted");
                Err(MintError::AlreadyMinted { mint_address })
            }
            Err(e) => Err(chain_to_mint_error(e)),
        }
    }
}

fn chain_to_mint_error(e: ChainError) -> MintError {
    match e {
        ChainError::InsufficientFunds(d) => MintError::InsufficientFunds(d),
        ChainError::Network(d) | ChainError::AccountInUse(d) => MintError::NetworkError(d),
    }
}

/// The signature must be over exactly this seal hash, by exactly the
/// deposit's dWallet key.
pub fn verify_seal_signature(
    seal_hash: &SealHash,
    deposit: &VerifiedDeposit,
    signature: &SealSignature,
) -> Result<(), MintError> {
    let hash_matches: bool = deposit.seal_hash.0[..].ct_eq(&seal_hash.0[..]).into();
    let message_matches: bool = signature.message[..].ct_eq(&seal_hash.0[..]).into();
    if !(hash_matches & message_matches) {
        error!(%seal_hash, "Seal signature bound to a different seal hash");
        return Err(MintError::InvalidSignature(
            "signed message does not match seal hash".to_string(),
        ));
    }

    let key = VerifyingKey::from_bytes(&deposit.payload.dwallet)
        .map_err(|e| MintError::InvalidSignature(format!("attestation pubkey: {}", e)))?;
    let sig = Signature::from_bytes(&signature.attestation);
    key.verify_strict(seal_hash.as_bytes(), &sig).map_err(|e| {
        error!(%seal_hash, "Seal signature failed verification");
        MintError::InvalidSignature(e.to_string())
    })
}

fn check_recipient(recipient: &Pubkey, program_id: &Pubkey) -> Result<(), MintError> {
    if *recipient == Pubkey::default() || *recipient == system_program::id() {
        return Err(MintError::InvalidRecipient(format!(
            "{} cannot own an asset",
            recipient
        )));
    }
    if recipient == program_id {
        return Err(MintError::InvalidRecipient(
            "recipient is the reborn program".to_string(),
        ));
    }
    Ok(())
}

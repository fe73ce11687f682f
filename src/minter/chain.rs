//! Destination chain RPC seam

use async_trait::async_trait;
use solana_sdk::instruction::Instruction;
use solana_sdk::pubkey::Pubkey;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainError {
    /// An account the transaction creates already exists.
    #[error("account already in use: {0}")]
    AccountInUse(String),
    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),
    #[error("rpc error: {0}")]
    Network(String),
}

/// Classify an RPC error message.
pub fn classify_chain_error(message: &str) -> ChainError {
    let lower = message.to_lowercase();
    if lower.contains("already in use") {
        ChainError::AccountInUse(message.to_string())
    } else if lower.contains("insufficient funds") || lower.contains("insufficient lamports") {
        ChainError::InsufficientFunds(message.to_string())
    } else {
        ChainError::Network(message.to_string())
    }
}

#[async_trait]
pub trait DestinationChain: Send + Sync {
    /// Fee payer and signer of submitted transactions.
    fn payer(&self) -> Pubkey;

    /// Whether `address` exists at finalized commitment.
    async fn account_exists(&self, address: &Pubkey) -> Result<bool, ChainError>;

    /// Sign, send and confirm; returns the transaction signature.
    async fn submit(&self, instructions: Vec<Instruction>) -> Result<String, ChainError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_chain_error() {
        assert!(matches!(
            classify_chain_error("Allocate: account Address { .. } already in use"),
            ChainError::AccountInUse(_)
        ));
        assert!(matches!(
            classify_chain_error("Transfer: insufficient lamports 10, need 20"),
            ChainError::InsufficientFunds(_)
        ));
        assert!(matches!(
            classify_chain_error("error sending request: connection refused"),
            ChainError::Network(_)
        ));
    }
}

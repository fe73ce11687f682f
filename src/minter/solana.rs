//! Solana RPC implementation of [`DestinationChain`]

use async_trait::async_trait;
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_sdk::commitment_config::CommitmentConfig;
use solana_sdk::instruction::Instruction;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::{Keypair, Signer};
use solana_sdk::transaction::Transaction;
use tracing::{debug, info, warn};

use super::chain::{classify_chain_error, ChainError, DestinationChain};

pub struct SolanaChain {
    rpc: RpcClient,
    payer: Keypair,
}

impl SolanaChain {
    pub fn new(rpc_url: &str, payer: Keypair) -> Self {
        Self {
            rpc: RpcClient::new_with_commitment(rpc_url.to_string(), CommitmentConfig::confirmed()),
            payer,
        }
    }
}

#[async_trait]
impl DestinationChain for SolanaChain {
    fn payer(&self) -> Pubkey {
        self.payer.pubkey()
    }

    async fn account_exists(&self, address: &Pubkey) -> Result<bool, ChainError> {
        let response = self
            .rpc
            .get_account_with_commitment(address, CommitmentConfig::finalized())
            .await
            .map_err(|e| ChainError::Network(e.to_string()))?;
        debug!(%address, exists = response.value.is_some(), "Checked destination account");
        Ok(response.value.is_some())
    }

    async fn submit(&self, instructions: Vec<Instruction>) -> Result<String, ChainError> {
        let blockhash = self
            .rpc
            .get_latest_blockhash()
            .await
            .map_err(|e| ChainError::Network(e.to_string()))?;
        let tx = Transaction::new_signed_with_payer(
            &instructions,
            Some(&self.payer.pubkey()),
            &[&self.payer],
            blockhash,
        );

        match self.rpc.send_and_confirm_transaction(&tx).await {
            Ok(signature) => {
                info!(%signature, "Mint transaction confirmed");
                Ok(signature.to_string())
            }
            Err(e) => {
                let err = classify_chain_error(&e.to_string());
                warn!(error = %err, "Mint transaction failed");
                Err(err)
            }
        }
    }
}

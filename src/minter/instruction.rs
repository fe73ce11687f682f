//! Reborn program instructions
//!
//! A mint transaction is two instructions: an Ed25519 signature-verify
//! precompile over the seal hash at index 0, then `mint_reborn`, which reads
//! the precompile back through the instructions sysvar.

use borsh::BorshSerialize;
use solana_sdk::instruction::{AccountMeta, Instruction};
use solana_sdk::pubkey::Pubkey;
use solana_sdk::{ed25519_program, system_program, sysvar};

use super::derivation::{config_address, MintAuthorityDerivation};
use crate::codec::sha256;
use crate::types::SealHash;

pub const MPL_CORE_PROGRAM_ID: Pubkey =
    solana_sdk::pubkey!("CoREENxT6tW1HoK8ypY1SxRMZTcVPm7R94rH4PZNhX7d");

const ED25519_HEADER_LEN: usize = 16;
const ED25519_PUBKEY_LEN: usize = 32;
const ED25519_SIGNATURE_LEN: usize = 64;
/// Offsets refer to data inside the precompile instruction itself.
const CURRENT_INSTRUCTION: u16 = u16::MAX;

/// Everything `mint_reborn` needs about one seal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MintInstruction {
    pub seal_hash: SealHash,
    pub derivation: MintAuthorityDerivation,
    pub recipient: Pubkey,
    pub attestation_pubkey: [u8; 32],
    pub signature: [u8; 64],
    pub source_chain_id: u16,
    pub source_contract: Vec<u8>,
    pub token_id: Vec<u8>,
}

#[derive(BorshSerialize)]
struct MintRebornArgs {
    seal_hash: [u8; 32],
    source_chain: u16,
    source_contract: Vec<u8>,
    token_id: Vec<u8>,
    attestation_pubkey: [u8; 32],
}

/// Anchor-style discriminator: first 8 bytes of sha256("global:<name>").
pub fn instruction_discriminator(name: &str) -> [u8; 8] {
    let hash = sha256(format!("global:{}", name).as_bytes());
    let mut out = [0u8; 8];
    out.copy_from_slice(&hash[..8]);
    out
}

/// Ed25519 precompile instruction carrying one signature over `message`.
pub fn ed25519_verify_instruction(
    pubkey: &[u8; 32],
    signature: &[u8; 64],
    message: &[u8],
) -> Instruction {
    let pubkey_offset = ED25519_HEADER_LEN;
    let signature_offset = pubkey_offset + ED25519_PUBKEY_LEN;
    let message_offset = signature_offset + ED25519_SIGNATURE_LEN;

    let mut data = Vec::with_capacity(message_offset + message.len());
    data.push(1); // signature count
    data.push(0); // padding
    for field in [
        signature_offset as u16,
        CURRENT_INSTRUCTION,
        pubkey_offset as u16,
        CURRENT_INSTRUCTION,
        message_offset as u16,
        message.len() as u16,
        CURRENT_INSTRUCTION,
    ] {
        data.extend_from_slice(&field.to_le_bytes());
    }
    data.extend_from_slice(pubkey);
    data.extend_from_slice(signature);
    data.extend_from_slice(message);

    Instruction {
        program_id: ed25519_program::id(),
        accounts: vec![],
        data,
    }
}

/// Build the full instruction list for a mint.
pub fn build_mint_instructions(
    program_id: &Pubkey,
    payer: &Pubkey,
    mint: &MintInstruction,
) -> std::io::Result<Vec<Instruction>> {
    let verify = ed25519_verify_instruction(
        &mint.attestation_pubkey,
        &mint.signature,
        mint.seal_hash.as_bytes(),
    );

    let args = MintRebornArgs {
        seal_hash: mint.seal_hash.0,
        source_chain: mint.source_chain_id,
        source_contract: mint.source_contract.clone(),
        token_id: mint.token_id.clone(),
        attestation_pubkey: mint.attestation_pubkey,
    };
    let mut data = instruction_discriminator("mint_reborn").to_vec();
    data.extend_from_slice(&args.try_to_vec()?);

    let accounts = vec![
        AccountMeta::new_readonly(config_address(program_id), false),
        AccountMeta::new(mint.derivation.destination_address, false),
        AccountMeta::new_readonly(mint.derivation.authority, false),
        AccountMeta::new(mint.derivation.asset, false),
        AccountMeta::new_readonly(mint.recipient, false),
        AccountMeta::new(*payer, true),
        AccountMeta::new_readonly(sysvar::instructions::id(), false),
        AccountMeta::new_readonly(MPL_CORE_PROGRAM_ID, false),
        AccountMeta::new_readonly(system_program::id(), false),
    ];

    Ok(vec![
        verify,
        Instruction {
            program_id: *program_id,
            accounts,
            data,
        },
    ])
}

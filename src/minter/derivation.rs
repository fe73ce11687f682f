//! Deterministic destination addresses
//!
//! Every address the reborn program touches for a seal is a program-derived
//! address seeded by the seal hash, so any observer holding the program id
//! can recompute them without asking the relayer.

use solana_sdk::pubkey::Pubkey;

use crate::types::SealHash;

pub const CONFIG_SEED: &[u8] = b"ika_config";
pub const RECORD_SEED: &[u8] = b"reincarnation";
pub const MINT_SEED: &[u8] = b"reincarnation_mint";
pub const ASSET_SEED: &[u8] = b"reincarnation_asset";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MintAuthorityDerivation {
    /// Permanent per-seal account. Its existence means the seal was minted.
    pub destination_address: Pubkey,
    pub destination_bump: u8,
    /// Update authority of the reborn asset; never holds lamports.
    pub authority: Pubkey,
    pub authority_bump: u8,
    /// The reborn asset itself.
    pub asset: Pubkey,
    pub asset_bump: u8,
}

impl MintAuthorityDerivation {
    pub fn derive(program_id: &Pubkey, seal_hash: &SealHash) -> Self {
        let (destination_address, destination_bump) =
            Pubkey::find_program_address(&[RECORD_SEED, seal_hash.as_bytes()], program_id);
        let (authority, authority_bump) =
            Pubkey::find_program_address(&[MINT_SEED, seal_hash.as_bytes()], program_id);
        let (asset, asset_bump) =
            Pubkey::find_program_address(&[ASSET_SEED, seal_hash.as_bytes()], program_id);
        Self {
            destination_address,
            destination_bump,
            authority,
            authority_bump,
            asset,
            asset_bump,
        }
    }

    /// Signer seeds the program uses for the mint authority.
    pub fn authority_seed(&self, seal_hash: &SealHash) -> [Vec<u8>; 3] {
        [
            MINT_SEED.to_vec(),
            seal_hash.as_bytes().to_vec(),
            vec![self.authority_bump],
        ]
    }
}

pub fn config_address(program_id: &Pubkey) -> Pubkey {
    Pubkey::find_program_address(&[CONFIG_SEED], program_id).0
}

use eyre::{eyre, Result, WrapErr};
use std::collections::{HashMap, HashSet};
use std::env;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use k256::ecdsa::VerifyingKey;
use solana_sdk::pubkey::Pubkey;

use crate::codec::hex_to_bytes32;
use crate::orchestrator::{OrchestratorConfig, RetryConfig};
use crate::signing::{DwalletId, Ed25519, Secp256k1, SigningTopology};
use crate::verifier::TrustedEmitter;

/// Main configuration for the relayer
#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub guardian: GuardianConfig,
    pub source: SourceConfig,
    pub signer: SignerConfig,
    pub solana: SolanaConfig,
    pub relayer: RelayerConfig,
    pub api_port: u16,
    pub log_format: LogFormat,
}

/// Database configuration
#[derive(Clone)]
pub struct DatabaseConfig {
    pub url: String,
}

/// Custom Debug that redacts the database URL (may contain credentials).
impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("url", &"<redacted>")
            .finish()
    }
}

/// Guardian set source
#[derive(Debug, Clone)]
pub struct GuardianConfig {
    pub api_url: String,
    pub set_ttl_secs: u64,
    /// How long a rotated-out set still verifies attestations
    pub set_expiry_secs: u64,
    /// Raise the required signature count above the default supermajority
    pub quorum: Option<usize>,
}

/// Source chains and the attestation feed
#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub vaa_api_url: String,
    pub trusted_emitters: Vec<TrustedEmitter>,
}

/// Remote dWallet signer
#[derive(Debug, Clone)]
pub struct SignerConfig {
    pub url: String,
    pub timeout_ms: u64,
    /// Source chains that also need a custody signature, with the custody
    /// dWallet and its public key
    pub dual_sign_chains: HashMap<u16, Secp256k1>,
}

/// Destination chain
#[derive(Clone)]
pub struct SolanaConfig {
    pub rpc_url: String,
    pub program_id: Pubkey,
    /// Path to the fee payer keypair file
    pub keypair_path: String,
}

/// Custom Debug that hides where the payer key lives.
impl fmt::Debug for SolanaConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SolanaConfig")
            .field("rpc_url", &self.rpc_url)
            .field("program_id", &self.program_id)
            .field("keypair_path", &"<redacted>")
            .finish()
    }
}

/// Worker pool and retry settings
#[derive(Debug, Clone)]
pub struct RelayerConfig {
    pub workers: usize,
    pub poll_interval_ms: u64,
    pub retry_max_attempts: u32,
    pub retry_initial_ms: u64,
    pub retry_max_ms: u64,
    pub stage_timeout_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Default functions
fn default_guardian_set_ttl() -> u64 {
    300
}

fn default_guardian_set_expiry() -> u64 {
    86_400
}

fn default_signer_timeout() -> u64 {
    30_000
}

fn default_workers() -> usize {
    4
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_retry_max_attempts() -> u32 {
    5
}

fn default_retry_initial() -> u64 {
    2000
}

fn default_retry_max() -> u64 {
    60_000
}

fn default_stage_timeout() -> u64 {
    30_000
}

fn default_api_port() -> u16 {
    9090
}

fn required(key: &str) -> Result<String> {
    env::var(key).map_err(|_| eyre!("{} environment variable is required", key))
}

fn optional<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}

impl Config {
    /// Load configuration from environment variables
    /// Loads .env file if present, then reads from environment
    pub fn load() -> Result<Self> {
        Self::load_from_file(".env").or_else(|_| Self::load_from_env())
    }

    /// Load from a specific .env file path
    pub fn load_from_file(path: &str) -> Result<Self> {
        if Path::new(path).exists() {
            dotenvy::from_filename(path)
                .wrap_err_with(|| format!("Failed to load .env file from {}", path))?;
        }
        Self::load_from_env()
    }

    fn load_from_env() -> Result<Self> {
        let database = DatabaseConfig {
            url: required("DATABASE_URL")?,
        };

        let guardian = GuardianConfig {
            api_url: required("GUARDIAN_API_URL")?,
            set_ttl_secs: optional("GUARDIAN_SET_TTL_SECS").unwrap_or(default_guardian_set_ttl()),
            set_expiry_secs: optional("GUARDIAN_SET_EXPIRY_SECS")
                .unwrap_or(default_guardian_set_expiry()),
            quorum: optional("GUARDIAN_QUORUM"),
        };

        let source = SourceConfig {
            vaa_api_url: required("VAA_API_URL")?,
            trusted_emitters: parse_trusted_emitters(&required("TRUSTED_EMITTERS")?)
                .wrap_err("TRUSTED_EMITTERS must be chain:hex32[,chain:hex32...]")?,
        };

        let signer = SignerConfig {
            url: required("SIGNER_URL")?,
            timeout_ms: optional("SIGNER_TIMEOUT_MS").unwrap_or(default_signer_timeout()),
            dual_sign_chains: match env::var("DUAL_SIGN_CHAINS") {
                Ok(raw) => parse_dual_sign_chains(&raw)
                    .wrap_err("DUAL_SIGN_CHAINS must be chain:dwallet:sec1_hex[,...]")?,
                Err(_) => HashMap::new(),
            },
        };

        let solana = SolanaConfig {
            rpc_url: required("SOLANA_RPC_URL")?,
            program_id: required("SOLANA_PROGRAM_ID")?
                .parse()
                .map_err(|e| eyre!("SOLANA_PROGRAM_ID must be a base58 pubkey: {}", e))?,
            keypair_path: required("SOLANA_KEYPAIR")?,
        };

        let relayer = RelayerConfig {
            workers: optional("WORKERS").unwrap_or(default_workers()),
            poll_interval_ms: optional("POLL_INTERVAL_MS").unwrap_or(default_poll_interval()),
            retry_max_attempts: optional("RETRY_MAX_ATTEMPTS")
                .unwrap_or(default_retry_max_attempts()),
            retry_initial_ms: optional("RETRY_INITIAL_MS").unwrap_or(default_retry_initial()),
            retry_max_ms: optional("RETRY_MAX_MS").unwrap_or(default_retry_max()),
            stage_timeout_ms: optional("STAGE_TIMEOUT_MS").unwrap_or(default_stage_timeout()),
        };

        let log_format = match env::var("LOG_FORMAT").as_deref() {
            Ok("json") => LogFormat::Json,
            _ => LogFormat::Pretty,
        };

        let config = Config {
            database,
            guardian,
            source,
            signer,
            solana,
            relayer,
            api_port: optional("API_PORT").unwrap_or(default_api_port()),
            log_format,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.database.url.is_empty() {
            return Err(eyre!("database.url cannot be empty"));
        }
        if self.guardian.api_url.is_empty() {
            return Err(eyre!("guardian.api_url cannot be empty"));
        }
        if self.source.trusted_emitters.is_empty() {
            return Err(eyre!("at least one trusted emitter is required"));
        }

        // The ingestion cursor is keyed by chain, so one emitter per chain
        let mut chains = HashSet::new();
        for emitter in &self.source.trusted_emitters {
            if !chains.insert(emitter.chain_id) {
                return Err(eyre!(
                    "chain {} has more than one trusted emitter",
                    emitter.chain_id
                ));
            }
        }

        for chain in self.signer.dual_sign_chains.keys() {
            if !chains.contains(chain) {
                return Err(eyre!(
                    "DUAL_SIGN_CHAINS names chain {} which has no trusted emitter",
                    chain
                ));
            }
        }

        if self.relayer.workers == 0 {
            return Err(eyre!("relayer.workers must be at least 1"));
        }
        if self.relayer.retry_initial_ms > self.relayer.retry_max_ms {
            return Err(eyre!("RETRY_INITIAL_MS cannot exceed RETRY_MAX_MS"));
        }
        if self.relayer.stage_timeout_ms == 0 || self.signer.timeout_ms == 0 {
            return Err(eyre!("timeouts must be non-zero"));
        }

        Ok(())
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            workers: self.relayer.workers,
            poll_interval: Duration::from_millis(self.relayer.poll_interval_ms),
            batch_size: self.relayer.workers * 16,
            stage_timeout: Duration::from_millis(self.relayer.stage_timeout_ms),
            retry: RetryConfig {
                max_attempts: self.relayer.retry_max_attempts,
                initial_backoff: Duration::from_millis(self.relayer.retry_initial_ms),
                max_backoff: Duration::from_millis(self.relayer.retry_max_ms),
                ..RetryConfig::default()
            },
        }
    }

    /// Signing topology for every configured source chain.
    pub fn signing_topologies(&self) -> HashMap<u16, SigningTopology> {
        self.source
            .trusted_emitters
            .iter()
            .map(|emitter| {
                let topology = match self.signer.dual_sign_chains.get(&emitter.chain_id) {
                    Some(custody) => SigningTopology::Dual(custody.clone(), Ed25519),
                    None => SigningTopology::Single(Ed25519),
                };
                (emitter.chain_id, topology)
            })
            .collect()
    }
}

fn split_pair(entry: &str) -> Result<(u16, &str)> {
    let (chain, value) = entry
        .split_once(':')
        .ok_or_else(|| eyre!("'{}' is missing ':'", entry))?;
    let chain = chain
        .trim()
        .parse()
        .wrap_err_with(|| format!("'{}' is not a u16 chain id", chain))?;
    Ok((chain, value.trim()))
}

/// Parse `chain:hex32,chain:hex32`.
pub fn parse_trusted_emitters(raw: &str) -> Result<Vec<TrustedEmitter>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|entry| {
            let (chain_id, address) = split_pair(entry)?;
            let address = hex_to_bytes32(address)
                .map_err(|e| eyre!("emitter address '{}': {}", address, e))?;
            Ok(TrustedEmitter { chain_id, address })
        })
        .collect()
}

/// Parse `chain:dwallet:sec1_hex,...` where `sec1_hex` is the custody
/// dWallet's secp256k1 public key.
pub fn parse_dual_sign_chains(raw: &str) -> Result<HashMap<u16, Secp256k1>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|entry| {
            let (chain_id, custody) = split_pair(entry)?;
            let (dwallet, key) = custody
                .rsplit_once(':')
                .ok_or_else(|| eyre!("chain {} is missing the custody public key", chain_id))?;
            if dwallet.trim().is_empty() {
                return Err(eyre!("chain {} has an empty custody dWallet", chain_id));
            }
            let key = key.trim();
            let bytes = hex::decode(key.strip_prefix("0x").unwrap_or(key))
                .wrap_err_with(|| format!("chain {} custody key is not hex", chain_id))?;
            let custody_key = VerifyingKey::from_sec1_bytes(&bytes)
                .map_err(|e| eyre!("chain {} custody key: {}", chain_id, e))?;
            Ok((
                chain_id,
                Secp256k1 {
                    custody_dwallet: DwalletId(dwallet.trim().to_string()),
                    custody_key,
                },
            ))
        })
        .collect()
}

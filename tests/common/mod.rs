//! Shared doubles for the pipeline tests
//!
//! Everything here is in-memory and deterministic: guardians and dWallets
//! sign with fixed keys, the destination chain creates the record account on
//! the first submit and refuses the second.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ed25519_dalek::Signer as _;
use k256::ecdsa::SigningKey as GuardianKey;
use solana_sdk::instruction::Instruction;
use solana_sdk::pubkey::Pubkey;

use tensei_relayer::attestation::{Attestation, GuardianSignature, VAA_VERSION};
use tensei_relayer::codec::{encode_deposit_payload, left_pad32, DepositPayload};
use tensei_relayer::feed::{next_sequence, FeedError, FeedItem, SourceFeed};
use tensei_relayer::ledger::{MemorySealLedger, SealLedger, SealRecord};
use tensei_relayer::minter::{ChainError, DestinationChain, DestinationMinter};
use tensei_relayer::orchestrator::{
    Orchestrator, OrchestratorConfig, RetryConfig, SourceWatcher,
};
use tensei_relayer::signing::{
    Curve, RemoteSigner, RemoteSignerError, SignRequest, SigningCoordinator, SigningTopology,
};
use tensei_relayer::types::SealHash;
use tensei_relayer::verifier::{
    guardian_address, AttestationVerifier, GuardianOracle, GuardianSet, MemoryConsumedSet,
    OracleError, TrustedEmitter,
};

pub const SOURCE_CHAIN: u16 = 2;
pub const EMITTER: [u8; 32] = [0x0e; 32];
pub const DEPOSITOR: [u8; 32] = [0x33; 32];
pub const GUARDIANS: usize = 19;

pub fn emitter() -> TrustedEmitter {
    TrustedEmitter {
        chain_id: SOURCE_CHAIN,
        address: EMITTER,
    }
}

pub fn program_id() -> Pubkey {
    Pubkey::new_from_array([0x77; 32])
}

pub fn guardian_keys(n: usize) -> Vec<GuardianKey> {
    (1..=n)
        .map(|i| {
            let mut secret = [0u8; 32];
            secret[0] = 0x42;
            secret[31] = i as u8;
            GuardianKey::from_slice(&secret).unwrap()
        })
        .collect()
}

pub fn guardian_set(keys: &[GuardianKey]) -> GuardianSet {
    GuardianSet::new(
        0,
        keys.iter().map(|k| guardian_address(k.verifying_key())).collect(),
    )
}

/// Key of the custody dWallet on dual-signed chains.
pub fn custody_key() -> GuardianKey {
    GuardianKey::from_slice(&[0x5c; 32]).unwrap()
}

pub fn secp_sign(key: &GuardianKey, message: &[u8; 32]) -> Vec<u8> {
    let (sig, recid) = key.sign_prehash_recoverable(message).unwrap();
    let mut out = sig.to_bytes().to_vec();
    out.push(recid.to_byte());
    out
}

/// The dWallet whose Ed25519 key signs seals in these tests.
pub fn dwallet_key() -> ed25519_dalek::SigningKey {
    ed25519_dalek::SigningKey::from_bytes(&[7; 32])
}

pub fn deposit(nonce: u64) -> DepositPayload {
    DepositPayload {
        source_chain_id: SOURCE_CHAIN,
        source_contract: left_pad32(&[0xab, 0xcd]).unwrap(),
        token_id: left_pad32(&nonce.to_be_bytes()).unwrap(),
        depositor: DEPOSITOR,
        dwallet: dwallet_key().verifying_key().to_bytes(),
        deposit_block: 1_000 + nonce,
        seal_nonce: nonce,
    }
}

/// A VAA over `payload` signed by the first `signers` guardians.
pub fn signed_vaa(keys: &[GuardianKey], signers: usize, sequence: u64, payload: Vec<u8>) -> Vec<u8> {
    signed_vaa_in_set(keys, 0, signers, sequence, payload)
}

/// Like [`signed_vaa`], under guardian set `set_index`.
pub fn signed_vaa_in_set(
    keys: &[GuardianKey],
    set_index: u32,
    signers: usize,
    sequence: u64,
    payload: Vec<u8>,
) -> Vec<u8> {
    let mut attestation = Attestation {
        version: VAA_VERSION,
        guardian_set_index: set_index,
        signatures: vec![],
        timestamp: 1_700_000_000,
        nonce: 0,
        emitter_chain_id: SOURCE_CHAIN,
        emitter_address: EMITTER,
        sequence,
        consistency_level: 1,
        payload,
    };
    let digest = attestation.digest();
    for (i, key) in keys.iter().enumerate().take(signers) {
        let (sig, recid) = key.sign_prehash_recoverable(&digest).unwrap();
        let mut bytes = [0u8; 65];
        bytes[..64].copy_from_slice(&sig.to_bytes());
        bytes[64] = recid.to_byte();
        attestation.signatures.push(GuardianSignature {
            guardian_index: i as u8,
            signature: bytes,
        });
    }
    attestation.serialize()
}

/// Feed serving a fixed list of attestations per sequence.
#[derive(Default)]
pub struct ScriptedFeed {
    items: Mutex<HashMap<u64, Vec<u8>>>,
    pub calls: AtomicU32,
}

impl ScriptedFeed {
    pub fn publish(&self, sequence: u64, raw: Vec<u8>) {
        self.items.lock().unwrap().insert(sequence, raw);
    }
}

#[async_trait]
impl SourceFeed for ScriptedFeed {
    async fn next(
        &self,
        emitter: &TrustedEmitter,
        after: Option<u64>,
    ) -> Result<FeedItem, FeedError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if emitter.chain_id != SOURCE_CHAIN {
            return Ok(FeedItem::EndOfStream);
        }
        Ok(self
            .items
            .lock()
            .unwrap()
            .get(&next_sequence(after))
            .cloned()
            .map_or(FeedItem::EndOfStream, FeedItem::Attestation))
    }
}

/// Oracle serving the test guardians under whatever index is current.
/// Clones share the index, so a test can rotate an oracle it handed away.
#[derive(Clone)]
pub struct RotatingOracle {
    keys: Vec<GuardianKey>,
    index: Arc<AtomicU32>,
    calls: Arc<AtomicU32>,
}

impl RotatingOracle {
    pub fn new(keys: Vec<GuardianKey>) -> Self {
        Self {
            keys,
            index: Arc::new(AtomicU32::new(0)),
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn rotate_to(&self, index: u32) {
        self.index.store(index, Ordering::SeqCst);
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GuardianOracle for RotatingOracle {
    async fn current_guardian_set(&self, _chain_id: u16) -> Result<GuardianSet, OracleError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(GuardianSet {
            index: self.index.load(Ordering::SeqCst),
            ..guardian_set(&self.keys)
        })
    }
}

/// Oracle returning one set, optionally failing the first few calls.
pub struct StaticOracle {
    set: GuardianSet,
    failures_left: AtomicU32,
}

impl StaticOracle {
    pub fn new(set: GuardianSet) -> Self {
        Self {
            set,
            failures_left: AtomicU32::new(0),
        }
    }

    pub fn fail_next(&self, n: u32) {
        self.failures_left.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl GuardianOracle for StaticOracle {
    async fn current_guardian_set(&self, _chain_id: u16) -> Result<GuardianSet, OracleError> {
        if take_failure(&self.failures_left) {
            return Err(OracleError::Request("guardian API unavailable".into()));
        }
        Ok(self.set.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignerMode {
    Honest,
    /// Fail every request with a transport error
    Down,
    Revoked,
    /// Sign with a key that is not the deposit's dWallet
    Impostor,
    /// Honest Ed25519, custody signature from the wrong key
    CustodyImpostor,
}

/// Remote signer holding the test dWallet key.
pub struct KeyringSigner {
    mode: Mutex<SignerMode>,
    failures_left: AtomicU32,
    pub calls: AtomicU32,
}

impl Default for KeyringSigner {
    fn default() -> Self {
        Self {
            mode: Mutex::new(SignerMode::Honest),
            failures_left: AtomicU32::new(0),
            calls: AtomicU32::new(0),
        }
    }
}

impl KeyringSigner {
    pub fn set_mode(&self, mode: SignerMode) {
        *self.mode.lock().unwrap() = mode;
    }

    pub fn fail_next(&self, n: u32) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteSigner for KeyringSigner {
    async fn sign(&self, request: &SignRequest) -> Result<Vec<u8>, RemoteSignerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if take_failure(&self.failures_left) {
            return Err(RemoteSignerError::Transport("connection reset".into()));
        }
        let mode = self.mode.lock().unwrap().clone();
        match (mode, request.curve) {
            (SignerMode::Down, _) => Err(RemoteSignerError::Transport("connection refused".into())),
            (SignerMode::Revoked, _) => {
                Err(RemoteSignerError::Revoked("capability_revoked".into()))
            }
            (SignerMode::CustodyImpostor, Curve::Secp256k1) => {
                let impostor = GuardianKey::from_slice(&[0x5d; 32]).unwrap();
                Ok(secp_sign(&impostor, &request.message))
            }
            (_, Curve::Secp256k1) => Ok(secp_sign(&custody_key(), &request.message)),
            (SignerMode::Honest | SignerMode::CustodyImpostor, Curve::Ed25519) => {
                Ok(dwallet_key().sign(&request.message).to_bytes().to_vec())
            }
            (SignerMode::Impostor, Curve::Ed25519) => {
                let impostor = ed25519_dalek::SigningKey::from_bytes(&[8; 32]);
                Ok(impostor.sign(&request.message).to_bytes().to_vec())
            }
        }
    }
}

/// Destination chain where submit creates the seal's record account.
#[derive(Default)]
pub struct FakeChain {
    accounts: Mutex<HashSet<Pubkey>>,
    failures_left: AtomicU32,
    pub submits: AtomicU32,
}

impl FakeChain {
    pub fn fail_next(&self, n: u32) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    pub fn submits(&self) -> u32 {
        self.submits.load(Ordering::SeqCst)
    }

    pub fn minted(&self) -> usize {
        self.accounts.lock().unwrap().len()
    }

    /// Pretend another relayer already minted at `record`.
    pub fn preinsert(&self, record: Pubkey) {
        self.accounts.lock().unwrap().insert(record);
    }
}

#[async_trait]
impl DestinationChain for FakeChain {
    fn payer(&self) -> Pubkey {
        Pubkey::new_from_array([9; 32])
    }

    async fn account_exists(&self, address: &Pubkey) -> Result<bool, ChainError> {
        Ok(self.accounts.lock().unwrap().contains(address))
    }

    async fn submit(&self, instructions: Vec<Instruction>) -> Result<String, ChainError> {
        self.submits.fetch_add(1, Ordering::SeqCst);
        if take_failure(&self.failures_left) {
            return Err(ChainError::Network("blockhash not found".into()));
        }
        // mint_reborn follows the Ed25519 pre-verification instruction
        let record = instructions[1].accounts[1].pubkey;
        if !self.accounts.lock().unwrap().insert(record) {
            return Err(ChainError::AccountInUse(record.to_string()));
        }
        Ok(format!("sig-{}", record))
    }
}

fn take_failure(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

pub fn fast_config() -> OrchestratorConfig {
    OrchestratorConfig {
        workers: 4,
        poll_interval: Duration::from_millis(5),
        batch_size: 64,
        stage_timeout: Duration::from_secs(5),
        retry: RetryConfig {
            max_attempts: 3,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            backoff_multiplier: 2.0,
            jitter: 0.0,
        },
    }
}

/// One relayer process wired to shared doubles.
pub struct Harness {
    pub guardians: Vec<GuardianKey>,
    pub ledger: Arc<MemorySealLedger>,
    pub consumed: Arc<MemoryConsumedSet>,
    pub feed: Arc<ScriptedFeed>,
    pub oracle: Arc<StaticOracle>,
    pub signer: Arc<KeyringSigner>,
    pub chain: Arc<FakeChain>,
    pub topologies: HashMap<u16, SigningTopology>,
    pub orchestrator: Arc<Orchestrator>,
    pub watcher: SourceWatcher,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_topologies(HashMap::new())
    }

    pub fn with_topologies(topologies: HashMap<u16, SigningTopology>) -> Self {
        let guardians = guardian_keys(GUARDIANS);
        let ledger = Arc::new(MemorySealLedger::new());
        let consumed = Arc::new(MemoryConsumedSet::new());
        let feed = Arc::new(ScriptedFeed::default());
        let oracle = Arc::new(StaticOracle::new(guardian_set(&guardians)));
        let signer = Arc::new(KeyringSigner::default());
        let chain = Arc::new(FakeChain::default());
        let orchestrator = build_orchestrator(
            ledger.clone(),
            consumed.clone(),
            oracle.clone(),
            signer.clone(),
            chain.clone(),
            topologies.clone(),
        );
        let watcher = SourceWatcher::new(
            feed.clone(),
            ledger.clone(),
            vec![emitter()],
            Duration::from_millis(5),
        );
        Self {
            guardians,
            ledger,
            consumed,
            feed,
            oracle,
            signer,
            chain,
            topologies,
            orchestrator,
            watcher,
        }
    }

    /// A second relayer process sharing this one's ledger, consumed set and chain.
    pub fn restarted(&self) -> Arc<Orchestrator> {
        build_orchestrator(
            self.ledger.clone(),
            self.consumed.clone(),
            self.oracle.clone(),
            self.signer.clone(),
            self.chain.clone(),
            self.topologies.clone(),
        )
    }

    pub fn verifier(&self) -> AttestationVerifier {
        AttestationVerifier::new([emitter()], self.consumed.clone())
    }

    pub fn minter(&self) -> DestinationMinter {
        DestinationMinter::new(self.chain.clone(), program_id())
    }

    /// Publish a deposit with a guardian quorum at `sequence`.
    pub fn publish_deposit(&self, sequence: u64, nonce: u64) -> SealHash {
        let payload = deposit(nonce);
        let raw = signed_vaa(&self.guardians, 13, sequence, encode_deposit_payload(&payload));
        self.feed.publish(sequence, raw);
        payload.seal_hash()
    }

    pub async fn ingest(&self) -> usize {
        self.watcher.poll_once().await.unwrap()
    }

    pub async fn record(&self, seal_hash: &SealHash) -> SealRecord {
        self.ledger.get(seal_hash).await.unwrap().unwrap()
    }
}

pub fn build_orchestrator(
    ledger: Arc<MemorySealLedger>,
    consumed: Arc<MemoryConsumedSet>,
    oracle: Arc<dyn GuardianOracle>,
    signer: Arc<KeyringSigner>,
    chain: Arc<FakeChain>,
    topologies: HashMap<u16, SigningTopology>,
) -> Arc<Orchestrator> {
    let verifier = Arc::new(AttestationVerifier::new([emitter()], consumed));
    let coordinator = Arc::new(SigningCoordinator::new(signer, topologies));
    let minter = Arc::new(DestinationMinter::new(chain, program_id()));
    Arc::new(Orchestrator::new(
        ledger,
        verifier,
        oracle,
        coordinator,
        minter,
        fast_config(),
    ))
}

/// Run scheduler passes until nothing is ready.
pub async fn settle(orchestrator: &Orchestrator) {
    for _ in 0..50 {
        if orchestrator.process_ready().await.unwrap() == 0 {
            return;
        }
    }
    panic!("pipeline did not settle");
}

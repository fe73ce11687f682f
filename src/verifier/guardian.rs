//! Guardian sets and where they come from
//!
//! The current set is fetched from a guardian API and cached per chain with a
//! TTL. An attestation signed under a newer index than the cached one forces
//! a refetch. A set replaced by a rotation stays valid for an expiry window,
//! so attestations signed just before the rotation still verify.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use k256::ecdsa::VerifyingKey;
use k256::elliptic_curve::sec1::ToEncodedPoint;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::codec::keccak256;
use crate::metrics;

/// How long a replaced guardian set keeps verifying attestations.
pub const DEFAULT_SET_EXPIRY: Duration = Duration::from_secs(24 * 60 * 60);

/// Ethereum-style address of a guardian key.
pub type GuardianAddress = [u8; 20];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardianSet {
    pub index: u32,
    pub keys: Vec<GuardianAddress>,
    /// Minimum number of distinct valid signatures.
    pub quorum: usize,
}

impl GuardianSet {
    /// Set with the standard supermajority quorum `floor(2n/3) + 1`.
    pub fn new(index: u32, keys: Vec<GuardianAddress>) -> Self {
        let quorum = supermajority(keys.len());
        Self {
            index,
            keys,
            quorum,
        }
    }

    /// Raise the quorum. The supermajority is a floor: lower values are
    /// ignored, values above the set size are clamped.
    pub fn with_quorum(mut self, quorum: usize) -> Self {
        let floor = supermajority(self.keys.len());
        self.quorum = quorum.clamp(floor, self.keys.len().max(floor));
        self
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

pub fn supermajority(n: usize) -> usize {
    n * 2 / 3 + 1
}

/// keccak256 of the uncompressed public key without its tag byte, last 20 bytes.
pub fn guardian_address(key: &VerifyingKey) -> GuardianAddress {
    let point = key.to_encoded_point(false);
    let hash = keccak256(&point.as_bytes()[1..]);
    let mut out = [0u8; 20];
    out.copy_from_slice(&hash[12..]);
    out
}

#[derive(Debug, Error)]
pub enum OracleError {
    #[error("guardian API request failed: {0}")]
    Request(String),
    #[error("guardian API returned an invalid set: {0}")]
    InvalidResponse(String),
}

#[async_trait]
pub trait GuardianOracle: Send + Sync {
    /// Guardian set currently authoritative for attestations from `chain_id`.
    async fn current_guardian_set(&self, chain_id: u16) -> Result<GuardianSet, OracleError>;

    /// Set to check an attestation signed under `index` against: the set
    /// with that index while it is still valid, otherwise the current set.
    async fn guardian_set_for(&self, chain_id: u16, index: u32) -> Result<GuardianSet, OracleError> {
        let _ = index;
        self.current_guardian_set(chain_id).await
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GuardianSetResponse {
    guardian_set: GuardianSetBody,
}

#[derive(Debug, Deserialize)]
struct GuardianSetBody {
    index: u32,
    addresses: Vec<String>,
}

/// `GET {base}/v1/guardianset/current`
pub struct HttpGuardianOracle {
    client: reqwest::Client,
    base_url: String,
    quorum: Option<usize>,
}

impl HttpGuardianOracle {
    pub fn new(base_url: impl Into<String>, timeout: Duration, quorum: Option<usize>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            quorum,
        }
    }
}

#[async_trait]
impl GuardianOracle for HttpGuardianOracle {
    async fn current_guardian_set(&self, chain_id: u16) -> Result<GuardianSet, OracleError> {
        let url = format!("{}/v1/guardianset/current", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| OracleError::Request(e.to_string()))?;
        if !response.status().is_success() {
            return Err(OracleError::Request(format!(
                "{} returned {}",
                url,
                response.status()
            )));
        }
        let body: GuardianSetResponse = response
            .json()
            .await
            .map_err(|e| OracleError::InvalidResponse(e.to_string()))?;

        let keys = body
            .guardian_set
            .addresses
            .iter()
            .map(|a| parse_address(a))
            .collect::<Result<Vec<_>, _>>()?;
        if keys.is_empty() {
            return Err(OracleError::InvalidResponse("empty guardian set".to_string()));
        }

        let mut set = GuardianSet::new(body.guardian_set.index, keys);
        if let Some(q) = self.quorum {
            if q < set.quorum {
                warn!(
                    configured = q,
                    supermajority = set.quorum,
                    "Guardian quorum override below supermajority ignored"
                );
            }
            set = set.with_quorum(q);
        }
        debug!(
            chain_id,
            index = set.index,
            guardians = set.len(),
            quorum = set.quorum,
            "Fetched guardian set"
        );
        Ok(set)
    }
}

fn parse_address(s: &str) -> Result<GuardianAddress, OracleError> {
    let hex_str = s.strip_prefix("0x").unwrap_or(s);
    let mut out = [0u8; 20];
    hex::decode_to_slice(hex_str, &mut out)
        .map_err(|e| OracleError::InvalidResponse(format!("guardian address {}: {}", s, e)))?;
    Ok(out)
}

struct CacheEntry {
    set: GuardianSet,
    fetched: Instant,
    /// Sets replaced by a rotation, with the time they were replaced
    retired: Vec<(GuardianSet, Instant)>,
}

/// TTL cache in front of another oracle
///
/// On a fetch failure a stale entry is never served; the caller sees the
/// error and retries.
pub struct CachedGuardianOracle<O> {
    inner: O,
    ttl: Duration,
    expiry: Duration,
    entries: Mutex<HashMap<u16, CacheEntry>>,
}

impl<O: GuardianOracle> CachedGuardianOracle<O> {
    pub fn new(inner: O, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            expiry: DEFAULT_SET_EXPIRY,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// How long a replaced set stays valid after a rotation is observed.
    pub fn with_expiry(mut self, expiry: Duration) -> Self {
        self.expiry = expiry;
        self
    }

    fn cached(&self, chain_id: u16) -> Option<GuardianSet> {
        let entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries
            .get(&chain_id)
            .filter(|entry| entry.fetched.elapsed() < self.ttl)
            .map(|entry| entry.set.clone())
    }

    /// A known set with `index`: the fresh current one, or a retired one
    /// inside the expiry window.
    fn known(&self, chain_id: u16, index: u32) -> Option<GuardianSet> {
        let entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        let entry = entries.get(&chain_id)?;
        if entry.set.index == index && entry.fetched.elapsed() < self.ttl {
            return Some(entry.set.clone());
        }
        entry
            .retired
            .iter()
            .find(|(set, retired_at)| set.index == index && retired_at.elapsed() < self.expiry)
            .map(|(set, _)| set.clone())
    }

    async fn refresh(&self, chain_id: u16) -> Result<GuardianSet, OracleError> {
        metrics::GUARDIAN_CACHE.with_label_values(&["miss"]).inc();
        let fetched = match self.inner.current_guardian_set(chain_id).await {
            Ok(set) => set,
            Err(e) => {
                warn!(chain_id, error = %e, "Guardian set refresh failed");
                return Err(e);
            }
        };

        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        let now = Instant::now();
        let entry = entries.entry(chain_id).or_insert_with(|| CacheEntry {
            set: fetched.clone(),
            fetched: now,
            retired: Vec::new(),
        });
        if fetched.index > entry.set.index {
            info!(
                chain_id,
                from = entry.set.index,
                to = fetched.index,
                "Guardian set rotated"
            );
            let replaced = std::mem::replace(&mut entry.set, fetched);
            entry.retired.push((replaced, now));
        } else if fetched.index == entry.set.index {
            entry.set = fetched;
        } else {
            warn!(
                chain_id,
                known = entry.set.index,
                fetched = fetched.index,
                "Guardian API returned an older set; keeping the newer one"
            );
        }
        entry.fetched = now;
        let expiry = self.expiry;
        entry
            .retired
            .retain(|(_, retired_at)| retired_at.elapsed() < expiry);
        Ok(entry.set.clone())
    }

    /// Drop every cached set, forcing the next lookup to refetch.
    pub fn invalidate(&self) {
        self.entries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clear();
    }
}

#[async_trait]
impl<O: GuardianOracle> GuardianOracle for CachedGuardianOracle<O> {
    async fn current_guardian_set(&self, chain_id: u16) -> Result<GuardianSet, OracleError> {
        if let Some(set) = self.cached(chain_id) {
            metrics::GUARDIAN_CACHE.with_label_values(&["hit"]).inc();
            return Ok(set);
        }
        self.refresh(chain_id).await
    }

    async fn guardian_set_for(&self, chain_id: u16, index: u32) -> Result<GuardianSet, OracleError> {
        if let Some(set) = self.known(chain_id, index) {
            metrics::GUARDIAN_CACHE.with_label_values(&["hit"]).inc();
            return Ok(set);
        }
        // Older than the fresh current set and not retired recently: expired
        if let Some(current) = self.cached(chain_id) {
            if index < current.index {
                metrics::GUARDIAN_CACHE.with_label_values(&["hit"]).inc();
                return Ok(current);
            }
        }

        let current = self.refresh(chain_id).await?;
        if current.index != index {
            if let Some(set) = self.known(chain_id, index) {
                return Ok(set);
            }
            debug!(chain_id, index, current = current.index, "No valid guardian set for index");
        }
        Ok(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k256::ecdsa::SigningKey;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_supermajority() {
        assert_eq!(supermajority(19), 13);
        assert_eq!(supermajority(3), 3);
        assert_eq!(supermajority(1), 1);
        assert_eq!(GuardianSet::new(0, vec![[0; 20]; 19]).quorum, 13);
    }

    #[test]
    fn test_with_quorum_bounds() {
        let set = GuardianSet::new(0, vec![[0; 20]; 19]);
        assert_eq!(set.clone().with_quorum(15).quorum, 15);
        // Never below the supermajority
        assert_eq!(set.clone().with_quorum(3).quorum, 13);
        assert_eq!(set.clone().with_quorum(10).quorum, 13);
        assert_eq!(set.with_quorum(40).quorum, 19);
    }

    #[test]
    fn test_guardian_address_known_key() {
        // Private key 1 maps to the well-known address 0x7e5f...bdf
        let mut secret = [0u8; 32];
        secret[31] = 1;
        let key = SigningKey::from_slice(&secret).unwrap();
        assert_eq!(
            hex::encode(guardian_address(key.verifying_key())),
            "7e5f4552091a69125d5dfcb7b8c2659029395bdf"
        );
    }

    #[test]
    fn test_parse_address() {
        assert_eq!(
            parse_address("0x58CC3AE5C097b213cE3c81979e1B9f9570746AA5").unwrap()[0],
            0x58
        );
        assert!(parse_address("0x1234").is_err());
    }

    struct CountingOracle {
        calls: AtomicU32,
    }

    #[async_trait]
    impl GuardianOracle for CountingOracle {
        async fn current_guardian_set(&self, _chain_id: u16) -> Result<GuardianSet, OracleError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(GuardianSet::new(n, vec![[1; 20]]))
        }
    }

    #[tokio::test]
    async fn test_cache_serves_within_ttl() {
        let cache = CachedGuardianOracle::new(
            CountingOracle {
                calls: AtomicU32::new(0),
            },
            Duration::from_secs(60),
        );
        assert_eq!(cache.current_guardian_set(2).await.unwrap().index, 0);
        assert_eq!(cache.current_guardian_set(2).await.unwrap().index, 0);
        // Cached per chain
        assert_eq!(cache.current_guardian_set(5).await.unwrap().index, 1);

        cache.invalidate();
        assert_eq!(cache.current_guardian_set(2).await.unwrap().index, 2);
    }

    #[tokio::test]
    async fn test_cache_expires() {
        let cache = CachedGuardianOracle::new(
            CountingOracle {
                calls: AtomicU32::new(0),
            },
            Duration::ZERO,
        );
        assert_eq!(cache.current_guardian_set(2).await.unwrap().index, 0);
        assert_eq!(cache.current_guardian_set(2).await.unwrap().index, 1);
    }

    /// Serves whatever index the shared counter holds.
    struct RotatingOracle {
        index: Arc<AtomicU32>,
        calls: AtomicU32,
    }

    impl RotatingOracle {
        fn new(index: Arc<AtomicU32>) -> Self {
            Self {
                index,
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl GuardianOracle for RotatingOracle {
        async fn current_guardian_set(&self, _chain_id: u16) -> Result<GuardianSet, OracleError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let index = self.index.load(Ordering::SeqCst);
            Ok(GuardianSet::new(index, vec![[index as u8; 20]]))
        }
    }

    #[tokio::test]
    async fn test_newer_index_forces_refetch() {
        let index = Arc::new(AtomicU32::new(0));
        let cache = CachedGuardianOracle::new(RotatingOracle::new(index.clone()), Duration::from_secs(300));
        assert_eq!(cache.current_guardian_set(2).await.unwrap().index, 0);

        index.store(1, Ordering::SeqCst);
        // Still cached for plain lookups
        assert_eq!(cache.current_guardian_set(2).await.unwrap().index, 0);
        assert_eq!(cache.guardian_set_for(2, 1).await.unwrap().index, 1);
        assert_eq!(cache.current_guardian_set(2).await.unwrap().index, 1);
        assert_eq!(cache.inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unpublished_index_returns_current() {
        let index = Arc::new(AtomicU32::new(0));
        let cache = CachedGuardianOracle::new(RotatingOracle::new(index), Duration::from_secs(300));
        assert_eq!(cache.guardian_set_for(2, 4).await.unwrap().index, 0);
        assert_eq!(cache.guardian_set_for(2, 4).await.unwrap().index, 0);
        // Each unknown newer index refetches once
        assert_eq!(cache.inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_retired_set_valid_until_expiry() {
        let index = Arc::new(AtomicU32::new(0));
        let cache = CachedGuardianOracle::new(RotatingOracle::new(index.clone()), Duration::from_secs(300));
        cache.current_guardian_set(2).await.unwrap();
        index.store(1, Ordering::SeqCst);
        cache.guardian_set_for(2, 1).await.unwrap();

        let old = cache.guardian_set_for(2, 0).await.unwrap();
        assert_eq!(old.index, 0);
        assert_eq!(old.keys, vec![[0; 20]]);

        let expired = CachedGuardianOracle::new(RotatingOracle::new(index.clone()), Duration::from_secs(300))
            .with_expiry(Duration::ZERO);
        index.store(0, Ordering::SeqCst);
        expired.current_guardian_set(2).await.unwrap();
        index.store(1, Ordering::SeqCst);
        expired.guardian_set_for(2, 1).await.unwrap();
        assert_eq!(expired.guardian_set_for(2, 0).await.unwrap().index, 1);
    }
}

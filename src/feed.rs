//! Source event feed
//!
//! Delivers signed attestations for one emitter in sequence order. The
//! production feed reads them from a guardian VAA API.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::verifier::TrustedEmitter;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedItem {
    /// Raw signed attestation bytes.
    Attestation(Vec<u8>),
    /// Nothing at this sequence yet.
    EndOfStream,
}

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("feed request failed: {0}")]
    Request(String),
    #[error("feed returned an invalid response: {0}")]
    InvalidResponse(String),
}

#[async_trait]
pub trait SourceFeed: Send + Sync {
    /// The attestation following `after` for `emitter` (sequence 0 when `after` is None).
    async fn next(&self, emitter: &TrustedEmitter, after: Option<u64>)
        -> Result<FeedItem, FeedError>;
}

pub fn next_sequence(after: Option<u64>) -> u64 {
    after.map_or(0, |s| s.saturating_add(1))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignedVaaResponse {
    vaa_bytes: String,
}

/// `GET {base}/v1/signed_vaa/{chain}/{emitter}/{sequence}`
pub struct WormholeVaaFeed {
    client: reqwest::Client,
    base_url: String,
}

impl WormholeVaaFeed {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl SourceFeed for WormholeVaaFeed {
    async fn next(
        &self,
        emitter: &TrustedEmitter,
        after: Option<u64>,
    ) -> Result<FeedItem, FeedError> {
        let sequence = next_sequence(after);
        let url = format!(
            "{}/v1/signed_vaa/{}/{}/{}",
            self.base_url,
            emitter.chain_id,
            hex::encode(emitter.address),
            sequence
        );

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| FeedError::Request(e.to_string()))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            debug!(chain_id = emitter.chain_id, sequence, "No attestation yet");
            return Ok(FeedItem::EndOfStream);
        }
        if !response.status().is_success() {
            return Err(FeedError::Request(format!(
                "{} returned {}",
                url,
                response.status()
            )));
        }

        let body: SignedVaaResponse = response
            .json()
            .await
            .map_err(|e| FeedError::InvalidResponse(e.to_string()))?;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(body.vaa_bytes.as_bytes())
            .map_err(|e| FeedError::InvalidResponse(format!("vaaBytes: {}", e)))?;
        Ok(FeedItem::Attestation(bytes))
    }
}

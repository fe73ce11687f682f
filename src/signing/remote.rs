//! Client for the remote dWallet signing network

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Identifier of a dWallet in the remote signing network.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DwalletId(pub String);

impl DwalletId {
    /// The dWallet whose Ed25519 key is `pubkey`.
    pub fn from_pubkey(pubkey: &[u8; 32]) -> Self {
        Self(format!("0x{}", hex::encode(pubkey)))
    }
}

impl fmt::Display for DwalletId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Curve {
    Ed25519,
    Secp256k1,
}

impl Curve {
    pub fn signature_len(&self) -> usize {
        match self {
            Curve::Ed25519 => 64,
            // r || s || recovery id
            Curve::Secp256k1 => 65,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SignRequest {
    pub dwallet_id: DwalletId,
    pub curve: Curve,
    #[serde(with = "hex_message")]
    pub message: [u8; 32],
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteSignerError {
    /// The signing capability for this dWallet is gone for good.
    #[error("signing capability revoked: {0}")]
    Revoked(String),
    #[error("signer rejected request ({code}): {message}")]
    Rejected { code: String, message: String },
    #[error("signer transport error: {0}")]
    Transport(String),
}

#[async_trait]
pub trait RemoteSigner: Send + Sync {
    async fn sign(&self, request: &SignRequest) -> Result<Vec<u8>, RemoteSignerError>;
}

#[derive(Debug, Deserialize)]
struct SignResponse {
    signature: String,
}

#[derive(Debug, Deserialize)]
struct SignErrorBody {
    code: String,
    #[serde(default)]
    message: String,
}

/// Error codes meaning the capability will never sign again.
const REVOKED_CODES: [&str; 2] = ["capability_revoked", "capability_consumed"];

/// `POST {base}/v1/sign`
pub struct HttpRemoteSigner {
    client: reqwest::Client,
    base_url: String,
}

impl HttpRemoteSigner {
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
impl RemoteSigner for HttpRemoteSigner {
    async fn sign(&self, request: &SignRequest) -> Result<Vec<u8>, RemoteSignerError> {
        let url = format!("{}/v1/sign", self.base_url);
        debug!(dwallet = %request.dwallet_id, curve = ?request.curve, "Requesting signature");

        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| RemoteSignerError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_error_body(status.as_u16(), &body));
        }

        let body: SignResponse = response
            .json()
            .await
            .map_err(|e| RemoteSignerError::Transport(format!("invalid sign response: {}", e)))?;
        let hex_sig = body.signature.strip_prefix("0x").unwrap_or(&body.signature);
        hex::decode(hex_sig)
            .map_err(|e| RemoteSignerError::Transport(format!("invalid signature hex: {}", e)))
    }
}

fn classify_error_body(status: u16, body: &str) -> RemoteSignerError {
    match serde_json::from_str::<SignErrorBody>(body) {
        Ok(err) if REVOKED_CODES.contains(&err.code.as_str()) => {
            RemoteSignerError::Revoked(format!("{}: {}", err.code, err.message))
        }
        Ok(err) if status < 500 => RemoteSignerError::Rejected {
            code: err.code,
            message: err.message,
        },
        _ => RemoteSignerError::Transport(format!("HTTP {}: {}", status, body)),
    }
}

mod hex_message {
    use serde::Serializer;

    pub fn serialize<S: Serializer>(bytes: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{}", hex::encode(bytes)))
    }
}

//! Status API handlers over an in-memory relayer

mod common;

use axum::body::to_bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Response;
use serde_json::Value;

use common::*;
use tensei_relayer::api::{self, AppState};

async fn json(response: Response) -> (StatusCode, Value) {
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test]
async fn test_status_counts_every_state() {
    let h = Harness::new();
    h.publish_deposit(0, 1);
    h.publish_deposit(1, 2);
    h.ingest().await;
    let state = AppState::new(h.orchestrator.clone());

    let (code, body) = json(api::status(State(state.clone())).await).await;
    assert_eq!(code, StatusCode::OK);
    assert_eq!(body["seals"]["pending"], 2);
    assert_eq!(body["seals"]["completed"], 0);

    settle(&h.orchestrator).await;
    let (_, body) = json(api::status(State(state)).await).await;
    assert_eq!(body["seals"]["pending"], 0);
    assert_eq!(body["seals"]["completed"], 2);
}

#[tokio::test]
async fn test_seal_lookup() {
    let h = Harness::new();
    let seal_hash = h.publish_deposit(0, 1);
    h.ingest().await;
    let state = AppState::new(h.orchestrator.clone());

    let (code, body) = json(api::seal(State(state.clone()), Path(seal_hash.to_hex())).await).await;
    assert_eq!(code, StatusCode::OK);
    assert_eq!(body["status"], "pending");
    assert_eq!(body["seal_hash"], seal_hash.to_string());
    assert!(body.get("attestation").is_none());
    assert_eq!(body["recipient"], bs58::encode(DEPOSITOR).into_string());

    let (code, _) = json(api::seal(State(state.clone()), Path("0x1234".into())).await).await;
    assert_eq!(code, StatusCode::BAD_REQUEST);

    let missing = "ee".repeat(32);
    let (code, _) = json(api::seal(State(state), Path(missing)).await).await;
    assert_eq!(code, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_cancel_endpoint() {
    let h = Harness::new();
    let seal_hash = h.publish_deposit(0, 1);
    h.ingest().await;
    let state = AppState::new(h.orchestrator.clone());

    let (code, body) =
        json(api::cancel(State(state.clone()), Path(seal_hash.to_hex())).await).await;
    assert_eq!(code, StatusCode::OK);
    assert_eq!(body["status"], "failed");
    assert_eq!(body["error_kind"], "cancelled");

    let (code, body) = json(api::cancel(State(state), Path(seal_hash.to_hex())).await).await;
    assert_eq!(code, StatusCode::CONFLICT);
    assert!(body["error"].as_str().unwrap().contains("withdrawn"));
}

#[tokio::test]
async fn test_health() {
    let h = Harness::new();
    let state = AppState::new(h.orchestrator.clone());
    let health = api::health(State(state)).await;
    assert_eq!(health.0.status, "healthy");
}

//! Ika Tensei seal relayer - Library interface
//!
//! Re-exports internal modules for use in integration tests.

pub mod api;
pub mod attestation;
pub mod codec;
pub mod config;
pub mod feed;
pub mod ledger;
pub mod metrics;
pub mod minter;
pub mod orchestrator;
pub mod signing;
pub mod types;
pub mod verifier;

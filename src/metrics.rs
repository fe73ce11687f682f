//! Prometheus metrics for the seal relayer
//!
//! Exposes metrics on /metrics endpoint for Prometheus scraping.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, register_histogram_vec,
    register_int_counter, CounterVec, Encoder, Gauge, GaugeVec, HistogramVec, IntCounter,
    TextEncoder,
};

lazy_static! {
    pub static ref UP: Gauge = register_gauge!(
        "tensei_up",
        "Whether the relayer is running (1 = up)"
    ).unwrap();

    // Ingestion
    pub static ref SEALS_INGESTED: CounterVec = register_counter_vec!(
        "tensei_seals_ingested_total",
        "Seals created in the ledger from source attestations",
        &["chain"]
    ).unwrap();

    pub static ref INGEST_ERRORS: CounterVec = register_counter_vec!(
        "tensei_ingest_errors_total",
        "Source attestations that could not be ingested",
        &["chain", "type"]
    ).unwrap();

    pub static ref SOURCE_CURSOR: GaugeVec = register_gauge_vec!(
        "tensei_source_cursor",
        "Last source sequence ingested",
        &["chain"]
    ).unwrap();

    // Pipeline
    pub static ref STAGE_TRANSITIONS: CounterVec = register_counter_vec!(
        "tensei_stage_transitions_total",
        "Seal status transitions applied",
        &["from", "to"]
    ).unwrap();

    pub static ref STAGE_RETRIES: CounterVec = register_counter_vec!(
        "tensei_stage_retries_total",
        "Retryable stage failures",
        &["stage"]
    ).unwrap();

    pub static ref SEALS_FAILED: CounterVec = register_counter_vec!(
        "tensei_seals_failed_total",
        "Seals moved to FAILED",
        &["error_kind"]
    ).unwrap();

    pub static ref STAGE_LATENCY: HistogramVec = register_histogram_vec!(
        "tensei_stage_latency_seconds",
        "Time spent in one stage call",
        &["stage"],
        vec![0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0]
    ).unwrap();

    pub static ref SEALS_BY_STATUS: GaugeVec = register_gauge_vec!(
        "tensei_seals",
        "Seals in the ledger by status",
        &["status"]
    ).unwrap();

    // Verification
    pub static ref GUARDIAN_CACHE: CounterVec = register_counter_vec!(
        "tensei_guardian_cache_total",
        "Guardian set lookups by cache result",
        &["result"]
    ).unwrap();

    pub static ref AUDIT_FLAGS: IntCounter = register_int_counter!(
        "tensei_audit_flags_total",
        "Seals flagged for manual audit"
    ).unwrap();
}

/// Render every registered metric in the Prometheus text format.
pub fn gather_text() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&prometheus::gather(), &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

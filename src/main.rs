//! Ika Tensei seal relayer
//!
//! Watches source chains for sealed NFT deposits and reincarnates each one on
//! Solana exactly once:
//!
//! 1. The source watcher pulls guardian-signed attestations per trusted
//!    emitter and records each deposit as a PENDING seal
//! 2. Workers verify the attestation against the current guardian set
//! 3. The deposit's dWallet signs the seal hash (plus a custody signature on
//!    dual-signed chains)
//! 4. The reborn program mints the asset under a PDA derived from the seal
//!    hash, which rejects any second mint

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use eyre::{eyre, WrapErr};
use solana_sdk::signature::{read_keypair_file, Signer};
use tokio::sync::watch;
use tracing::info;

use tensei_relayer::api::{self, AppState};
use tensei_relayer::config::{Config, LogFormat};
use tensei_relayer::feed::WormholeVaaFeed;
use tensei_relayer::ledger::postgres::{create_pool, run_migrations};
use tensei_relayer::ledger::PgSealLedger;
use tensei_relayer::minter::{DestinationMinter, SolanaChain};
use tensei_relayer::orchestrator::{Orchestrator, SourceWatcher};
use tensei_relayer::signing::{HttpRemoteSigner, SigningCoordinator};
use tensei_relayer::verifier::{
    AttestationVerifier, CachedGuardianOracle, HttpGuardianOracle, PgConsumedSet,
};

fn main() -> eyre::Result<()> {
    color_eyre::install()?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

async fn async_main() -> eyre::Result<()> {
    let config = Config::load()?;
    init_logging(config.log_format);

    info!("Starting Ika Tensei seal relayer");
    info!(
        emitters = config.source.trusted_emitters.len(),
        dual_sign_chains = config.signer.dual_sign_chains.len(),
        program_id = %config.solana.program_id,
        workers = config.relayer.workers,
        "Configuration loaded"
    );

    let db = create_pool(&config.database.url).await?;
    info!("Database connected");
    run_migrations(&db).await?;
    info!("Database migrations complete");

    let ledger = Arc::new(PgSealLedger::new(db.clone()));
    let consumed = Arc::new(PgConsumedSet::new(db.clone()));

    let stage_timeout = Duration::from_millis(config.relayer.stage_timeout_ms);
    let oracle = Arc::new(CachedGuardianOracle::new(
        HttpGuardianOracle::new(&config.guardian.api_url, stage_timeout, config.guardian.quorum),
        Duration::from_secs(config.guardian.set_ttl_secs),
    )
    .with_expiry(Duration::from_secs(config.guardian.set_expiry_secs)));
    let verifier = Arc::new(AttestationVerifier::new(
        config.source.trusted_emitters.clone(),
        consumed,
    ));

    let signer = Arc::new(SigningCoordinator::new(
        Arc::new(HttpRemoteSigner::new(
            &config.signer.url,
            Duration::from_millis(config.signer.timeout_ms),
        )),
        config.signing_topologies(),
    ));

    let payer = read_keypair_file(&config.solana.keypair_path)
        .map_err(|e| eyre!("{}", e))
        .wrap_err("Failed to read SOLANA_KEYPAIR")?;
    info!(payer = %payer.pubkey(), "Solana payer loaded");
    let minter = Arc::new(DestinationMinter::new(
        Arc::new(SolanaChain::new(&config.solana.rpc_url, payer)),
        config.solana.program_id,
    ));

    let orchestrator = Arc::new(Orchestrator::new(
        ledger.clone(),
        verifier,
        oracle,
        signer,
        minter,
        config.orchestrator_config(),
    ));
    let watcher = Arc::new(SourceWatcher::new(
        Arc::new(WormholeVaaFeed::new(&config.source.vaa_api_url, stage_timeout)),
        ledger,
        config.source.trusted_emitters.clone(),
        Duration::from_millis(config.relayer.poll_interval_ms),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let api_addr = SocketAddr::from(([0, 0, 0, 0], config.api_port));
    let api_state = AppState::new(orchestrator.clone());
    tokio::spawn(async move {
        if let Err(e) = api::start_api_server(api_addr, api_state).await {
            tracing::error!(error = %e, "API server error");
        }
    });

    info!("Relayer initialized, starting processing");

    let (watcher_result, orchestrator_result) = tokio::join!(
        watcher.run(shutdown_rx.clone()),
        orchestrator.run(shutdown_rx),
    );
    if let Err(e) = watcher_result {
        tracing::error!(error = %e, "Source watcher error");
    }
    if let Err(e) = orchestrator_result {
        tracing::error!(error = %e, "Orchestrator error");
    }

    info!("Ika Tensei seal relayer stopped");
    Ok(())
}

/// Initialize tracing/logging with structured output
fn init_logging(format: LogFormat) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tensei_relayer=debug"));

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
        LogFormat::Pretty => registry
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init(),
    }
}

/// Wait for shutdown signals (SIGINT/SIGTERM)
async fn wait_for_shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }
}

//! ZeroMiles escrow - collateralized cross-chain loans
//!
//! Holds ETH collateral for loan requests and releases it to the solver whose
//! USDC payout on Osmosis is verified through the chain's LCD endpoints.

use anyhow::Result;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

mod api;
mod chain;
mod config;
mod coordination;
mod error;
mod events;
mod ledger;
mod metrics;
mod state;

use api::{AppState, RequestApi};
use chain::{ForeignChainVerifier, LcdProvider, LcdTransferVerifier};
use config::Settings;
use coordination::{EscrowEngine, SystemClock};
use ledger::InMemoryLedger;
use metrics::MetricsServer;
use state::{MemoryRequestStore, PgRequestStore, RequestStore};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting ZeroMiles escrow v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    info!(
        "Loaded configuration: {} collateral, {} payouts on {}",
        settings.escrow.collateral_denom,
        settings.escrow.requested_denom,
        settings.foreign_chain.chain_id
    );

    if let Some(warning) = settings.custody_warning() {
        warn!("{}", warning);
    }

    // Initialize request store
    let store: Arc<dyn RequestStore> = match &settings.database {
        Some(database) => {
            let store = PgRequestStore::new(database).await?;
            info!("Database connection established");
            store.run_migrations().await?;
            Arc::new(store)
        }
        None => Arc::new(MemoryRequestStore::new()),
    };

    let ledger = Arc::new(InMemoryLedger::new([settings.escrow.collateral_denom.clone()]));

    // Initialize foreign chain verification
    let provider = Arc::new(LcdProvider::new(settings.foreign_chain.clone())?);
    let verifier: Arc<dyn ForeignChainVerifier> = Arc::new(LcdTransferVerifier::new(provider));
    info!(
        "Verifying payouts on {} via {} LCD endpoints",
        settings.foreign_chain.chain_id,
        settings.foreign_chain.lcd_urls.len()
    );

    let clock = Arc::new(SystemClock::new());

    // Initialize escrow engine
    let engine = EscrowEngine::new(
        store.clone(),
        ledger,
        verifier.clone(),
        clock.clone(),
        settings.escrow.clone(),
    )?;
    info!("Escrow engine initialized");

    let requests = Arc::new(RequestApi::new(
        store.clone(),
        clock,
        settings.escrow.stale_claim_secs,
    ));

    // Start API server
    let api_handle = tokio::spawn({
        let config = settings.api.clone();
        let state = AppState {
            engine: engine.clone(),
            requests,
            verifier: verifier.clone(),
        };
        async move {
            if let Err(e) = api::run_server(config, state).await {
                error!("API server error: {}", e);
            }
        }
    });

    // Start metrics server
    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    // Start escrow engine (resumes CLAIMED requests, then sweeps)
    let engine_handle = tokio::spawn({
        let engine = engine.clone();
        async move {
            if let Err(e) = engine.run().await {
                error!("Escrow engine error: {}", e);
            }
        }
    });

    // Health check loop
    let health_handle = tokio::spawn({
        let store = store.clone();
        let verifier = verifier.clone();
        let interval = settings.escrow.health_check_interval_secs;
        async move {
            loop {
                tokio::time::sleep(tokio::time::Duration::from_secs(interval)).await;

                let (chain_ok, store_check) =
                    futures::join!(verifier.health_check(), store.health_check());

                let mut healthy = true;
                if !chain_ok {
                    warn!("Foreign chain health check failed");
                    healthy = false;
                }
                if let Err(e) = store_check {
                    warn!("Request store health check failed: {}", e);
                    healthy = false;
                }

                if healthy {
                    metrics::record_health_check();
                } else {
                    metrics::record_health_check_failure();
                }
            }
        }
    });

    info!("ZeroMiles escrow is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    // Graceful shutdown; CLAIMED requests resume on next start
    engine.stop().await;

    // Abort background tasks
    api_handle.abort();
    engine_handle.abort();
    health_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    info!("ZeroMiles escrow stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,zeromiles_escrow=debug,sqlx=warn,hyper=warn")
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
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
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

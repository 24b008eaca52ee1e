use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

use max_player_counter::{
    api::{self, AppState},
    clock::{Clock, SystemClock},
    config::{AppConfig, Args},
    directory::InMemoryDirectory,
    jobs::{Pruner, Sampler},
    logging, metrics,
    service::{PeakService, ServiceOptions},
    store::{DuckDbStore, SampleStore},
    PeakError, Result,
};

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let config = match AppConfig::load(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = logging::init_logger(&config.logging) {
        eprintln!("{}", e);
        std::process::exit(1);
    }

    metrics::init_metrics();

    if let Err(e) = run(config).await {
        error!("Shutting down: {}", e);
        std::process::exit(1);
    }
}

async fn run(config: AppConfig) -> Result<()> {
    info!("Opening database at {}", config.database.path);
    let store: Arc<dyn SampleStore> = Arc::new(DuckDbStore::open(&config.database.path)?);
    let directory = Arc::new(InMemoryDirectory::with_servers(config.servers.iter().cloned()));
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let service = Arc::new(PeakService::new(
        store.clone(),
        directory.clone(),
        clock.clone(),
        ServiceOptions {
            cache_ttl: config.cache_ttl(),
            cache_refresh_margin: config.cache_refresh_margin(),
            carry_in: config.sampling.only_changes,
        },
    ));
    service.group_cache().invalidate();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let sampler = Sampler::new(
        store.clone(),
        directory.clone(),
        clock.clone(),
        config.sampling_interval(),
        config.sampling.only_changes,
    )
    .start(shutdown_rx.clone());

    let pruner = Pruner::new(
        store,
        clock,
        config.retention.keep_months,
        config.sampling.only_changes,
        config.retention_initial_delay(),
        config.retention_interval(),
    )
    .start(shutdown_rx);

    let app = api::router(AppState { service, directory });

    info!("Starting HTTP API on {}", config.server.listen);
    let listener = TcpListener::bind(&config.server.listen)
        .await
        .map_err(|e| PeakError::Internal(format!("Failed to bind to address: {}", e)))?;

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Received shutdown signal");
        })
        .await
        .map_err(|e| PeakError::Internal(format!("Server error: {}", e)));

    let _ = shutdown_tx.send(true);
    let (sampled, pruned) = tokio::join!(sampler, pruner);
    if let Err(e) = sampled {
        error!("Sampler task failed: {}", e);
    }
    if let Err(e) = pruned {
        error!("Pruner task failed: {}", e);
    }

    served
}

//! Resbroker daemon
//!
//! Owns the state database, runs the manager loop and the liveness
//! watcher, and keeps pools of externally-provisioned resources matched
//! to client tickets until told to stop.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use rb_broker::{Manager, Synchronizer};
use rb_store::Store;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    info!("Starting resbroker daemon");

    // Optional settings file; env vars override either way.
    let settings_path = std::env::var("RB_SERVER_CONFIG").ok().map(PathBuf::from);
    let config = rb_config::load_server(settings_path.as_deref())?;

    info!(
        config_dir = %config.config_dir.display(),
        logdir = %config.logdir.display(),
        sleeptime = config.sleeptime,
        "configuration loaded"
    );

    let store = Store::connect(&config.database_url).await?;
    let sync = Arc::new(Synchronizer::new());

    let manager = Manager::new(store, sync.clone(), config);
    let manager_handle = tokio::spawn(manager.run());

    info!("resbroker started, press Ctrl+C to shut down");
    shutdown_signal().await;
    info!("shutdown signal received");

    // Hooks have no cancellation model; in-flight subprocesses are
    // orphaned and the next start reconciles their outcome.
    manager_handle.abort();

    info!("resbroker shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

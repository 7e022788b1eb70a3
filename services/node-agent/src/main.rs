//! nodemgr Node Agent
//!
//! Periodically fetches the desired sliver state, reconciles local accounts
//! against it and persists the desired-state database for crash recovery.
//!
//! ## Architecture
//!
//! - **Reconciler**: Fetches desired state and runs a sync pass every period
//! - **Database**: Holds desired state and drives per-sliver workers
//! - **Snapshot dumper**: Writes the database to disk when asked
//! - **Backends**: Create and destroy accounts (mock in dev)

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use nodemgr_node_agent::accounts::{Accounts, BackendRegistry, InMemoryDirectory};
use nodemgr_node_agent::config::Config;
use nodemgr_node_agent::database::Database;
use nodemgr_node_agent::mock::{CallLog, MockBackend};
use nodemgr_node_agent::reconciler::{Reconciler, ReconcilerConfig};
use nodemgr_node_agent::snapshot::{run_dumper, SnapshotFile};
use nodemgr_node_agent::FileSource;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.as_str().into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting nodemgr node agent");
    info!(
        data_dir = %config.data_dir.display(),
        snapshot = %config.snapshot_path.display(),
        desired_state = %config.desired_state_path.display(),
        period_secs = config.period_secs,
        random_secs = config.random_secs,
        "Configuration loaded"
    );

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Register backends (mock for now). Mock backends keep their accounts in
    // memory, so they get an in-memory directory; `PasswdDirectory` pairs
    // with backends that create real OS accounts.
    let directory = Arc::new(InMemoryDirectory::new());
    let mut backends = BackendRegistry::new(directory.clone());
    let log = CallLog::default();
    backends.register(Arc::new(MockBackend::new(
        "sliver.LXC",
        "/bin/vsh",
        directory.clone(),
        log.clone(),
    )))?;
    backends.register(Arc::new(MockBackend::new(
        "sliver.VServer",
        "/bin/vserversh",
        directory,
        log,
    )))?;
    let accounts = Arc::new(Accounts::new(backends));

    // Restore desired state
    let snapshot = SnapshotFile::new(&config.snapshot_path);
    let db = Arc::new(Database::open(&snapshot, accounts, config.reconcile_config()));

    // Start the snapshot dumper
    let dumper_handle = tokio::spawn({
        let db = Arc::clone(&db);
        let shutdown_rx = shutdown_rx.clone();
        async move { run_dumper(db, snapshot, shutdown_rx).await }
    });

    // Start the reconciliation loop
    let reconciler = Reconciler::new(
        Arc::new(FileSource::new(&config.desired_state_path)),
        Arc::clone(&db),
        ReconcilerConfig::from(&config),
    );
    let reconciler_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            reconciler.run(shutdown_rx).await;
        }
    });

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = reconciler_handle => {
            if let Err(e) = result {
                error!(error = %e, "Reconciler task panicked");
            }
        }
    }

    // Signal shutdown to all workers
    let _ = shutdown_tx.send(true);

    // The dumper flushes any pending snapshot before it exits
    info!("Waiting for snapshot dumper to finish...");
    match tokio::time::timeout(Duration::from_secs(10), dumper_handle).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Snapshot dumper panicked"),
        Err(_) => error!("Timed out waiting for snapshot dumper"),
    }

    info!("Node agent shutdown complete");
    Ok(())
}

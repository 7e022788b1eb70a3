//! Periodic reconciliation loop.
//!
//! Each pass fetches the desired state, delivers it to the database and
//! runs a sync. A failed fetch still syncs against the last-known state so
//! expiry and retries keep making progress.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::client::DesiredStateSource;
use crate::config::Config;
use crate::database::{Database, ReconcileReport};

/// Reconciliation loop configuration.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Base interval between passes.
    pub period: Duration,

    /// Upper bound (exclusive) of the random delay added to each interval.
    pub random: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(Config::DEFAULT_PERIOD_SECS),
            random: Duration::from_secs(Config::DEFAULT_RANDOM_SECS),
        }
    }
}

impl From<&Config> for ReconcilerConfig {
    fn from(config: &Config) -> Self {
        Self {
            period: Duration::from_secs(config.period_secs),
            random: Duration::from_secs(config.random_secs),
        }
    }
}

impl ReconcilerConfig {
    /// Delay before the next pass.
    pub fn next_delay(&self) -> Duration {
        if self.random.is_zero() {
            return self.period;
        }
        let jitter = rand::rng().random_range(Duration::ZERO..self.random);
        self.period.saturating_add(jitter)
    }
}

pub struct Reconciler {
    source: Arc<dyn DesiredStateSource>,
    db: Arc<Database>,
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(
        source: Arc<dyn DesiredStateSource>,
        db: Arc<Database>,
        config: ReconcilerConfig,
    ) -> Self {
        Self { source, db, config }
    }

    /// Run passes until shutdown. The first pass starts immediately.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            period_secs = self.config.period.as_secs(),
            random_secs = self.config.random.as_secs(),
            "Starting reconciliation loop"
        );

        loop {
            self.pass().await;

            let delay = self.config.next_delay();
            debug!(delay = ?delay, "Next pass scheduled");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Reconciler shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Perform a single fetch-and-sync pass.
    pub async fn pass(&self) -> ReconcileReport {
        match self.source.fetch().await {
            Ok(batches) => self.db.apply_batches(batches).await,
            Err(e) => warn!(error = %e, "Failed to fetch desired state, using last known"),
        }
        self.db.sync().await
    }
}

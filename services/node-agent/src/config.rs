//! Configuration for the node agent.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::database::ReconcileConfig;

/// Node agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Data directory for local state.
    pub data_dir: PathBuf,

    /// Snapshot of the desired-state database.
    pub snapshot_path: PathBuf,

    /// Desired-state batches written by the control plane client.
    pub desired_state_path: PathBuf,

    /// Base polling period in seconds.
    pub period_secs: u64,

    /// Upper bound of the random delay added to each period, in seconds.
    pub random_secs: u64,

    /// Optional per-pass deadline in seconds.
    pub pass_deadline_secs: Option<u64>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    pub const DEFAULT_PERIOD_SECS: u64 = 600;
    pub const DEFAULT_RANDOM_SECS: u64 = 301;

    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let data_dir = PathBuf::from(
            lookup("NM_DATA_DIR").unwrap_or_else(|| "/var/lib/nodemanager".to_string()),
        );

        let snapshot_path = lookup("NM_SNAPSHOT_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("database.json"));

        let desired_state_path = lookup("NM_DESIRED_STATE_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("getslivers.json"));

        let period_secs = parse_secs(&lookup, "NM_PERIOD")?.unwrap_or(Self::DEFAULT_PERIOD_SECS);
        let random_secs = parse_secs(&lookup, "NM_RANDOM")?.unwrap_or(Self::DEFAULT_RANDOM_SECS);
        let pass_deadline_secs = parse_secs(&lookup, "NM_PASS_DEADLINE")?;

        let log_level = lookup("NM_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            data_dir,
            snapshot_path,
            desired_state_path,
            period_secs,
            random_secs,
            pass_deadline_secs,
            log_level,
        })
    }

    pub fn reconcile_config(&self) -> ReconcileConfig {
        ReconcileConfig {
            pass_deadline: self.pass_deadline_secs.map(Duration::from_secs),
        }
    }
}

fn parse_secs(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<u64>> {
    lookup(key)
        .map(|value| {
            value
                .trim()
                .parse::<u64>()
                .with_context(|| format!("{key} must be a number of seconds, got {value:?}"))
        })
        .transpose()
}

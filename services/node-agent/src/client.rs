//! Desired-state sources.
//!
//! Fetching from the control plane is done by an external client. The agent
//! only needs something that yields sliver batches; the default reads the
//! batches that client leaves on disk.

use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::debug;

use crate::ingest::SliverBatch;

/// Something that yields the current desired-state batches.
#[async_trait]
pub trait DesiredStateSource: Send + Sync {
    async fn fetch(&self) -> Result<Vec<SliverBatch>>;
}

/// Reads a JSON array of batches from a file.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl DesiredStateSource for FileSource {
    async fn fetch(&self) -> Result<Vec<SliverBatch>> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read desired state: {}", self.path.display()))?;
        let batches: Vec<SliverBatch> = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse desired state: {}", self.path.display()))?;
        debug!(
            path = %self.path.display(),
            batches = batches.len(),
            "Fetched desired state"
        );
        Ok(batches)
    }
}

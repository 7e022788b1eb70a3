//! Sliver accounts and their lifecycle.
//!
//! Each virtualization technology provides a [`Backend`] that knows how to
//! create and destroy the OS-level account for a sliver, and hands out an
//! [`Account`] handle to configure, start and stop it once it exists.
//!
//! Sliver names are reused over time and backend operations can take many
//! minutes, so every name gets exactly one long-lived [`Worker`] that drives
//! its transitions. Creations and destructions are additionally serialized
//! across all names by the [`LifecycleLocks`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nodemgr_reconcile::Record;
use thiserror::Error;
use tokio::sync::Mutex;

mod directory;
mod locks;
mod registry;
mod worker;

pub use directory::{AccountDirectory, InMemoryDirectory, PasswdDirectory};
pub use locks::{LifecycleLocks, LockStats};
pub use registry::{BackendRegistry, RegistryError};
pub use worker::{SliverState, Transition, Worker};

/// Errors reported by backend implementations.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The reference image or template for the requested family is missing.
    #[error("missing base image {image}")]
    MissingImage { image: String },

    /// An OS primitive failed while creating the account.
    #[error("creation failed: {0}")]
    Creation(String),

    /// An OS call failed; safe to retry on the next pass.
    #[error("transient backend failure: {0}")]
    Transient(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from a single sliver's lifecycle transition.
#[derive(Debug, Error)]
pub enum AccountError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("account lookup failed: {0}")]
    Directory(#[from] std::io::Error),
}

/// One virtualization technology.
///
/// `create` and `destroy` operate on a name; everything else goes through the
/// [`Account`] handle returned by [`Backend::account`].
#[async_trait]
pub trait Backend: Send + Sync {
    /// Type string carried by records, e.g. `sliver.LXC`.
    fn type_name(&self) -> &str;

    /// Login shell that marks an OS account as belonging to this backend.
    fn shell(&self) -> &str;

    /// Create the OS-level account for `name`.
    async fn create(&self, name: &str, record: &Record) -> Result<(), BackendError>;

    /// Destroy the OS-level account for `name`. Must succeed if already gone.
    async fn destroy(&self, name: &str) -> Result<(), BackendError>;

    /// Bind a handle to an existing account.
    fn account(&self, name: &str, record: &Record) -> Box<dyn Account>;
}

/// Handle to an existing sliver account.
#[async_trait]
pub trait Account: Send + Sync {
    /// Apply keys and resource limits. Re-applying the same record is a no-op.
    async fn configure(&mut self, record: &Record) -> Result<(), BackendError>;

    async fn start(&mut self, record: &Record, delay: Duration) -> Result<(), BackendError>;

    async fn stop(&mut self) -> Result<(), BackendError>;

    async fn is_running(&self) -> bool;

    /// True if the installed image family differs from `target_family`.
    async fn needs_reimage(&self, target_family: &str) -> bool;
}

/// Shared state a worker needs to run a transition.
pub struct Lifecycle {
    pub backends: BackendRegistry,
    pub locks: LifecycleLocks,
}

/// Backends, lifecycle locks and the name-to-worker registry.
pub struct Accounts {
    lifecycle: Arc<Lifecycle>,
    workers: Mutex<HashMap<String, Arc<Mutex<Worker>>>>,
}

impl Accounts {
    /// Wrap a fully populated backend registry.
    ///
    /// All backends must be registered before the first reconciliation pass.
    pub fn new(backends: BackendRegistry) -> Self {
        Self {
            lifecycle: Arc::new(Lifecycle {
                backends,
                locks: LifecycleLocks::new(),
            }),
            workers: Mutex::new(HashMap::new()),
        }
    }

    pub fn lifecycle(&self) -> &Arc<Lifecycle> {
        &self.lifecycle
    }

    pub fn backends(&self) -> &BackendRegistry {
        &self.lifecycle.backends
    }

    pub fn lock_stats(&self) -> LockStats {
        self.lifecycle.locks.stats()
    }

    /// Names of local accounts owned by a registered backend.
    pub fn existing(&self) -> std::io::Result<Vec<String>> {
        self.lifecycle.backends.existing_accounts()
    }

    /// The worker for `name`, created on first use.
    pub async fn get_or_create(&self, name: &str) -> Arc<Mutex<Worker>> {
        let mut workers = self.workers.lock().await;
        Arc::clone(
            workers
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(Worker::new(name)))),
        )
    }

    pub async fn worker_count(&self) -> usize {
        self.workers.lock().await.len()
    }
}

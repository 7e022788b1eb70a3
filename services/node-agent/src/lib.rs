//! nodemgr Node Agent Library
//!
//! The node agent runs on each node and keeps the local sliver accounts in
//! line with the desired state published by the control plane.
//!
//! ## Architecture
//!
//! ```text
//! Reconciler ── fetch ──> DesiredStateSource
//!     │
//!     └── sync ──> Database ──> Accounts ──> Worker(name) ──> Backend
//!                     │
//!                     └── dump request ──> snapshot dumper
//! ```
//!
//! ## Modules
//!
//! - `accounts`: backends, the per-name workers and the lifecycle locks
//! - `database`: desired-state store and the reconciliation pass
//! - `ingest`: conversion of control plane batches into records
//! - `snapshot`: crash-recovery persistence of the database
//! - `mock`: in-memory backend used in development and tests

pub mod accounts;
pub mod client;
pub mod config;
pub mod database;
pub mod ingest;
pub mod mock;
pub mod reconciler;
pub mod snapshot;

// Re-export commonly used types
pub use accounts::{Accounts, Backend, BackendRegistry, Transition};
pub use client::{DesiredStateSource, FileSource};
pub use database::{Database, ReconcileConfig, ReconcileReport, SliverOutcome};
pub use ingest::{SliverBatch, SliverData};
pub use mock::{CallLog, MockBackend};
pub use reconciler::{Reconciler, ReconcilerConfig};
pub use snapshot::SnapshotFile;

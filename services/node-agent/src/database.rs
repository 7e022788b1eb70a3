//! Desired-state database and the reconciliation pass.
//!
//! The database wraps a [`RecordStore`] behind a lock that is only ever held
//! for in-memory work. A pass computes everything it needs from one
//! consistent view of the store, releases the lock, and then drives each
//! affected sliver's worker in its own task.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{FuturesUnordered, StreamExt};
use nodemgr_reconcile::{Delivery, Loan, Record, RecordStore, StoreError, StoreSnapshot};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::accounts::{AccountError, Accounts, Transition};
use crate::ingest::{is_loanable, SliverBatch};
use crate::snapshot::SnapshotFile;

/// Reconciliation pass configuration.
#[derive(Debug, Clone, Default)]
pub struct ReconcileConfig {
    /// Stop waiting for slow transitions after this long. They keep running
    /// and their slivers are skipped by later passes until they finish.
    pub pass_deadline: Option<Duration>,
}

/// Outcome of one sliver's transition within a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SliverOutcome {
    Done(Transition),
    Failed(String),
    /// A transition from an earlier pass was still in flight.
    Busy,
}

/// Summary of a reconciliation pass.
#[derive(Debug, Clone, Default)]
pub struct ReconcileReport {
    pub expired: Vec<String>,
    pub outcomes: BTreeMap<String, SliverOutcome>,
    /// Transitions still running when the pass deadline hit.
    pub unfinished: usize,
}

impl ReconcileReport {
    pub fn transition(&self, name: &str) -> Option<Transition> {
        match self.outcomes.get(name) {
            Some(SliverOutcome::Done(transition)) => Some(*transition),
            _ => None,
        }
    }

    pub fn failures(&self) -> usize {
        self.outcomes
            .values()
            .filter(|outcome| matches!(outcome, SliverOutcome::Failed(_)))
            .count()
    }
}

struct DbState {
    store: RecordStore,
    dump_requested: bool,
}

/// The agent's desired-state database.
pub struct Database {
    state: Mutex<DbState>,
    dump_wanted: Notify,
    accounts: Arc<Accounts>,
    config: ReconcileConfig,
}

impl Database {
    pub fn new(store: RecordStore, accounts: Arc<Accounts>, config: ReconcileConfig) -> Self {
        Self {
            state: Mutex::new(DbState {
                store,
                dump_requested: false,
            }),
            dump_wanted: Notify::new(),
            accounts,
            config,
        }
    }

    /// Start from the last snapshot, or empty if it cannot be loaded.
    pub fn open(file: &SnapshotFile, accounts: Arc<Accounts>, config: ReconcileConfig) -> Self {
        let store = match file.load() {
            Ok(Some(store)) => store,
            Ok(None) => RecordStore::new(),
            Err(e) => {
                warn!(
                    path = %file.path().display(),
                    error = %e,
                    "Failed to load snapshot, starting with an empty database"
                );
                RecordStore::new()
            }
        };
        Self::new(store, accounts, config)
    }

    pub fn accounts(&self) -> &Arc<Accounts> {
        &self.accounts
    }

    pub async fn deliver(&self, record: Record) -> Delivery {
        self.state.lock().await.store.deliver(record)
    }

    pub async fn set_minimum_timestamp(&self, ts: i64) -> Vec<String> {
        self.state.lock().await.store.set_minimum_timestamp(ts)
    }

    /// Replace a sliver's loans. Loans of resources that cannot be lent are
    /// dropped.
    pub async fn set_loans(&self, name: &str, loans: Vec<Loan>) -> Result<(), StoreError> {
        let loans = loans
            .into_iter()
            .filter(|loan| {
                let loanable = is_loanable(&loan.resource);
                if !loanable {
                    warn!(sliver = %name, resource = %loan.resource, "Resource is not loanable");
                }
                loanable
            })
            .collect();
        self.state.lock().await.store.set_loans(name, loans)
    }

    pub async fn get(&self, name: &str) -> Option<Record> {
        self.state.lock().await.store.get(name).cloned()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.store.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.store.is_empty()
    }

    /// Deliver full-state batches from the control plane.
    ///
    /// Each batch's slivers are delivered, then the batch timestamp becomes
    /// the new watermark, evicting anything the batch no longer mentions.
    /// Loans carried by a sliver replace its stored loans.
    pub async fn apply_batches(&self, batches: Vec<SliverBatch>) {
        let mut state = self.state.lock().await;
        for batch in batches {
            let timestamp = batch.timestamp;
            let count = batch.slivers.len();
            for sliver in batch.slivers {
                let name = sliver.name.clone();
                let loans = sliver.requested_loans();
                let delivery = state.store.deliver(sliver.into_record(timestamp));
                if let Some(loans) = loans.filter(|_| delivery != Delivery::Stale) {
                    if let Err(e) = state.store.set_loans(&name, loans) {
                        warn!(sliver = %name, error = %e, "Failed to apply loans");
                    }
                }
            }
            state.store.set_minimum_timestamp(timestamp);
            debug!(timestamp, slivers = count, "Applied sliver batch");
        }
    }

    /// Run one reconciliation pass.
    ///
    /// Failures are per sliver: they are logged, reported and retried on the
    /// next pass, never propagated.
    pub async fn sync(&self) -> ReconcileReport {
        let now = chrono::Utc::now().timestamp();
        let (expired, desired, known) = {
            let mut state = self.state.lock().await;
            let expired = state.store.expire(now);
            state.store.compute_effective_rspecs();
            let desired: Vec<Record> = state.store.instantiated().cloned().collect();
            let known: HashSet<String> = state.store.names().map(str::to_string).collect();
            (expired, desired, known)
        };

        let orphans: Vec<String> = match self.accounts.existing() {
            Ok(existing) => existing
                .into_iter()
                .filter(|name| !known.contains(name))
                .collect(),
            Err(e) => {
                error!(error = %e, "Failed to list local accounts, skipping destroys");
                Vec::new()
            }
        };

        info!(
            desired = desired.len(),
            orphans = orphans.len(),
            expired = expired.len(),
            "Starting reconciliation pass"
        );

        let mut pending: FuturesUnordered<_> = orphans
            .into_iter()
            .map(|name| self.spawn_transition(name, None))
            .chain(
                desired
                    .into_iter()
                    .map(|record| self.spawn_transition(record.name.clone(), Some(record))),
            )
            .collect();

        let mut report = ReconcileReport {
            expired,
            ..Default::default()
        };
        let deadline = self.config.pass_deadline.map(|d| Instant::now() + d);

        loop {
            let next = match deadline {
                Some(at) => match tokio::time::timeout_at(at, pending.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        report.unfinished = pending.len();
                        warn!(
                            unfinished = report.unfinished,
                            "Pass deadline reached, leaving transitions running"
                        );
                        break;
                    }
                },
                None => pending.next().await,
            };
            let Some((name, joined)) = next else {
                break;
            };
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(sliver = %name, error = %e, "Transition task panicked");
                    SliverOutcome::Failed(e.to_string())
                }
            };
            report.outcomes.insert(name, outcome);
        }

        self.request_dump().await;

        info!(
            transitions = report.outcomes.len(),
            failures = report.failures(),
            unfinished = report.unfinished,
            "Reconciliation pass complete"
        );
        report
    }

    /// Ask the snapshot dumper to persist the store.
    pub async fn request_dump(&self) {
        self.state.lock().await.dump_requested = true;
        self.dump_wanted.notify_one();
    }

    /// Wait until a dump may have been requested.
    pub(crate) async fn dump_wanted(&self) {
        self.dump_wanted.notified().await;
    }

    /// Copy the store and clear the pending flag, if a dump was requested.
    pub(crate) async fn take_dump(&self) -> Option<StoreSnapshot> {
        let mut state = self.state.lock().await;
        if !state.dump_requested {
            return None;
        }
        state.dump_requested = false;
        Some(state.store.snapshot())
    }

    fn spawn_transition(
        &self,
        name: String,
        record: Option<Record>,
    ) -> impl std::future::Future<Output = (String, Result<SliverOutcome, tokio::task::JoinError>)>
    {
        let accounts = Arc::clone(&self.accounts);
        let span = info_span!("sliver", sliver = %name);
        let task_name = name.clone();
        let handle = tokio::spawn(
            async move {
                let worker = accounts.get_or_create(&task_name).await;
                let Ok(mut worker) = worker.try_lock_owned() else {
                    debug!("Previous transition still in flight, skipping");
                    return SliverOutcome::Busy;
                };

                let lifecycle = accounts.lifecycle();
                let result = match &record {
                    Some(record) => worker.ensure_created(record, lifecycle).await,
                    None => worker.ensure_destroyed(lifecycle).await,
                };
                match result {
                    Ok(transition) => SliverOutcome::Done(transition),
                    Err(e @ AccountError::Registry(_)) => {
                        warn!(error = %e, "Skipping sliver");
                        SliverOutcome::Failed(e.to_string())
                    }
                    Err(e) => {
                        error!(error = %e, "Sliver transition failed, will retry next pass");
                        SliverOutcome::Failed(e.to_string())
                    }
                }
            }
            .instrument(span),
        );
        async move { (name, handle.await) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::{BackendRegistry, InMemoryDirectory};
    use crate::ingest::SliverBatch;
    use crate::mock::{CallLog, MockBackend};

    fn database() -> Database {
        let directory = Arc::new(InMemoryDirectory::new());
        let mut backends = BackendRegistry::new(directory.clone());
        backends
            .register(Arc::new(MockBackend::new(
                "sliver.LXC",
                "/bin/sshsh",
                directory,
                CallLog::default(),
            )))
            .unwrap();
        Database::new(
            RecordStore::new(),
            Arc::new(Accounts::new(backends)),
            ReconcileConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_dump_requests_collapse() {
        let db = database();
        assert!(db.take_dump().await.is_none());

        db.request_dump().await;
        db.request_dump().await;
        db.request_dump().await;

        assert!(db.take_dump().await.is_some());
        assert!(db.take_dump().await.is_none());
    }

    #[tokio::test]
    async fn test_sync_requests_dump() {
        let db = database();
        db.sync().await;
        assert!(db.take_dump().await.is_some());
    }

    #[tokio::test]
    async fn test_apply_batches_sets_watermark() {
        let db = database();
        db.deliver(Record::new("old", "sliver.LXC", 1)).await;

        let batch: SliverBatch = serde_json::from_value(serde_json::json!({
            "timestamp": 10,
            "slivers": [{"name": "new", "instantiation": "plc-instantiated", "type": "sliver.LXC"}],
        }))
        .unwrap();
        db.apply_batches(vec![batch]).await;

        assert!(db.get("old").await.is_none());
        let record = db.get("new").await.unwrap();
        assert_eq!(record.timestamp, 10);
        assert_eq!(record.rspec["cpu_share"], 32);
    }

    #[tokio::test]
    async fn test_apply_batches_replaces_loans() {
        let db = database();
        let batch: SliverBatch = serde_json::from_value(serde_json::json!({
            "timestamp": 3,
            "slivers": [
                {
                    "name": "lender",
                    "instantiation": "plc-instantiated",
                    "type": "sliver.LXC",
                    "loans": [{"target": "borrower", "resource": "cpu_share", "amount": 8}],
                },
                {"name": "borrower", "instantiation": "plc-instantiated", "type": "sliver.LXC"},
            ],
        }))
        .unwrap();
        db.apply_batches(vec![batch]).await;

        let lender = db.get("lender").await.unwrap();
        assert_eq!(lender.private.loans, vec![Loan::new("borrower", "cpu_share", 8)]);
        assert!(db.get("borrower").await.unwrap().private.loans.is_empty());
    }

    #[tokio::test]
    async fn test_set_loans_drops_unloanable() {
        let db = database();
        db.deliver(Record::new("s1", "sliver.LXC", 1)).await;
        db.set_loans(
            "s1",
            vec![Loan::new("s2", "enabled", 1), Loan::new("s2", "cpu_share", 1)],
        )
        .await
        .unwrap();

        let record = db.get("s1").await.unwrap();
        assert_eq!(record.private.loans, vec![Loan::new("s2", "cpu_share", 1)]);
        assert!(db.set_loans("nobody", vec![]).await.is_err());
    }
}

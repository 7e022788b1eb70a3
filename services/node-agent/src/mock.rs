//! In-memory backend for development and tests.
//!
//! `MockBackend` keeps its accounts in an [`InMemoryDirectory`] and records
//! every backend call in a shared [`CallLog`], including how many creates and
//! destroys overlapped in time.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use nodemgr_reconcile::Record;
use tracing::{debug, info};

use crate::accounts::{Account, Backend, BackendError, InMemoryDirectory};

/// A single recorded backend call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendCall {
    Create { kind: String, name: String },
    Destroy { kind: String, name: String },
    Configure { kind: String, name: String },
    Start { kind: String, name: String },
    Stop { kind: String, name: String },
}

impl BackendCall {
    pub fn create(kind: &str, name: &str) -> Self {
        Self::Create {
            kind: kind.to_string(),
            name: name.to_string(),
        }
    }

    pub fn destroy(kind: &str, name: &str) -> Self {
        Self::Destroy {
            kind: kind.to_string(),
            name: name.to_string(),
        }
    }

    pub fn configure(kind: &str, name: &str) -> Self {
        Self::Configure {
            kind: kind.to_string(),
            name: name.to_string(),
        }
    }

    pub fn start(kind: &str, name: &str) -> Self {
        Self::Start {
            kind: kind.to_string(),
            name: name.to_string(),
        }
    }

    pub fn stop(kind: &str, name: &str) -> Self {
        Self::Stop {
            kind: kind.to_string(),
            name: name.to_string(),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Create { name, .. }
            | Self::Destroy { name, .. }
            | Self::Configure { name, .. }
            | Self::Start { name, .. }
            | Self::Stop { name, .. } => name,
        }
    }
}

#[derive(Debug, Default)]
struct CallLogInner {
    calls: Mutex<Vec<BackendCall>>,
    creates_in_flight: AtomicUsize,
    max_creates_in_flight: AtomicUsize,
    destroys_in_flight: AtomicUsize,
    max_destroys_in_flight: AtomicUsize,
}

/// Call log shared by any number of mock backends.
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    inner: Arc<CallLogInner>,
}

impl CallLog {
    pub fn calls(&self) -> Vec<BackendCall> {
        self.lock().clone()
    }

    pub fn count(&self, predicate: impl Fn(&BackendCall) -> bool) -> usize {
        self.lock().iter().filter(|call| predicate(call)).count()
    }

    /// Calls concerning one sliver, in order.
    pub fn calls_for(&self, name: &str) -> Vec<BackendCall> {
        self.lock()
            .iter()
            .filter(|call| call.name() == name)
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Highest number of creates observed running at the same time.
    pub fn max_concurrent_creates(&self) -> usize {
        self.inner.max_creates_in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of destroys observed running at the same time.
    pub fn max_concurrent_destroys(&self) -> usize {
        self.inner.max_destroys_in_flight.load(Ordering::SeqCst)
    }

    fn record(&self, call: BackendCall) {
        self.lock().push(call);
    }

    fn lock(&self) -> MutexGuard<'_, Vec<BackendCall>> {
        self.inner.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Tracks one overlapping operation for the duration of its scope.
struct InFlight<'a> {
    current: &'a AtomicUsize,
}

impl<'a> InFlight<'a> {
    fn enter(current: &'a AtomicUsize, max: &AtomicUsize) -> Self {
        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
        max.fetch_max(now, Ordering::SeqCst);
        Self { current }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Default)]
struct MockState {
    running: HashSet<String>,
    families: HashMap<String, String>,
    failing_creates: HashSet<String>,
    failing_configures: HashSet<String>,
}

/// Backend that only pretends to create accounts.
pub struct MockBackend {
    kind: String,
    shell: String,
    directory: Arc<InMemoryDirectory>,
    log: CallLog,
    state: Arc<Mutex<MockState>>,
    op_delay: Duration,
}

impl MockBackend {
    pub fn new(
        kind: impl Into<String>,
        shell: impl Into<String>,
        directory: Arc<InMemoryDirectory>,
        log: CallLog,
    ) -> Self {
        Self {
            kind: kind.into(),
            shell: shell.into(),
            directory,
            log,
            state: Arc::new(Mutex::new(MockState::default())),
            op_delay: Duration::ZERO,
        }
    }

    /// Make `create` and `destroy` take this long.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.op_delay = delay;
        self
    }

    /// Make creates of `name` fail as if its base image were missing.
    pub fn fail_creates_for(&self, name: &str) {
        lock_state(&self.state).failing_creates.insert(name.to_string());
    }

    /// Make `configure` of `name` fail as a transient OS error.
    pub fn fail_configures_for(&self, name: &str) {
        lock_state(&self.state).failing_configures.insert(name.to_string());
    }

    pub fn clear_failures(&self) {
        let mut state = lock_state(&self.state);
        state.failing_creates.clear();
        state.failing_configures.clear();
    }

    /// Mark an account as running, e.g. to seed a pre-existing sliver.
    pub fn set_running(&self, name: &str) {
        lock_state(&self.state).running.insert(name.to_string());
    }

    async fn pause(&self) {
        if !self.op_delay.is_zero() {
            tokio::time::sleep(self.op_delay).await;
        }
    }
}

fn lock_state(state: &Mutex<MockState>) -> MutexGuard<'_, MockState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

#[async_trait]
impl Backend for MockBackend {
    fn type_name(&self) -> &str {
        &self.kind
    }

    fn shell(&self) -> &str {
        &self.shell
    }

    async fn create(&self, name: &str, record: &Record) -> Result<(), BackendError> {
        let inner = &self.log.inner;
        let _in_flight = InFlight::enter(&inner.creates_in_flight, &inner.max_creates_in_flight);
        self.log.record(BackendCall::create(&self.kind, name));

        if lock_state(&self.state).failing_creates.contains(name) {
            return Err(BackendError::MissingImage {
                image: record.image_family().unwrap_or("default").to_string(),
            });
        }

        info!(sliver = %name, backend_type = %self.kind, "[MOCK] Creating account");
        self.pause().await;

        self.directory.add(name, &self.shell);
        if let Some(family) = record.image_family() {
            lock_state(&self.state)
                .families
                .insert(name.to_string(), family.to_string());
        }
        Ok(())
    }

    async fn destroy(&self, name: &str) -> Result<(), BackendError> {
        let inner = &self.log.inner;
        let _in_flight = InFlight::enter(&inner.destroys_in_flight, &inner.max_destroys_in_flight);
        self.log.record(BackendCall::destroy(&self.kind, name));

        info!(sliver = %name, backend_type = %self.kind, "[MOCK] Destroying account");
        self.pause().await;

        self.directory.remove(name);
        let mut state = lock_state(&self.state);
        state.running.remove(name);
        state.families.remove(name);
        Ok(())
    }

    fn account(&self, name: &str, _record: &Record) -> Box<dyn Account> {
        Box::new(MockAccount {
            name: name.to_string(),
            kind: self.kind.clone(),
            log: self.log.clone(),
            state: Arc::clone(&self.state),
            keys: None,
        })
    }
}

struct MockAccount {
    name: String,
    kind: String,
    log: CallLog,
    state: Arc<Mutex<MockState>>,
    keys: Option<String>,
}

#[async_trait]
impl Account for MockAccount {
    async fn configure(&mut self, record: &Record) -> Result<(), BackendError> {
        self.log.record(BackendCall::configure(&self.kind, &self.name));
        if lock_state(&self.state).failing_configures.contains(&self.name) {
            return Err(BackendError::Transient(format!(
                "cannot write keys for {}",
                self.name
            )));
        }
        if self.keys.as_deref() != Some(record.keys.as_str()) {
            debug!(sliver = %self.name, "[MOCK] Installing keys");
            self.keys = Some(record.keys.clone());
        }
        Ok(())
    }

    async fn start(&mut self, _record: &Record, delay: Duration) -> Result<(), BackendError> {
        self.log.record(BackendCall::start(&self.kind, &self.name));
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        lock_state(&self.state).running.insert(self.name.clone());
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), BackendError> {
        self.log.record(BackendCall::stop(&self.kind, &self.name));
        lock_state(&self.state).running.remove(&self.name);
        Ok(())
    }

    async fn is_running(&self) -> bool {
        lock_state(&self.state).running.contains(&self.name)
    }

    async fn needs_reimage(&self, target_family: &str) -> bool {
        // no stamp means the image is left as-is
        lock_state(&self.state)
            .families
            .get(&self.name)
            .is_some_and(|installed| installed != target_family)
    }
}

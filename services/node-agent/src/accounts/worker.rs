//! Per-name lifecycle driver.

use std::sync::Arc;
use std::time::Duration;

use nodemgr_reconcile::Record;
use tracing::{debug, info};

use super::{Account, AccountError, Backend, Lifecycle};

/// Where a sliver stands, as last observed by its worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliverState {
    /// No local account.
    Absent,
    /// The local account belongs to a different backend than desired.
    WrongType,
    /// Created but not configured yet. A worker stays here while
    /// configuration of a fresh account keeps failing.
    Configuring,
    Running,
    Stopped,
}

/// What a single `ensure_*` call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The account did not exist and was created.
    Created,
    /// The account had the wrong backend type; destroyed and created again.
    Recreated,
    /// The account existed and was (re)started.
    Started,
    /// Configuration was applied without starting.
    Configured,
    Destroyed,
    /// Nothing to do.
    Unchanged,
}

struct HeldAccount {
    kind: String,
    handle: Box<dyn Account>,
}

/// The single long-lived driver for one sliver name.
///
/// Callers serialize access through the `Mutex` the worker registry hands
/// out, so at most one transition per name is in flight.
pub struct Worker {
    name: String,
    account: Option<HeldAccount>,
    state: SliverState,
}

impl Worker {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            account: None,
            state: SliverState::Absent,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> SliverState {
        self.state
    }

    /// Backend type of the held account handle, if any.
    pub fn account_type(&self) -> Option<&str> {
        self.account.as_ref().map(|held| held.kind.as_str())
    }

    /// Bring the local account in line with `record`.
    ///
    /// Recreates the account when its backend type differs from the record's,
    /// then either starts it or only reconfigures it.
    pub async fn ensure_created(
        &mut self,
        record: &Record,
        lifecycle: &Lifecycle,
    ) -> Result<Transition, AccountError> {
        let current = lifecycle.backends.backend_for_account(&self.name)?;
        let desired = lifecycle.backends.backend_for_type(&record.kind)?;

        let current_type = current.as_ref().map(|backend| backend.type_name().to_string());
        let type_changed = current_type.as_deref() != Some(desired.type_name());

        if type_changed {
            if let Some(from) = &current_type {
                info!(
                    sliver = %self.name,
                    from = %from,
                    to = %desired.type_name(),
                    "Backend type changed, recreating account"
                );
                self.state = SliverState::WrongType;
            }
            self.destroy_with(current, lifecycle).await?;
            lifecycle
                .locks
                .creating(&self.name, desired.create(&self.name, record))
                .await?;
            self.state = SliverState::Configuring;
            info!(sliver = %self.name, backend_type = %desired.type_name(), "Account created");
        }

        if self
            .account
            .as_ref()
            .is_some_and(|held| held.kind != desired.type_name())
        {
            self.account = None;
        }
        let held = self.account.get_or_insert_with(|| HeldAccount {
            kind: desired.type_name().to_string(),
            handle: desired.account(&self.name, record),
        });

        let running = held.handle.is_running().await;
        debug!(sliver = %self.name, running, "Deciding between start and configure");

        let start = match record.reservation_alive {
            // only the lease holder may run the sliver
            Some(alive) => alive && !running,
            None if !running || type_changed => true,
            None => match record.image_family() {
                Some(family) => {
                    let reimage = held.handle.needs_reimage(family).await;
                    if reimage {
                        info!(sliver = %self.name, family = %family, "Account needs reimage");
                    }
                    reimage
                }
                None => false,
            },
        };

        held.handle.configure(record).await?;
        if start {
            held.handle.start(record, Duration::ZERO).await?;
            self.state = SliverState::Running;
        } else {
            self.state = if running {
                SliverState::Running
            } else {
                SliverState::Stopped
            };
        }

        Ok(match (type_changed, current_type.is_some(), start) {
            (true, true, _) => Transition::Recreated,
            (true, false, _) => Transition::Created,
            (false, _, true) => Transition::Started,
            (false, _, false) => Transition::Configured,
        })
    }

    /// Destroy the local account if one exists. Idempotent.
    pub async fn ensure_destroyed(&mut self, lifecycle: &Lifecycle) -> Result<Transition, AccountError> {
        let current = lifecycle.backends.backend_for_account(&self.name)?;
        if current.is_none() {
            self.account = None;
            self.state = SliverState::Absent;
            return Ok(Transition::Unchanged);
        }
        self.destroy_with(current, lifecycle).await?;
        info!(sliver = %self.name, "Account destroyed");
        Ok(Transition::Destroyed)
    }

    /// Stop the sliver through its held handle, if any.
    pub async fn stop(&mut self) -> Result<(), AccountError> {
        if let Some(held) = self.account.as_mut() {
            held.handle.stop().await?;
            self.state = SliverState::Stopped;
        }
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        match &self.account {
            Some(held) => held.handle.is_running().await,
            None => false,
        }
    }

    async fn destroy_with(
        &mut self,
        backend: Option<Arc<dyn Backend>>,
        lifecycle: &Lifecycle,
    ) -> Result<(), AccountError> {
        self.account = None;
        if let Some(backend) = backend {
            debug!(sliver = %self.name, backend_type = %backend.type_name(), "Destroying account");
            lifecycle
                .locks
                .destroying(&self.name, backend.destroy(&self.name))
                .await?;
        }
        self.state = SliverState::Absent;
        Ok(())
    }
}

//! In-memory desired-state record store.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::loans::compute_effective_rspecs;
use crate::record::{Loan, Record};

/// Errors from record store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no record for sliver {0}")]
    UnknownRecord(String),

    #[error("snapshot entry {key} holds record for {name}")]
    NameMismatch { key: String, name: String },
}

/// Result of delivering a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// No record existed; the delivered one was stored.
    Inserted,
    /// A strictly older record was replaced.
    Updated,
    /// The record was not newer than what is stored, or below the watermark.
    Stale,
}

/// Serializable copy of the whole store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub min_timestamp: i64,
    pub records: BTreeMap<String, Record>,
}

/// Mapping of sliver name to its desired-state record.
#[derive(Debug, Clone, Default)]
pub struct RecordStore {
    records: HashMap<String, Record>,
    min_timestamp: i64,
}

impl RecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a record delivered by the control plane.
    ///
    /// An existing record is replaced only by a strictly newer one, and keeps
    /// its private fields. A new name is accepted if its timestamp is at or
    /// above the minimum-timestamp watermark.
    pub fn deliver(&mut self, record: Record) -> Delivery {
        match self.records.get_mut(&record.name) {
            Some(existing) if record.timestamp > existing.timestamp => {
                existing.replace_public(record);
                Delivery::Updated
            }
            Some(existing) => {
                debug!(
                    sliver = %record.name,
                    stored = existing.timestamp,
                    delivered = record.timestamp,
                    "Ignoring record that is not newer"
                );
                Delivery::Stale
            }
            None if record.timestamp >= self.min_timestamp => {
                self.records.insert(record.name.clone(), record);
                Delivery::Inserted
            }
            None => {
                debug!(
                    sliver = %record.name,
                    watermark = self.min_timestamp,
                    delivered = record.timestamp,
                    "Ignoring record below watermark"
                );
                Delivery::Stale
            }
        }
    }

    /// Raise the watermark and evict every record older than `ts`.
    ///
    /// Returns the evicted names.
    pub fn set_minimum_timestamp(&mut self, ts: i64) -> Vec<String> {
        self.min_timestamp = ts;
        let evicted = self.remove_where(|record| record.timestamp < ts);
        if !evicted.is_empty() {
            info!(watermark = ts, count = evicted.len(), "Evicted stale records");
        }
        evicted
    }

    /// Remove records whose expiry time is before `now`.
    pub fn expire(&mut self, now: i64) -> Vec<String> {
        let expired = self.remove_where(|record| record.is_expired(now));
        for name in &expired {
            info!(sliver = %name, "Record expired");
        }
        expired
    }

    /// Recompute every record's effective allocation from its loans.
    pub fn compute_effective_rspecs(&mut self) {
        compute_effective_rspecs(&mut self.records);
    }

    /// Replace the loans a sliver hands out.
    pub fn set_loans(&mut self, name: &str, loans: Vec<Loan>) -> Result<(), StoreError> {
        let record = self
            .records
            .get_mut(name)
            .ok_or_else(|| StoreError::UnknownRecord(name.to_string()))?;
        record.private.loans = loans;
        Ok(())
    }

    pub fn loans(&self, name: &str) -> Result<&[Loan], StoreError> {
        self.records
            .get(name)
            .map(|record| record.private.loans.as_slice())
            .ok_or_else(|| StoreError::UnknownRecord(name.to_string()))
    }

    pub fn get(&self, name: &str) -> Option<&Record> {
        self.records.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.records.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.records.keys().map(String::as_str)
    }

    /// Records the agent is responsible for creating.
    pub fn instantiated(&self) -> impl Iterator<Item = &Record> {
        self.records.values().filter(|record| record.is_plc_instantiated())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn minimum_timestamp(&self) -> i64 {
        self.min_timestamp
    }

    /// Deep copy suitable for persisting.
    pub fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            min_timestamp: self.min_timestamp,
            records: self
                .records
                .iter()
                .map(|(name, record)| (name.clone(), record.clone()))
                .collect(),
        }
    }

    /// Rebuild a store from a persisted snapshot.
    pub fn from_snapshot(snapshot: StoreSnapshot) -> Result<Self, StoreError> {
        let mut records = HashMap::with_capacity(snapshot.records.len());
        for (key, record) in snapshot.records {
            if key != record.name {
                return Err(StoreError::NameMismatch {
                    key,
                    name: record.name,
                });
            }
            records.insert(key, record);
        }
        Ok(Self {
            records,
            min_timestamp: snapshot.min_timestamp,
        })
    }

    fn remove_where(&mut self, predicate: impl Fn(&Record) -> bool) -> Vec<String> {
        let doomed: Vec<String> = self
            .records
            .values()
            .filter(|record| predicate(record))
            .map(|record| record.name.clone())
            .collect();
        for name in &doomed {
            self.records.remove(name);
        }
        doomed
    }
}

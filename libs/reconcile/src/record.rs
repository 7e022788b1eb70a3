//! Sliver desired-state records.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Resource name to granted amount.
pub type Rspec = BTreeMap<String, i64>;

/// How a sliver came to exist on this node.
///
/// Only [`Instantiation::PlcInstantiated`] slivers are created by the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Instantiation {
    PlcInstantiated,
    Delegated,
    NmController,
    #[serde(other)]
    Other,
}

/// A voluntary transfer of a directly granted resource to another sliver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Loan {
    /// Sliver receiving the resource.
    pub target: String,
    /// Resource name, e.g. `cpu_share`.
    pub resource: String,
    /// Amount lent out.
    pub amount: i64,
}

impl Loan {
    pub fn new(target: impl Into<String>, resource: impl Into<String>, amount: i64) -> Self {
        Self {
            target: target.into(),
            resource: resource.into(),
            amount,
        }
    }
}

/// Agent-owned bookkeeping that survives record replacement.
///
/// Serialized with a leading underscore so it never collides with fields
/// coming from the control plane.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PrivateFields {
    /// Effective allocation after loans.
    #[serde(rename = "_rspec", default)]
    pub effective_rspec: Rspec,

    /// Loans this sliver wishes to hand out.
    #[serde(rename = "_loans", default)]
    pub loans: Vec<Loan>,
}

/// Desired state for one sliver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Unique sliver name (also the local account name).
    pub name: String,

    /// Source-assigned timestamp; larger is newer.
    pub timestamp: i64,

    pub instantiation: Instantiation,

    /// Backend type string, e.g. `sliver.LXC`.
    #[serde(rename = "type")]
    pub kind: String,

    /// Absolute expiry time (unix seconds).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<i64>,

    #[serde(default)]
    pub attributes: BTreeMap<String, String>,

    /// Newline-separated authorized keys.
    #[serde(default)]
    pub keys: String,

    /// Resources granted by the control plane.
    #[serde(default)]
    pub rspec: Rspec,

    /// Lease liveness on reservable nodes; absent elsewhere.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reservation_alive: Option<bool>,

    #[serde(flatten)]
    pub private: PrivateFields,
}

impl Record {
    /// Create a `plc-instantiated` record with no resources.
    pub fn new(name: impl Into<String>, kind: impl Into<String>, timestamp: i64) -> Self {
        Self {
            name: name.into(),
            timestamp,
            instantiation: Instantiation::PlcInstantiated,
            kind: kind.into(),
            expires: None,
            attributes: BTreeMap::new(),
            keys: String::new(),
            rspec: Rspec::new(),
            reservation_alive: None,
            private: PrivateFields::default(),
        }
    }

    pub fn with_rspec<K: Into<String>>(mut self, rspec: impl IntoIterator<Item = (K, i64)>) -> Self {
        self.rspec = rspec.into_iter().map(|(k, v)| (k.into(), v)).collect();
        self
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn with_instantiation(mut self, instantiation: Instantiation) -> Self {
        self.instantiation = instantiation;
        self
    }

    pub fn with_expires(mut self, expires: i64) -> Self {
        self.expires = Some(expires);
        self
    }

    pub fn with_reservation(mut self, alive: bool) -> Self {
        self.reservation_alive = Some(alive);
        self
    }

    /// Requested image family (the `vref` attribute).
    pub fn image_family(&self) -> Option<&str> {
        self.attributes.get("vref").map(String::as_str)
    }

    pub fn is_plc_instantiated(&self) -> bool {
        self.instantiation == Instantiation::PlcInstantiated
    }

    /// True once `now` is past the record's expiry.
    pub fn is_expired(&self, now: i64) -> bool {
        self.expires.is_some_and(|expires| expires < now)
    }

    /// Replace every public field with `newer`'s, keeping private fields.
    pub(crate) fn replace_public(&mut self, newer: Record) {
        let private = std::mem::take(&mut self.private);
        *self = newer;
        self.private = private;
    }
}

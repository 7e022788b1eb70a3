//! Conversion of control plane sliver batches into records.
//!
//! The control plane client hands over one or more batches, each declaring
//! the complete desired state as of its timestamp. Every sliver becomes a
//! [`Record`] stamped with the batch timestamp.

use std::collections::BTreeMap;

use nodemgr_reconcile::{Instantiation, Loan, Record, Rspec};
use serde::{Deserialize, Serialize};

/// Minimum bandwidth (bits/s) used when no limit is configured.
pub const BW_MIN: i64 = 8;
/// Maximum bandwidth (bits/s) used when no limit is configured.
pub const BW_MAX: i64 = 1_000_000_000;

/// Resources every sliver is granted unless an attribute overrides them.
pub const DEFAULT_ALLOCATIONS: &[(&str, i64)] = &[
    ("enabled", 1),
    ("cpu_min", 0),
    ("cpu_share", 32),
    ("net_min", BW_MIN),
    ("net_max", BW_MAX),
    ("net2_min", BW_MIN),
    ("net2_max", BW_MAX),
    ("net_share", 1),
    ("disk_max", 5_000_000),
];

/// Resources a sliver may lend to another.
pub const LOANABLE_RESOURCES: &[&str] = &[
    "cpu_min",
    "cpu_share",
    "net_min",
    "net_max",
    "net2_min",
    "net2_max",
    "net_share",
    "disk_max",
];

/// Complete desired state as of `timestamp`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SliverBatch {
    pub timestamp: i64,
    #[serde(default)]
    pub slivers: Vec<SliverData>,
}

/// One sliver as described by the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SliverData {
    pub name: String,
    pub instantiation: Instantiation,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub expires: Option<i64>,
    #[serde(default)]
    pub attributes: Vec<SliverAttribute>,
    #[serde(default)]
    pub keys: Vec<SliverKey>,
    /// Image family resolved by the control plane; wins over any `vref` tag.
    #[serde(rename = "GetSliceFamily", default)]
    pub slice_family: Option<String>,
    #[serde(default)]
    pub reservation_alive: Option<bool>,
    /// Loans the sliver hands out. `None` leaves the stored loans untouched.
    #[serde(default)]
    pub loans: Option<Vec<Loan>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SliverAttribute {
    #[serde(alias = "name")]
    pub tagname: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SliverKey {
    pub key: String,
}

impl SliverData {
    /// Loanable loans requested for this sliver, if the batch carries any.
    pub fn requested_loans(&self) -> Option<Vec<Loan>> {
        self.loans.as_ref().map(|loans| {
            loans
                .iter()
                .filter(|loan| is_loanable(&loan.resource))
                .cloned()
                .collect()
        })
    }

    /// Build the record delivered to the store.
    pub fn into_record(self, timestamp: i64) -> Record {
        let mut attributes: BTreeMap<String, String> = self
            .attributes
            .into_iter()
            .map(|attr| (attr.tagname, attr.value))
            .collect();
        if let Some(family) = self.slice_family {
            attributes.insert("vref".to_string(), family);
        }

        let rspec = rspec_from_attributes(&attributes);
        let keys = self
            .keys
            .into_iter()
            .map(|key| key.key)
            .collect::<Vec<_>>()
            .join("\n");

        let mut record = Record::new(self.name, self.kind, timestamp).with_instantiation(self.instantiation);
        record.expires = self.expires;
        record.attributes = attributes;
        record.keys = keys;
        record.rspec = rspec;
        record.reservation_alive = self.reservation_alive;
        record
    }
}

/// Default allocations, overridden by integer-valued attributes.
pub fn rspec_from_attributes(attributes: &BTreeMap<String, String>) -> Rspec {
    DEFAULT_ALLOCATIONS
        .iter()
        .map(|(resource, default)| {
            let amount = attributes
                .get(*resource)
                .and_then(|value| value.trim().parse::<i64>().ok())
                .unwrap_or(*default);
            (resource.to_string(), amount)
        })
        .collect()
}

pub fn is_loanable(resource: &str) -> bool {
    LOANABLE_RESOURCES.contains(&resource)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sliver_json() -> serde_json::Value {
        serde_json::json!({
            "name": "pl_lxc1",
            "instantiation": "plc-instantiated",
            "type": "sliver.LXC",
            "attributes": [
                {"tagname": "cpu_share", "value": "64"},
                {"name": "net_max", "value": "not-a-number"},
                {"tagname": "vref", "value": "lxc-f37-x86_64"},
            ],
            "keys": [{"key": "ssh-rsa AAA one"}, {"key": "ssh-rsa BBB two"}],
            "GetSliceFamily": "lxc-f39-x86_64",
        })
    }

    #[test]
    fn test_into_record() {
        let sliver: SliverData = serde_json::from_value(sliver_json()).unwrap();
        let record = sliver.into_record(42);

        assert_eq!(record.name, "pl_lxc1");
        assert_eq!(record.timestamp, 42);
        assert_eq!(record.kind, "sliver.LXC");
        assert!(record.is_plc_instantiated());
        assert_eq!(record.keys, "ssh-rsa AAA one\nssh-rsa BBB two");
        assert_eq!(record.image_family(), Some("lxc-f39-x86_64"));
        assert_eq!(record.rspec["cpu_share"], 64);
        // unparsable override falls back to the default
        assert_eq!(record.rspec["net_max"], BW_MAX);
        assert_eq!(record.rspec["disk_max"], 5_000_000);
        assert_eq!(record.rspec.len(), DEFAULT_ALLOCATIONS.len());
        assert!(record.reservation_alive.is_none());
    }

    #[test]
    fn test_requested_loans_keep_only_loanable() {
        let mut json = sliver_json();
        json["loans"] = serde_json::json!([
            {"target": "pl_other", "resource": "cpu_share", "amount": 8},
            {"target": "pl_other", "resource": "enabled", "amount": 1},
        ]);
        let sliver: SliverData = serde_json::from_value(json).unwrap();
        assert_eq!(
            sliver.requested_loans(),
            Some(vec![Loan::new("pl_other", "cpu_share", 8)])
        );

        let sliver: SliverData = serde_json::from_value(sliver_json()).unwrap();
        assert!(sliver.requested_loans().is_none());
    }

    #[test]
    fn test_batch_parses_without_slivers() {
        let batch: SliverBatch = serde_json::from_value(serde_json::json!({"timestamp": 7})).unwrap();
        assert_eq!(batch.timestamp, 7);
        assert!(batch.slivers.is_empty());
    }

    #[test]
    fn test_loanable_resources() {
        assert!(is_loanable("cpu_share"));
        assert!(!is_loanable("enabled"));
    }
}

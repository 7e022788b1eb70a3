//! Desired-state record store primitives.
//!
//! The node agent keeps one [`Record`] per sliver name, as last delivered by
//! the control plane. This crate owns the pure, synchronous part of the
//! reconciliation engine:
//!
//! - **Merge**: newer records replace older ones without losing private
//!   bookkeeping fields.
//! - **Eviction**: records older than the minimum-timestamp watermark, and
//!   records whose `expires` time has passed, are dropped.
//! - **Loans**: effective resource allocations are recomputed each pass from
//!   the directly granted `rspec` and the loans each sliver hands out.
//!
//! # Invariants
//!
//! - Keys are unique sliver names.
//! - A stored record is only ever replaced by one with a strictly greater
//!   timestamp.
//! - Loans are single-hop, so the effective allocations do not depend on
//!   iteration order.

mod loans;
mod record;
mod store;

pub use loans::compute_effective_rspecs;
pub use record::{Instantiation, Loan, PrivateFields, Record, Rspec};
pub use store::{Delivery, RecordStore, StoreError, StoreSnapshot};

//! Effective resource allocation after loans.
//!
//! Three views of a sliver's resources are involved:
//!
//! - `rspec`: what the control plane granted directly;
//! - `_rspec` ([`PrivateFields::effective_rspec`]): what the sliver ends up
//!   with after lending and borrowing;
//! - the residual: what is left of `rspec` after lending, which bounds
//!   further loans.
//!
//! A sliver may only lend out what it was granted directly. Borrowed amounts
//! never feed into the residual, so processing order cannot change the
//! result.
//!
//! [`PrivateFields::effective_rspec`]: crate::PrivateFields::effective_rspec

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::record::Record;

/// Recompute `_rspec` for every record from `rspec` and the lenders' loans.
///
/// A loan `(target, resource, amount)` is honoured when `target` is present
/// and `amount` is strictly less than the lender's residual for `resource`.
/// Loans naming an unknown resource or a non-positive amount are ignored.
pub fn compute_effective_rspecs(records: &mut HashMap<String, Record>) {
    let names: HashSet<String> = records.keys().cloned().collect();
    let mut credits: Vec<(String, String, i64)> = Vec::new();

    for (name, record) in records.iter_mut() {
        let mut effective = record.rspec.clone();
        let mut residual = record.rspec.clone();

        for loan in &record.private.loans {
            if loan.amount <= 0 || !names.contains(&loan.target) {
                continue;
            }
            let Some(available) = residual.get_mut(&loan.resource) else {
                continue;
            };
            if loan.amount >= *available {
                debug!(
                    sliver = %name,
                    target = %loan.target,
                    resource = %loan.resource,
                    amount = loan.amount,
                    available = *available,
                    "Loan exceeds residual allocation, ignored"
                );
                continue;
            }

            *available -= loan.amount;
            *effective.entry(loan.resource.clone()).or_insert(0) -= loan.amount;
            credits.push((loan.target.clone(), loan.resource.clone(), loan.amount));
        }

        record.private.effective_rspec = effective;
    }

    for (target, resource, amount) in credits {
        if let Some(record) = records.get_mut(&target) {
            *record
                .private
                .effective_rspec
                .entry(resource)
                .or_insert(0) += amount;
        }
    }
}

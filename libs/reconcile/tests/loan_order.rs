//! Property tests: effective allocations do not depend on the order in which
//! lenders are processed.

use std::collections::HashMap;

use nodemgr_reconcile::{compute_effective_rspecs, Loan, Record};
use proptest::prelude::*;

const RESOURCE: &str = "cpu_share";

/// Straightforward in-place evaluation, one lender at a time, in `order`.
fn sequential(records: &HashMap<String, Record>, order: &[String]) -> HashMap<String, i64> {
    let mut effective: HashMap<String, i64> = records
        .iter()
        .map(|(name, r)| (name.clone(), r.rspec.get(RESOURCE).copied().unwrap_or(0)))
        .collect();

    for name in order {
        let lender = &records[name];
        let mut residual = lender.rspec.get(RESOURCE).copied().unwrap_or(0);
        for loan in &lender.private.loans {
            if loan.amount > 0 && records.contains_key(&loan.target) && loan.amount < residual {
                residual -= loan.amount;
                *effective.get_mut(name).unwrap() -= loan.amount;
                *effective.get_mut(&loan.target).unwrap() += loan.amount;
            }
        }
    }
    effective
}

fn arb_records() -> impl Strategy<Value = Vec<Record>> {
    let loan = (0usize..7, -2i64..15);
    let record = (0i64..20, prop::collection::vec(loan, 0..4));
    prop::collection::vec(record, 1..6).prop_map(|specs| {
        specs
            .into_iter()
            .enumerate()
            .map(|(i, (granted, loans))| {
                let mut record = Record::new(format!("s{i}"), "t", 1).with_rspec([(RESOURCE, granted)]);
                // targets s5 and s6 never exist
                record.private.loans = loans
                    .into_iter()
                    .map(|(target, amount)| Loan::new(format!("s{target}"), RESOURCE, amount))
                    .collect();
                record
            })
            .collect()
    })
}

proptest! {
    #[test]
    fn loans_are_order_independent(
        (records, order) in arb_records().prop_flat_map(|records| {
            let names: Vec<String> = records.iter().map(|r| r.name.clone()).collect();
            (Just(records), Just(names).prop_shuffle())
        })
    ) {
        let mut store: HashMap<String, Record> =
            records.into_iter().map(|r| (r.name.clone(), r)).collect();
        let expected = sequential(&store, &order);

        compute_effective_rspecs(&mut store);

        for (name, record) in &store {
            prop_assert_eq!(record.private.effective_rspec[RESOURCE], expected[name]);
        }
    }

    #[test]
    fn loans_conserve_total_allocation(records in arb_records()) {
        let mut store: HashMap<String, Record> =
            records.into_iter().map(|r| (r.name.clone(), r)).collect();
        let granted: i64 = store.values().map(|r| r.rspec[RESOURCE]).sum();

        compute_effective_rspecs(&mut store);

        let effective: i64 = store.values().map(|r| r.private.effective_rspec[RESOURCE]).sum();
        prop_assert_eq!(granted, effective);
    }
}

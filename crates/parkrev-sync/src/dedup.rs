use std::collections::HashSet;

use parkrev_core::{DedupPolicy, KeyedRecord};

/// Keep one record per `id`. The survivors keep their relative order.
///
/// `FirstWins` keeps the earliest occurrence, `LastWins` the latest. Applying
/// either policy to its own output changes nothing.
pub fn dedupe(policy: DedupPolicy, records: Vec<KeyedRecord>) -> Vec<KeyedRecord> {
    let mut seen = HashSet::with_capacity(records.len());
    match policy {
        DedupPolicy::FirstWins => records
            .into_iter()
            .filter(|record| seen.insert(record.id.clone()))
            .collect(),
        DedupPolicy::LastWins => {
            let mut kept: Vec<KeyedRecord> = records
                .into_iter()
                .rev()
                .filter(|record| seen.insert(record.id.clone()))
                .collect();
            kept.reverse();
            kept
        }
    }
}

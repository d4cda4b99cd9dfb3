//! Links settlement rows to the meter-vendor row for the same card payment.

use std::cmp::Ordering;
use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use parkrev_core::{
    compare_ids, row_id, timestamp_from_value, value_as_text, Row, TimeWindow, FLOWBIRD_ID_FIELD,
    ID_FIELD, MATCH_FIELD, TRANSACTION_DATE_FIELD, UPDATED_AT_FIELD,
};
use parkrev_storage::{fetch_all_pages, RowQuery, UpsertGateway};
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::SyncError;

static NULL: Value = Value::Null;

/// `flowbird_id` to write onto a settlement row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Link {
    pub settlement_id: String,
    pub flowbird_id: Value,
    pub distance_secs: i64,
}

/// A row left out of matching because its keys could not be read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Exclusion {
    pub id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Reconciliation {
    pub links: Vec<Link>,
    pub unmatched: Vec<String>,
    pub excluded: Vec<Exclusion>,
}

struct Candidate<'a> {
    id: String,
    id_value: &'a Value,
    at: DateTime<Utc>,
}

/// Parsed `(id, match_field, transaction_date)` of a row, or why it cannot take part.
fn match_keys(row: &Row) -> Result<(String, String, DateTime<Utc>), Exclusion> {
    let id = row_id(row).ok_or_else(|| Exclusion {
        id: String::new(),
        reason: "row has no id".into(),
    })?;
    let excluded = |reason: String| Exclusion {
        id: id.clone(),
        reason,
    };
    let match_field = row
        .get(MATCH_FIELD)
        .and_then(value_as_text)
        .ok_or_else(|| excluded("no match_field".into()))?;
    let raw_date = row.get(TRANSACTION_DATE_FIELD).unwrap_or(&NULL);
    let at = timestamp_from_value(raw_date)
        .ok_or_else(|| excluded(format!("unparseable transaction_date {raw_date}")))?;
    Ok((id, match_field, at))
}

/// Nearest vendor row first; ties go to the earlier timestamp, then the lower id.
fn rank(target: DateTime<Utc>, a: &Candidate<'_>, b: &Candidate<'_>) -> Ordering {
    let da = (a.at - target).num_seconds().abs();
    let db = (b.at - target).num_seconds().abs();
    da.cmp(&db)
        .then_with(|| a.at.cmp(&b.at))
        .then_with(|| compare_ids(&a.id, &b.id))
}

/// Pick a vendor row for every settlement that shares its `match_field`.
///
/// Pure and deterministic: input order does not affect the result. Settlements
/// that already carry a link are ignored. A vendor row may be chosen by more
/// than one settlement.
pub fn reconcile(settlements: &[Row], vendors: &[Row], max_distance: Option<Duration>) -> Reconciliation {
    let mut outcome = Reconciliation::default();

    let mut groups: HashMap<String, Vec<Candidate<'_>>> = HashMap::new();
    for row in vendors {
        match match_keys(row) {
            Ok((id, match_field, at)) => {
                let id_value = row.get(ID_FIELD).unwrap_or(&NULL);
                groups
                    .entry(match_field)
                    .or_default()
                    .push(Candidate { id, id_value, at });
            }
            Err(exclusion) => {
                warn!(vendor_id = %exclusion.id, reason = %exclusion.reason, "vendor row excluded from matching");
                outcome.excluded.push(exclusion);
            }
        }
    }

    let mut pending: Vec<(String, String, DateTime<Utc>)> = Vec::with_capacity(settlements.len());
    for row in settlements {
        if row.get(FLOWBIRD_ID_FIELD).is_some_and(|v| !v.is_null()) {
            continue;
        }
        match match_keys(row) {
            Ok(keys) => pending.push(keys),
            Err(exclusion) => {
                warn!(settlement_id = %exclusion.id, reason = %exclusion.reason, "settlement row excluded from matching");
                outcome.excluded.push(exclusion);
            }
        }
    }
    pending.sort_by(|a, b| compare_ids(&a.0, &b.0));

    for (settlement_id, match_field, at) in pending {
        let best = groups
            .get(&match_field)
            .and_then(|candidates| candidates.iter().min_by(|a, b| rank(at, a, b)));
        let Some(best) = best else {
            outcome.unmatched.push(settlement_id);
            continue;
        };
        let distance = (best.at - at).num_seconds().abs();
        if max_distance.is_some_and(|max| distance > max.num_seconds()) {
            outcome.unmatched.push(settlement_id);
            continue;
        }
        outcome.links.push(Link {
            settlement_id,
            flowbird_id: best.id_value.clone(),
            distance_secs: distance,
        });
    }
    outcome
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconcileSummary {
    pub run_id: Uuid,
    pub window: TimeWindow,
    pub settlements_considered: usize,
    pub vendor_candidates: usize,
    pub linked: usize,
    pub unmatched: usize,
    pub excluded: usize,
}

/// Reads unmatched settlements and windowed vendor rows, then writes links back.
pub struct ReconcileJob {
    gateway: UpsertGateway,
    settlement_table: String,
    vendor_table: String,
    page_size: usize,
    max_distance: Option<Duration>,
}

impl ReconcileJob {
    pub fn new(
        gateway: UpsertGateway,
        settlement_table: impl Into<String>,
        vendor_table: impl Into<String>,
    ) -> Self {
        Self {
            gateway,
            settlement_table: settlement_table.into(),
            vendor_table: vendor_table.into(),
            page_size: crate::config::DEFAULT_PAGE_SIZE,
            max_distance: None,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn with_max_distance(mut self, max_distance: Option<Duration>) -> Self {
        self.max_distance = max_distance;
        self
    }

    pub async fn run(&self, run_id: Uuid, window: TimeWindow) -> Result<ReconcileSummary, SyncError> {
        let store = self.gateway.store().as_ref();

        let settlements = fetch_all_pages(
            store,
            RowQuery::table(&self.settlement_table)
                .where_null(FLOWBIRD_ID_FIELD)
                .order_by(ID_FIELD),
            self.page_size,
        )
        .await
        .map_err(|source| SyncError::Read {
            table: self.settlement_table.clone(),
            source,
        })?;

        let vendors = fetch_all_pages(
            store,
            RowQuery::table(&self.vendor_table)
                .columns(&[ID_FIELD, MATCH_FIELD, TRANSACTION_DATE_FIELD])
                .updated_within(window)
                .order_by(ID_FIELD),
            self.page_size,
        )
        .await
        .map_err(|source| SyncError::Read {
            table: self.vendor_table.clone(),
            source,
        })?;

        let outcome = reconcile(&settlements, &vendors, self.max_distance);

        let by_id: HashMap<String, &Row> = settlements
            .iter()
            .filter_map(|row| row_id(row).map(|id| (id, row)))
            .collect();
        let mut writes = Vec::with_capacity(outcome.links.len());
        for link in &outcome.links {
            let Some(current) = by_id.get(&link.settlement_id) else {
                continue;
            };
            // never replace an existing link
            if current.get(FLOWBIRD_ID_FIELD).is_some_and(|v| !v.is_null()) {
                continue;
            }
            let mut row = (*current).clone();
            row.remove(UPDATED_AT_FIELD);
            row.insert(FLOWBIRD_ID_FIELD.to_string(), link.flowbird_id.clone());
            writes.push(row);
        }
        if !writes.is_empty() {
            self.gateway.upsert(&self.settlement_table, &writes).await?;
        }

        let summary = ReconcileSummary {
            run_id,
            window,
            settlements_considered: settlements.len(),
            vendor_candidates: vendors.len(),
            linked: writes.len(),
            unmatched: outcome.unmatched.len(),
            excluded: outcome.excluded.len(),
        };
        info!(
            settlement_table = %self.settlement_table,
            vendor_table = %self.vendor_table,
            %window,
            considered = summary.settlements_considered,
            candidates = summary.vendor_candidates,
            linked = summary.linked,
            unmatched = summary.unmatched,
            excluded = summary.excluded,
            "reconciliation complete"
        );
        Ok(summary)
    }
}

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use parkrev_core::{compare_values, row_id, timestamp_from_value, Row, UPDATED_AT_FIELD};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::{MirrorReceipt, OperationalStore, PublicMirror, RowQuery, StoreError};

/// Source of the `updated_at` stamp applied on write.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Failure mode injected into the next write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedFailure {
    Transient,
    Rejected,
}

#[derive(Debug, Clone, Copy)]
struct PendingFailure {
    accept_rows: usize,
    kind: InjectedFailure,
}

impl PendingFailure {
    fn into_error(self, target: &str, rows: &[Row]) -> StoreError {
        match self.kind {
            InjectedFailure::Transient => StoreError::Transient {
                target: target.to_string(),
                status: Some(503),
                message: "injected failure".into(),
            },
            InjectedFailure::Rejected => StoreError::Rejected {
                target: target.to_string(),
                status: 400,
                message: "injected failure".into(),
                payload: Some(Value::Array(
                    rows.iter().cloned().map(Value::Object).collect(),
                )),
            },
        }
    }
}

/// Count one row against a pending failure; yields the failure once its budget is spent.
fn take_if_exhausted(slot: &mut Option<PendingFailure>) -> Option<PendingFailure> {
    let pending = slot.as_mut()?;
    if pending.accept_rows == 0 {
        return slot.take();
    }
    pending.accept_rows -= 1;
    None
}

type Tables = BTreeMap<String, BTreeMap<String, Row>>;

/// In-process operational store. Upserts stamp `updated_at` from the clock.
pub struct MemoryStore {
    tables: Mutex<Tables>,
    clock: Clock,
    failure: Mutex<Option<PendingFailure>>,
    select_calls: AtomicUsize,
    upsert_calls: AtomicUsize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(Utc::now))
    }

    pub fn with_clock(clock: Clock) -> Self {
        Self {
            tables: Mutex::new(BTreeMap::new()),
            clock,
            failure: Mutex::new(None),
            select_calls: AtomicUsize::new(0),
            upsert_calls: AtomicUsize::new(0),
        }
    }

    pub fn select_calls(&self) -> usize {
        self.select_calls.load(Ordering::SeqCst)
    }

    pub fn upsert_calls(&self) -> usize {
        self.upsert_calls.load(Ordering::SeqCst)
    }

    /// Commit `accept_rows` more rows, then fail the upsert that would write the next one.
    pub async fn fail_after_rows(&self, accept_rows: usize, kind: InjectedFailure) {
        *self.failure.lock().await = Some(PendingFailure { accept_rows, kind });
    }

    /// Insert rows as-is, keeping any `updated_at` they already carry.
    pub async fn seed(&self, table: &str, rows: Vec<Row>) {
        let now = self.stamp();
        let mut tables = self.tables.lock().await;
        let entries = tables.entry(table.to_string()).or_default();
        for mut row in rows {
            if let Some(id) = row_id(&row) {
                row.entry(UPDATED_AT_FIELD.to_string())
                    .or_insert_with(|| Value::String(now.clone()));
                entries.insert(id, row);
            }
        }
    }

    pub async fn rows(&self, table: &str) -> Vec<Row> {
        self.tables
            .lock()
            .await
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn get(&self, table: &str, id: &str) -> Option<Row> {
        self.tables
            .lock()
            .await
            .get(table)
            .and_then(|rows| rows.get(id).cloned())
    }

    fn stamp(&self) -> String {
        (self.clock)().to_rfc3339_opts(SecondsFormat::Micros, true)
    }
}

fn matches(query: &RowQuery, row: &Row) -> bool {
    if let Some(window) = &query.updated_between {
        let stamped = row.get(UPDATED_AT_FIELD).and_then(timestamp_from_value);
        if !stamped.is_some_and(|ts| window.contains(ts)) {
            return false;
        }
    }
    query
        .null_fields
        .iter()
        .all(|field| row.get(field).map_or(true, Value::is_null))
}

fn project(query: &RowQuery, row: Row) -> Row {
    match &query.columns {
        None => row,
        Some(columns) => columns
            .iter()
            .filter_map(|c| row.get(c).map(|v| (c.clone(), v.clone())))
            .collect(),
    }
}

#[async_trait]
impl OperationalStore for MemoryStore {
    async fn select(&self, query: &RowQuery) -> Result<Vec<Row>, StoreError> {
        self.select_calls.fetch_add(1, Ordering::SeqCst);
        let tables = self.tables.lock().await;
        let mut rows = tables
            .get(&query.table)
            .map(|rows| {
                rows.values()
                    .filter(|row| matches(query, row))
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        drop(tables);

        rows.sort_by(|a, b| {
            query
                .order_by
                .iter()
                .map(|field| compare_values(a.get(field), b.get(field)))
                .find(|ord| ord.is_ne())
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let limit = query.limit.unwrap_or(usize::MAX);
        Ok(rows
            .into_iter()
            .skip(query.offset)
            .take(limit)
            .map(|row| project(query, row))
            .collect())
    }

    async fn upsert(&self, table: &str, rows: &[Row]) -> Result<(), StoreError> {
        self.upsert_calls.fetch_add(1, Ordering::SeqCst);
        let mut failure = self.failure.lock().await;
        let mut tables = self.tables.lock().await;
        let entries = tables.entry(table.to_string()).or_default();

        for (index, row) in rows.iter().enumerate() {
            if let Some(pending) = take_if_exhausted(&mut failure) {
                return Err(pending.into_error(table, &rows[index..]));
            }
            let id = row_id(row).ok_or_else(|| StoreError::Rejected {
                target: table.to_string(),
                status: 400,
                message: "row has no id".into(),
                payload: Some(Value::Object(row.clone())),
            })?;
            // Columns the row carries are overwritten, nulls included; others keep their value.
            let stored = entries.entry(id).or_default();
            for (column, value) in row {
                stored.insert(column.clone(), value.clone());
            }
            stored.insert(UPDATED_AT_FIELD.to_string(), Value::String(self.stamp()));
        }
        Ok(())
    }
}

/// In-process public mirror keyed by dataset id then row id.
#[derive(Default)]
pub struct MemoryMirror {
    datasets: Mutex<Tables>,
    failure: Mutex<Option<PendingFailure>>,
    batches: Mutex<Vec<(String, usize)>>,
    upsert_calls: AtomicUsize,
}

impl MemoryMirror {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert_calls(&self) -> usize {
        self.upsert_calls.load(Ordering::SeqCst)
    }

    /// Accept `accept_rows` more rows, then fail the upsert that would write the next one.
    pub async fn fail_after_rows(&self, accept_rows: usize, kind: InjectedFailure) {
        *self.failure.lock().await = Some(PendingFailure { accept_rows, kind });
    }

    pub async fn rows(&self, dataset_id: &str) -> Vec<Row> {
        self.datasets
            .lock()
            .await
            .get(dataset_id)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    /// `(dataset_id, row_count)` of every upsert request received, in order.
    pub async fn batches(&self) -> Vec<(String, usize)> {
        self.batches.lock().await.clone()
    }
}

#[async_trait]
impl PublicMirror for MemoryMirror {
    async fn upsert(&self, dataset_id: &str, rows: &[Row]) -> Result<MirrorReceipt, StoreError> {
        self.upsert_calls.fetch_add(1, Ordering::SeqCst);
        self.batches
            .lock()
            .await
            .push((dataset_id.to_string(), rows.len()));
        let mut failure = self.failure.lock().await;
        let mut datasets = self.datasets.lock().await;
        let entries = datasets.entry(dataset_id.to_string()).or_default();

        let mut receipt = MirrorReceipt::default();
        for (index, row) in rows.iter().enumerate() {
            if let Some(pending) = take_if_exhausted(&mut failure) {
                return Err(pending.into_error(dataset_id, &rows[index..]));
            }
            let id = row_id(row).ok_or_else(|| StoreError::Rejected {
                target: dataset_id.to_string(),
                status: 400,
                message: "row has no id".into(),
                payload: Some(Value::Object(row.clone())),
            })?;
            match entries.insert(id, row.clone()) {
                Some(_) => receipt.rows_updated += 1,
                None => receipt.rows_created += 1,
            }
        }
        Ok(receipt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use parkrev_core::TimeWindow;
    use serde_json::json;

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    fn fixed_clock(ts: DateTime<Utc>) -> Clock {
        Arc::new(move || ts)
    }

    #[tokio::test]
    async fn upsert_overwrites_supplied_columns_and_stamps_updated_at() {
        let ts = Utc.with_ymd_and_hms(2024, 4, 1, 12, 0, 0).single().unwrap();
        let store = MemoryStore::with_clock(fixed_clock(ts));
        store
            .upsert(
                "t",
                &[row(json!({ "id": "1", "status": "PENDING", "note": "x", "flowbird_id": "9" }))],
            )
            .await
            .unwrap();
        store
            .upsert("t", &[row(json!({ "id": "1", "status": "SETTLED", "note": null }))])
            .await
            .unwrap();

        let stored = store.get("t", "1").await.unwrap();
        assert_eq!(stored.get("status"), Some(&json!("SETTLED")));
        assert_eq!(stored.get("note"), Some(&Value::Null));
        assert_eq!(stored.get("flowbird_id"), Some(&json!("9")));
        assert_eq!(
            stored.get(UPDATED_AT_FIELD),
            Some(&json!("2024-04-01T12:00:00.000000Z"))
        );
    }

    #[tokio::test]
    async fn select_filters_window_and_nulls_inclusively() {
        let store = MemoryStore::new();
        store
            .seed(
                "s",
                vec![
                    row(json!({ "id": "1", "updated_at": "2024-01-01T00:00:00Z", "flowbird_id": null })),
                    row(json!({ "id": "2", "updated_at": "2024-01-02T00:00:00Z" })),
                    row(json!({ "id": "3", "updated_at": "2024-01-02T00:00:01Z" })),
                    row(json!({ "id": "4", "updated_at": "2024-01-01T10:00:00Z", "flowbird_id": "9" })),
                ],
            )
            .await;
        let window = TimeWindow::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).single().unwrap(),
        )
        .unwrap();

        let in_window = store
            .select(&RowQuery::table("s").updated_within(window).order_by("id"))
            .await
            .unwrap();
        let ids: Vec<_> = in_window.iter().filter_map(row_id).collect();
        assert_eq!(ids, vec!["1", "2", "4"]);

        let unlinked = store
            .select(&RowQuery::table("s").where_null("flowbird_id").columns(&["id"]))
            .await
            .unwrap();
        assert_eq!(unlinked.len(), 3);
        assert!(unlinked.iter().all(|r| r.len() == 1));
    }

    #[tokio::test]
    async fn injected_failure_leaves_earlier_rows_committed() {
        let store = MemoryStore::new();
        store.fail_after_rows(2, InjectedFailure::Transient).await;
        let rows: Vec<Row> = (1..=4).map(|i| row(json!({ "id": i }))).collect();

        let err = store.upsert("t", &rows).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(store.rows("t").await.len(), 2);

        store.upsert("t", &rows).await.unwrap();
        assert_eq!(store.rows("t").await.len(), 4);
    }

    #[tokio::test]
    async fn mirror_counts_created_and_updated_rows() {
        let mirror = MemoryMirror::new();
        let first = mirror
            .upsert("ds", &[row(json!({ "id": "a" })), row(json!({ "id": "b" }))])
            .await
            .unwrap();
        let second = mirror
            .upsert("ds", &[row(json!({ "id": "b" })), row(json!({ "id": "c" }))])
            .await
            .unwrap();

        assert_eq!(first, MirrorReceipt { rows_created: 2, rows_updated: 0 });
        assert_eq!(second, MirrorReceipt { rows_created: 1, rows_updated: 1 });
        assert_eq!(mirror.rows("ds").await.len(), 3);
        assert_eq!(mirror.batches().await, vec![("ds".to_string(), 2), ("ds".to_string(), 2)]);
    }
}

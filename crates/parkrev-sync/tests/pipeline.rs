use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use parkrev_adapters::{InboxRecordSource, MemoryRecordSource, RecordSource};
use parkrev_core::{RawRecord, Row, TimeWindow};
use parkrev_storage::{Clock, MemoryMirror, MemoryStore};
use parkrev_sync::{AppConfig, SyncRuntime, Target};
use serde_json::{json, Value};

const CONFIG: &str = r#"
store: { endpoint: http://localhost:3000 }
mirror: { domain: data.example.org }
ingest: { upsert_chunk_size: 500 }
meter_locations:
  - { first: 19001905, last: 19001909, name: MoPac Lot }
  - { first: 10000101, last: 10001999, name: Core }
publish:
  page_size: 10000
  upload_chunk_size: 1000
  datasets:
    - { name: fiserv, table: fiserv_reports_raw, dataset_id: fsrv-0001, order_by: invoice_id, deny_fields: [match_field] }
    - { name: meters, table: flowbird_transactions_raw, dataset_id: mtrs-0002 }
    - { name: payments, table: flowbird_payments_raw, dataset_id: pmts-0003, order_by: invoice_id, deny_fields: [match_field] }
    - { name: transactions, table: transactions, dataset_id: txns-0004 }
"#;

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2023, 6, 2, 12, 0, 0).unwrap()
}

fn window() -> TimeWindow {
    TimeWindow::new(
        Utc.with_ymd_and_hms(2023, 6, 1, 0, 0, 0).unwrap(),
        Utc.with_ymd_and_hms(2023, 6, 3, 0, 0, 0).unwrap(),
    )
    .unwrap()
}

fn config() -> AppConfig {
    let config = AppConfig::from_yaml(CONFIG).unwrap();
    config.validate().unwrap();
    config
}

fn store() -> Arc<MemoryStore> {
    let clock: Clock = Arc::new(now);
    Arc::new(MemoryStore::with_clock(clock))
}

fn runtime(
    store: &Arc<MemoryStore>,
    mirror: &Arc<MemoryMirror>,
    records: impl RecordSource + 'static,
) -> SyncRuntime {
    SyncRuntime::new(config(), store.clone(), mirror.clone(), Arc::new(records))
}

fn raw(value: Value) -> RawRecord {
    RawRecord::new(value.as_object().cloned().unwrap())
}

fn row(value: Value) -> Row {
    value.as_object().cloned().unwrap()
}

fn fiserv(status: &str) -> RawRecord {
    raw(json!({
        "Invoice Number": "1905000042",
        "Account #": "************1234",
        "Txn Date": "2023-06-01 10:15:00",
        "Transaction Type": "Sale",
        "Terminal ID": "8788001",
        "Batch No.": 812,
        "Batch Sequence ID": 3,
        "Batch Date": "2023-06-01",
        "Record Date": "2023-06-03",
        "Processed Sales Amount": "$2.50",
        "Transaction Status": status,
        "Site ID (BE)": "8788001234"
    }))
}

fn flowbird_payment(banking_id: i64, terminal: Option<&str>) -> RawRecord {
    let mut record = json!({
        "TRANSACTION_NUMBER": banking_id,
        "MASKED_PAN": "XXXXXXXXXXXX1234",
        "SCHEME": "VISA",
        "TRANSACTION_DATE": "2023-06-01 10:14:00",
        "TRANSACTION_AMOUNT": "2.50",
        "TRANSACTION_STATUS": "Accepted",
        "REMITTANCE_STATUS": "Remitted"
    });
    if let Some(terminal) = terminal {
        record["TERMINAL_ID"] = json!(terminal);
    }
    raw(record)
}

#[tokio::test]
async fn nearest_vendor_candidate_is_linked() {
    let store = store();
    let mirror = Arc::new(MemoryMirror::new());
    store
        .seed(
            "fiserv_reports_raw",
            vec![row(json!({
                "id": "812-55",
                "match_field": "x1234-55",
                "transaction_date": "2023-06-01T10:00:00Z",
                "amount": 2.5,
                "flowbird_id": null
            }))],
        )
        .await;
    store
        .seed(
            "flowbird_payments_raw",
            vec![
                row(json!({ "id": "200", "match_field": "x1234-55", "transaction_date": "2023-06-01T12:00:00Z" })),
                row(json!({ "id": "201", "match_field": "x1234-55", "transaction_date": "2023-06-01T10:05:00Z" })),
            ],
        )
        .await;

    let summary = runtime(&store, &mirror, MemoryRecordSource::new())
        .reconcile(window())
        .await
        .unwrap();
    assert_eq!(summary.settlements_considered, 1);
    assert_eq!(summary.vendor_candidates, 2);
    assert_eq!(summary.linked, 1);

    let settlement = store.get("fiserv_reports_raw", "812-55").await.unwrap();
    assert_eq!(settlement["flowbird_id"], json!("201"));
    // the write-back keeps every other column
    assert_eq!(settlement["amount"], json!(2.5));
    assert_eq!(settlement["match_field"], json!("x1234-55"));
}

#[tokio::test]
async fn redelivered_settlement_keeps_the_latest_status() {
    let store = store();
    let mirror = Arc::new(MemoryMirror::new());

    for status in ["Pending", "Settled"] {
        let records = MemoryRecordSource::new().with_batch("fiserv", vec![fiserv(status)]);
        let summaries = runtime(&store, &mirror, records)
            .ingest(&"fiserv".parse().unwrap(), window())
            .await
            .unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].upserted, 1);
    }

    let rows = store.rows("fiserv_reports_raw").await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["id"], json!("812-1905000042"));
    assert_eq!(rows[0]["transaction_status"], json!("Settled"));
}

#[tokio::test]
async fn redelivered_settlement_keeps_its_link() {
    let store = store();
    let mirror = Arc::new(MemoryMirror::new());
    let records = MemoryRecordSource::new()
        .with_batch("fiserv", vec![fiserv("Pending")])
        .with_batch("flowbird_payments", vec![flowbird_payment(42, Some("19001905"))]);
    let first = runtime(&store, &mirror, records);
    first.ingest(&Target::All, window()).await.unwrap();

    let reconciled = first.reconcile(window()).await.unwrap();
    assert_eq!(reconciled.linked, 1);
    let linked = store.get("fiserv_reports_raw", "812-1905000042").await.unwrap();
    assert_eq!(linked["flowbird_id"], json!("1905000042"));

    let redelivery = MemoryRecordSource::new().with_batch("fiserv", vec![fiserv("Settled")]);
    runtime(&store, &mirror, redelivery)
        .ingest(&"fiserv".parse().unwrap(), window())
        .await
        .unwrap();

    let row = store.get("fiserv_reports_raw", "812-1905000042").await.unwrap();
    assert_eq!(row["transaction_status"], json!("Settled"));
    assert_eq!(row["flowbird_id"], json!("1905000042"));
}

#[tokio::test]
async fn publication_pages_until_an_empty_page() {
    let store = store();
    let mirror = Arc::new(MemoryMirror::new());
    let rows = (1..=12_500)
        .map(|i| row(json!({ "id": i.to_string(), "amount": 1.0, "source": "Parking Meters" })))
        .collect();
    store.seed("transactions", rows).await;

    let summaries = runtime(&store, &mirror, MemoryRecordSource::new())
        .publish(&"transactions".parse().unwrap(), window())
        .await
        .unwrap();
    assert_eq!(summaries.len(), 1);
    let summary = &summaries[0];
    assert_eq!(summary.fetch_calls, 3);
    assert_eq!(summary.pages, 2);
    assert_eq!(summary.rows_published, 12_500);
    assert_eq!(store.select_calls(), 3);

    let published = mirror.rows("txns-0004").await;
    assert_eq!(published.len(), 12_500);
    assert_eq!(summary.rows_created, 12_500);
    assert_eq!(summary.rows_updated, 0);
    // 10 chunks of 1000 for the first page, 3 for the second
    assert_eq!(mirror.upsert_calls(), 13);
}

#[tokio::test]
async fn record_missing_terminal_is_rejected_and_batch_continues() {
    let store = store();
    let mirror = Arc::new(MemoryMirror::new());
    let records = MemoryRecordSource::new().with_batch(
        "flowbird_payments",
        vec![
            flowbird_payment(42, Some("19001905")),
            flowbird_payment(43, None),
            flowbird_payment(44, Some("19001905")),
        ],
    );

    let summaries = runtime(&store, &mirror, records)
        .ingest(&"flowbird_payments".parse().unwrap(), window())
        .await
        .unwrap();
    let summary = &summaries[0];
    assert_eq!(summary.received, 3);
    assert_eq!(summary.rejected.len(), 1);
    assert_eq!(summary.rejected[0].index, 1);
    assert!(summary.rejected[0].reason.contains("TERMINAL_ID"));
    assert_eq!(summary.upserted, 2);

    assert!(store.get("flowbird_payments_raw", "1905000042").await.is_some());
    assert!(store.get("flowbird_payments_raw", "1905000044").await.is_some());
    assert_eq!(store.rows("flowbird_payments_raw").await.len(), 2);
}

#[tokio::test]
async fn publishing_twice_leaves_the_same_mirror_state() {
    let store = store();
    let mirror = Arc::new(MemoryMirror::new());
    let rows = (1..=30)
        .map(|i| row(json!({ "id": i.to_string(), "invoice_id": 1_000 + i, "match_field": "x-1" })))
        .collect();
    store.seed("flowbird_payments_raw", rows).await;

    let runtime = runtime(&store, &mirror, MemoryRecordSource::new());
    let target: Target = "payments".parse().unwrap();
    runtime.publish(&target, window()).await.unwrap();
    let mut first = mirror.rows("pmts-0003").await;

    let second = runtime.publish(&target, window()).await.unwrap();
    assert_eq!(second[0].rows_created, 0);
    assert_eq!(second[0].rows_updated, 30);
    let mut again = mirror.rows("pmts-0003").await;

    first.sort_by_key(|r| r["id"].as_str().unwrap().to_string());
    again.sort_by_key(|r| r["id"].as_str().unwrap().to_string());
    assert_eq!(first, again);
    assert_eq!(first.len(), 30);
    assert!(first.iter().all(|r| r.get("match_field").is_none()));
}

#[tokio::test]
async fn rerun_never_replaces_or_clears_an_existing_link() {
    let store = store();
    let mirror = Arc::new(MemoryMirror::new());
    store
        .seed(
            "fiserv_reports_raw",
            vec![
                row(json!({ "id": "1-10", "match_field": "x9-10", "transaction_date": "2023-06-01T10:00:00Z", "flowbird_id": null })),
                row(json!({ "id": "1-11", "match_field": "x9-11", "transaction_date": "2023-06-01T11:00:00Z", "flowbird_id": null })),
            ],
        )
        .await;
    store
        .seed(
            "flowbird_payments_raw",
            vec![row(json!({ "id": "300", "match_field": "x9-10", "transaction_date": "2023-06-01T10:30:00Z" }))],
        )
        .await;
    let runtime = runtime(&store, &mirror, MemoryRecordSource::new());

    let first = runtime.reconcile(window()).await.unwrap();
    assert_eq!(first.linked, 1);
    assert_eq!(first.unmatched, 1);

    // a closer vendor row arrives for the already linked settlement, plus one for the other
    store
        .seed(
            "flowbird_payments_raw",
            vec![
                row(json!({ "id": "301", "match_field": "x9-10", "transaction_date": "2023-06-01T10:01:00Z" })),
                row(json!({ "id": "302", "match_field": "x9-11", "transaction_date": "2023-06-01T11:02:00Z" })),
            ],
        )
        .await;
    let second = runtime.reconcile(window()).await.unwrap();
    assert_eq!(second.settlements_considered, 1);
    assert_eq!(second.linked, 1);

    let linked = store.get("fiserv_reports_raw", "1-10").await.unwrap();
    assert_eq!(linked["flowbird_id"], json!("300"));
    let late = store.get("fiserv_reports_raw", "1-11").await.unwrap();
    assert_eq!(late["flowbird_id"], json!("302"));

    let third = runtime.reconcile(window()).await.unwrap();
    assert_eq!(third.settlements_considered, 0);
    assert_eq!(third.linked, 0);
    assert_eq!(
        store.get("fiserv_reports_raw", "1-10").await.unwrap()["flowbird_id"],
        json!("300")
    );
}

#[tokio::test]
async fn unlabelled_meter_rows_are_backfilled_and_reprojected() {
    let store = store();
    let mirror = Arc::new(MemoryMirror::new());
    store
        .seed(
            "flowbird_transactions_raw",
            vec![
                row(json!({ "id": "55", "meter_id": 10000150, "amount": 1.25, "payment_method": "CARD", "location_name": null })),
                row(json!({ "id": "56", "meter_id": 19001905, "amount": 2.0, "location_name": "MoPac Lot" })),
            ],
        )
        .await;

    let summary = runtime(&store, &mirror, MemoryRecordSource::new())
        .backfill_locations()
        .await
        .unwrap();
    assert_eq!(summary.table, "flowbird_transactions_raw");
    assert_eq!(summary.rows_labelled, 1);
    assert_eq!(summary.projected, 1);

    let labelled = store.get("flowbird_transactions_raw", "55").await.unwrap();
    assert_eq!(labelled["location_name"], json!("Core"));
    assert_eq!(labelled["updated_at"], json!(now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true)));

    let combined = store.get("transactions", "55").await.unwrap();
    assert_eq!(combined["source"], json!("Parking Meters"));
    assert_eq!(combined["location_name"], json!("Core"));
    assert_eq!(combined["payment_method"], json!("CARD"));
    assert_eq!(combined["end_time"], Value::Null);
    assert!(store.get("transactions", "56").await.is_none());
}

#[tokio::test]
async fn unknown_targets_are_errors() {
    let store = store();
    let mirror = Arc::new(MemoryMirror::new());
    let runtime = runtime(&store, &mirror, MemoryRecordSource::new());

    let err = runtime
        .ingest(&"smartfolio".parse().unwrap(), window())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("unknown source `smartfolio`"));

    let err = runtime
        .publish(&"citations".parse().unwrap(), window())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("unknown dataset `citations`"));
}

#[tokio::test]
async fn fixtures_flow_from_inbox_to_mirror() {
    let store = store();
    let mirror = Arc::new(MemoryMirror::new());
    let fixtures = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures");
    let runtime = runtime(&store, &mirror, InboxRecordSource::new(fixtures));

    let ingested = runtime.ingest(&Target::All, window()).await.unwrap();
    assert_eq!(ingested.len(), 7);
    for summary in &ingested {
        assert!(summary.rejected.is_empty(), "{}: {:?}", summary.source_id, summary.rejected);
        assert!(summary.upserted > 0, "{} wrote nothing", summary.source_id);
    }

    let reconciled = runtime.reconcile(window()).await.unwrap();
    assert_eq!(reconciled.settlements_considered, 3);
    assert_eq!(reconciled.linked, 2);
    assert_eq!(reconciled.unmatched, 1);
    let settled = store
        .get("fiserv_reports_raw", "812-1905000042")
        .await
        .unwrap();
    assert_eq!(settled["flowbird_id"], json!("1905000042"));

    let published = runtime.publish(&Target::All, window()).await.unwrap();
    assert_eq!(published.len(), 4);
    let fiserv = mirror.rows("fsrv-0001").await;
    assert_eq!(fiserv.len(), 3);
    assert!(fiserv.iter().all(|r| r.get("match_field").is_none()));
    assert!(fiserv
        .iter()
        .all(|r| r["updated_at"] == json!("2023-06-02T12:00:00")));

    let combined = mirror.rows("txns-0004").await;
    let meter_rows = store.rows("flowbird_transactions_raw").await.len();
    let passport_rows = store.rows("passport_transactions_raw").await.len();
    assert_eq!(combined.len(), meter_rows + passport_rows);
    assert!(combined
        .iter()
        .any(|r| r["source"] == json!("Parking Meters")));
}

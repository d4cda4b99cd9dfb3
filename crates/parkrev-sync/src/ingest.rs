use parkrev_adapters::SourceAdapter;
use parkrev_core::{DedupPolicy, KeyedRecord, RawRecord, Row};
use parkrev_storage::UpsertGateway;
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::ProjectionSettings;
use crate::dedup::dedupe;
use crate::SyncError;

/// A raw record that failed mapping or key derivation and was skipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordRejection {
    pub index: usize,
    pub source_id: String,
    pub table: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestSummary {
    pub run_id: Uuid,
    pub source_id: String,
    pub table: String,
    pub received: usize,
    pub filtered: usize,
    pub rejected: Vec<RecordRejection>,
    pub duplicates_dropped: usize,
    pub upserted: usize,
    pub projected: usize,
}

/// Map, key, dedupe and upsert one source's batch.
pub struct IngestJob {
    adapter: Box<dyn SourceAdapter>,
    table: String,
    dedup: DedupPolicy,
    projection: Option<ProjectionSettings>,
    gateway: UpsertGateway,
}

impl IngestJob {
    pub fn new(adapter: Box<dyn SourceAdapter>, gateway: UpsertGateway) -> Self {
        Self {
            table: adapter.default_table().to_string(),
            dedup: adapter.default_dedup(),
            adapter,
            projection: None,
            gateway,
        }
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    pub fn with_dedup(mut self, policy: DedupPolicy) -> Self {
        self.dedup = policy;
        self
    }

    pub fn with_projection(mut self, projection: Option<ProjectionSettings>) -> Self {
        self.projection = projection;
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub async fn run(&self, run_id: Uuid, records: Vec<RawRecord>) -> Result<IngestSummary, SyncError> {
        let source_id = self.adapter.source_id();
        let mut summary = IngestSummary {
            run_id,
            source_id: source_id.to_string(),
            table: self.table.clone(),
            received: records.len(),
            filtered: 0,
            rejected: Vec::new(),
            duplicates_dropped: 0,
            upserted: 0,
            projected: 0,
        };

        let mut keyed = Vec::with_capacity(records.len());
        for (index, raw) in records.iter().enumerate() {
            let derived = self.adapter.normalize(raw).and_then(|record| {
                if self.adapter.accept(&record) {
                    self.adapter.derive_keys(&record).map(Some)
                } else {
                    Ok(None)
                }
            });
            match derived {
                Ok(Some(record)) => keyed.push(record),
                Ok(None) => summary.filtered += 1,
                Err(err) => {
                    warn!(source_id, table = %self.table, index, error = %err, "rejected raw record");
                    summary.rejected.push(RecordRejection {
                        index,
                        source_id: source_id.to_string(),
                        table: self.table.clone(),
                        reason: err.to_string(),
                    });
                }
            }
        }

        let before = keyed.len();
        let keyed = dedupe(self.dedup, keyed);
        summary.duplicates_dropped = before - keyed.len();

        if !keyed.is_empty() {
            let report = self.gateway.upsert_keyed(&self.table, &keyed).await?;
            summary.upserted = report.rows_written;

            if let Some(projection) = &self.projection {
                let rows: Vec<Row> = keyed.iter().map(|r| project(r, projection)).collect();
                let report = self.gateway.upsert(&projection.table, &rows).await?;
                summary.projected = report.rows_written;
            }
        }

        info!(
            source_id,
            table = %self.table,
            received = summary.received,
            filtered = summary.filtered,
            rejected = summary.rejected.len(),
            duplicates = summary.duplicates_dropped,
            upserted = summary.upserted,
            projected = summary.projected,
            "ingest complete"
        );
        Ok(summary)
    }
}

fn project(record: &KeyedRecord, projection: &ProjectionSettings) -> Row {
    project_row(&record.id, &record.row, projection)
}

/// Copy the configured columns; a missing column is written as null.
pub(crate) fn project_row(id: &str, source: &Row, projection: &ProjectionSettings) -> Row {
    let mut row: Row = projection
        .fields
        .iter()
        .map(|field| {
            let value = source.get(field).cloned().unwrap_or(Value::Null);
            (field.clone(), value)
        })
        .collect();
    row.insert(parkrev_core::ID_FIELD.to_string(), Value::String(id.to_string()));
    if let Some(label) = &projection.source_label {
        row.insert("source".to_string(), Value::String(label.clone()));
    }
    row
}

use std::sync::Arc;

use parkrev_core::{row_id, KeyedRecord, Row};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::{OperationalStore, StoreError};

pub const DEFAULT_UPSERT_CHUNK_SIZE: usize = 1000;

/// Create-or-replace writes against the operational store, sent in chunks.
///
/// Not transactional across chunks: a failure leaves earlier chunks committed
/// and reports the ids whose fate is unknown. Re-running the whole batch is safe.
#[derive(Clone)]
pub struct UpsertGateway {
    store: Arc<dyn OperationalStore>,
    chunk_size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpsertReport {
    pub table: String,
    pub rows_written: usize,
    pub chunks: usize,
}

#[derive(Debug, Error)]
#[error(
    "upsert into {table} stopped after {committed} committed rows, {} rows unconfirmed: {source}",
    .uncommitted_ids.len()
)]
pub struct PartialFailure {
    pub table: String,
    pub committed: usize,
    pub uncommitted_ids: Vec<String>,
    #[source]
    pub source: StoreError,
}

impl PartialFailure {
    pub fn is_retryable(&self) -> bool {
        self.source.is_retryable()
    }
}

impl UpsertGateway {
    pub fn new(store: Arc<dyn OperationalStore>, chunk_size: usize) -> Self {
        Self {
            store,
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn store(&self) -> &Arc<dyn OperationalStore> {
        &self.store
    }

    pub async fn upsert(&self, table: &str, rows: &[Row]) -> Result<UpsertReport, PartialFailure> {
        let mut ids = Vec::with_capacity(rows.len());
        for row in rows {
            match row_id(row) {
                Some(id) => ids.push(id),
                None => {
                    return Err(PartialFailure {
                        table: table.to_string(),
                        committed: 0,
                        uncommitted_ids: rows.iter().filter_map(row_id).collect(),
                        source: StoreError::Rejected {
                            target: table.to_string(),
                            status: 400,
                            message: "row has no id".into(),
                            payload: Some(Value::Object(row.clone())),
                        },
                    })
                }
            }
        }

        let mut report = UpsertReport {
            table: table.to_string(),
            rows_written: 0,
            chunks: 0,
        };
        for (index, chunk) in rows.chunks(self.chunk_size).enumerate() {
            if let Err(source) = self.store.upsert(table, chunk).await {
                let committed = report.rows_written;
                warn!(
                    table,
                    chunk = index,
                    committed,
                    retryable = source.is_retryable(),
                    error = %source,
                    "upsert chunk failed"
                );
                return Err(PartialFailure {
                    table: table.to_string(),
                    committed,
                    uncommitted_ids: ids[committed..].to_vec(),
                    source,
                });
            }
            report.rows_written += chunk.len();
            report.chunks += 1;
            debug!(table, chunk = index, rows = chunk.len(), "upsert chunk committed");
        }
        Ok(report)
    }

    pub async fn upsert_keyed(
        &self,
        table: &str,
        records: &[KeyedRecord],
    ) -> Result<UpsertReport, PartialFailure> {
        let rows: Vec<Row> = records.iter().map(|r| r.row.clone()).collect();
        self.upsert(table, &rows).await
    }
}

//! Fills `location_name` on meter transactions stored before their meter had a label.

use std::collections::HashSet;

use parkrev_adapters::{location_name, MeterLocation, UNKNOWN_LOCATION};
use parkrev_core::{parse_int, row_id, value_as_text, Row, ID_FIELD, UPDATED_AT_FIELD};
use parkrev_storage::{RowQuery, UpsertGateway};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::ProjectionSettings;
use crate::ingest::project_row;
use crate::SyncError;

pub const LOCATION_NAME_FIELD: &str = "location_name";
pub const DEFAULT_BACKFILL_PAGE_SIZE: usize = 1_000;

#[derive(Debug, Clone, Serialize)]
pub struct BackfillSummary {
    pub run_id: Uuid,
    pub table: String,
    pub pages: usize,
    pub rows_labelled: usize,
    pub unknown_locations: usize,
    pub projected: usize,
}

/// Repeatedly reads the first page of unlabelled rows, labels them from the
/// meter ranges and writes them back until none remain.
pub struct BackfillJob {
    gateway: UpsertGateway,
    table: String,
    locations: Vec<MeterLocation>,
    projection: Option<ProjectionSettings>,
    page_size: usize,
}

impl BackfillJob {
    pub fn new(gateway: UpsertGateway, table: impl Into<String>, locations: Vec<MeterLocation>) -> Self {
        Self {
            gateway,
            table: table.into(),
            locations,
            projection: None,
            page_size: DEFAULT_BACKFILL_PAGE_SIZE,
        }
    }

    pub fn with_projection(mut self, projection: Option<ProjectionSettings>) -> Self {
        self.projection = projection;
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    fn label(&self, mut row: Row) -> (Row, bool) {
        let meter_id = row
            .get("meter_id")
            .and_then(value_as_text)
            .and_then(|text| parse_int(&text));
        let name = meter_id.map_or(UNKNOWN_LOCATION, |id| location_name(&self.locations, id));
        let known = name != UNKNOWN_LOCATION;
        row.remove(UPDATED_AT_FIELD);
        row.insert(LOCATION_NAME_FIELD.to_string(), Value::String(name.to_string()));
        (row, known)
    }

    pub async fn run(&self, run_id: Uuid) -> Result<BackfillSummary, SyncError> {
        let mut summary = BackfillSummary {
            run_id,
            table: self.table.clone(),
            pages: 0,
            rows_labelled: 0,
            unknown_locations: 0,
            projected: 0,
        };
        // labelled rows leave the filter, so every read starts at offset zero
        let query = RowQuery::table(&self.table)
            .where_null(LOCATION_NAME_FIELD)
            .order_by(ID_FIELD)
            .page(0, self.page_size);
        let mut seen = HashSet::new();

        loop {
            let page = self
                .gateway
                .store()
                .select(&query)
                .await
                .map_err(|source| SyncError::Read {
                    table: self.table.clone(),
                    source,
                })?;
            if page.is_empty() {
                break;
            }

            let mut rows = Vec::with_capacity(page.len());
            for row in page {
                let id = row_id(&row).unwrap_or_default();
                if !seen.insert(id.clone()) {
                    return Err(SyncError::Unchanged {
                        table: self.table.clone(),
                        field: LOCATION_NAME_FIELD,
                        id,
                    });
                }
                let (row, known) = self.label(row);
                if !known {
                    summary.unknown_locations += 1;
                }
                rows.push(row);
            }

            let report = self.gateway.upsert(&self.table, &rows).await?;
            summary.rows_labelled += report.rows_written;
            if let Some(projection) = &self.projection {
                let projected: Vec<Row> = rows
                    .iter()
                    .filter_map(|row| row_id(row).map(|id| project_row(&id, row, projection)))
                    .collect();
                let report = self.gateway.upsert(&projection.table, &projected).await?;
                summary.projected += report.rows_written;
            }
            summary.pages += 1;
            debug!(table = %self.table, rows = rows.len(), total = summary.rows_labelled, "labelled page");
        }

        info!(
            table = %self.table,
            pages = summary.pages,
            labelled = summary.rows_labelled,
            unknown = summary.unknown_locations,
            projected = summary.projected,
            "location backfill complete"
        );
        Ok(summary)
    }
}

//! Windowed, paginated copy of an operational table to the public mirror.
//!
//! Pages are fetched by offset until a page comes back empty. Offsets derive
//! only from completed pages, so a failed run is restarted from offset zero;
//! the mirror upserts by `id`, which makes repeated pages harmless.

use std::fmt;
use std::sync::Arc;

use parkrev_core::{
    format_floating_timestamp, row_id, wall_clock_from_value, Row, TimeWindow, ID_FIELD,
    UPDATED_AT_FIELD,
};
use parkrev_storage::{OperationalStore, PublicMirror, RetryDisposition, RowQuery, StoreError};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::{DatasetSettings, DEFAULT_PAGE_SIZE};

pub const DEFAULT_UPLOAD_CHUNK_SIZE: usize = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SyncPhase {
    Idle,
    Fetching { offset: usize },
    Transforming { offset: usize, rows: usize },
    Uploading { offset: usize, rows: usize },
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::Fetching { offset } => write!(f, "fetching(offset={offset})"),
            Self::Transforming { offset, rows } => write!(f, "transforming(offset={offset}, rows={rows})"),
            Self::Uploading { offset, rows } => write!(f, "uploading(offset={offset}, rows={rows})"),
        }
    }
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("fetching {table} for dataset {dataset} at offset {offset}: {source}")]
    Fetch {
        dataset: String,
        table: String,
        offset: usize,
        #[source]
        source: StoreError,
    },
    #[error("transforming row {id} of {table} for dataset {dataset} at offset {offset}: {message}")]
    Transform {
        dataset: String,
        table: String,
        offset: usize,
        id: String,
        message: String,
    },
    #[error("uploading {table} to dataset {dataset} at offset {offset}: {source}")]
    Upload {
        dataset: String,
        table: String,
        offset: usize,
        #[source]
        source: StoreError,
    },
}

impl PublishError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            Self::Fetch { source, .. } | Self::Upload { source, .. } => source.disposition(),
            Self::Transform { .. } => RetryDisposition::NonRetryable,
        }
    }

    pub fn offset(&self) -> usize {
        match self {
            Self::Fetch { offset, .. } | Self::Transform { offset, .. } | Self::Upload { offset, .. } => *offset,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PublishSummary {
    pub run_id: Uuid,
    pub dataset: String,
    pub table: String,
    pub window: TimeWindow,
    pub fetch_calls: usize,
    pub pages: usize,
    pub rows_published: usize,
    pub rows_created: usize,
    pub rows_updated: usize,
}

/// Why a row could not be made destination-eligible.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformFailure {
    pub id: String,
    pub message: String,
}

/// Drop denied columns (case-insensitive) and render `updated_at` as
/// `YYYY-MM-DDTHH:MM:SS` in the store's own wall-clock time, offset dropped.
pub fn transform_row(mut row: Row, deny_fields: &[String]) -> Result<Row, TransformFailure> {
    row.retain(|column, _| !deny_fields.iter().any(|denied| denied.eq_ignore_ascii_case(column)));
    let stamped = match row.get(UPDATED_AT_FIELD) {
        None | Some(Value::Null) => None,
        Some(value) => Some(wall_clock_from_value(value).ok_or_else(|| TransformFailure {
            id: row_id(&row).unwrap_or_default(),
            message: format!("unparseable updated_at {value}"),
        })?),
    };
    if let Some(stamped) = stamped {
        row.insert(
            UPDATED_AT_FIELD.to_string(),
            Value::String(format_floating_timestamp(stamped)),
        );
    }
    Ok(row)
}

pub fn transform_page(rows: Vec<Row>, deny_fields: &[String]) -> Result<Vec<Row>, TransformFailure> {
    rows.into_iter().map(|row| transform_row(row, deny_fields)).collect()
}

pub type PhaseObserver = Arc<dyn Fn(&SyncPhase) + Send + Sync>;

pub struct PublishJob {
    store: Arc<dyn OperationalStore>,
    mirror: Arc<dyn PublicMirror>,
    page_size: usize,
    upload_chunk_size: usize,
    observer: Option<PhaseObserver>,
}

impl PublishJob {
    pub fn new(store: Arc<dyn OperationalStore>, mirror: Arc<dyn PublicMirror>) -> Self {
        Self {
            store,
            mirror,
            page_size: DEFAULT_PAGE_SIZE,
            upload_chunk_size: DEFAULT_UPLOAD_CHUNK_SIZE,
            observer: None,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn with_upload_chunk_size(mut self, chunk_size: usize) -> Self {
        self.upload_chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_observer(mut self, observer: PhaseObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    fn enter(&self, phase: SyncPhase) {
        debug!(%phase, "publish phase");
        if let Some(observer) = &self.observer {
            observer(&phase);
        }
    }

    pub async fn run(
        &self,
        run_id: Uuid,
        dataset: &DatasetSettings,
        window: TimeWindow,
    ) -> Result<PublishSummary, PublishError> {
        let mut summary = PublishSummary {
            run_id,
            dataset: dataset.name.clone(),
            table: dataset.table.clone(),
            window,
            fetch_calls: 0,
            pages: 0,
            rows_published: 0,
            rows_created: 0,
            rows_updated: 0,
        };
        let mut query = RowQuery::table(&dataset.table)
            .updated_within(window)
            .order_by(&dataset.order_by);
        // offsets are only stable over a total order
        if dataset.order_by != ID_FIELD {
            query = query.order_by(ID_FIELD);
        }

        let mut offset = 0usize;
        loop {
            self.enter(SyncPhase::Fetching { offset });
            let page = self
                .store
                .select(&query.clone().page(offset, self.page_size))
                .await
                .map_err(|source| PublishError::Fetch {
                    dataset: dataset.name.clone(),
                    table: dataset.table.clone(),
                    offset,
                    source,
                })?;
            summary.fetch_calls += 1;
            // only an empty page ends the sync; a short page is followed by one more fetch
            if page.is_empty() {
                break;
            }

            self.enter(SyncPhase::Transforming { offset, rows: page.len() });
            let rows = transform_page(page, &dataset.deny_fields).map_err(|failure| {
                PublishError::Transform {
                    dataset: dataset.name.clone(),
                    table: dataset.table.clone(),
                    offset,
                    id: failure.id,
                    message: failure.message,
                }
            })?;

            self.enter(SyncPhase::Uploading { offset, rows: rows.len() });
            for chunk in rows.chunks(self.upload_chunk_size) {
                let receipt = self
                    .mirror
                    .upsert(&dataset.dataset_id, chunk)
                    .await
                    .map_err(|source| PublishError::Upload {
                        dataset: dataset.name.clone(),
                        table: dataset.table.clone(),
                        offset,
                        source,
                    })?;
                summary.rows_created += receipt.rows_created;
                summary.rows_updated += receipt.rows_updated;
            }

            summary.pages += 1;
            summary.rows_published += rows.len();
            info!(
                dataset = %dataset.name,
                table = %dataset.table,
                offset,
                rows = rows.len(),
                "published page"
            );
            offset += self.page_size;
        }
        self.enter(SyncPhase::Idle);

        info!(
            dataset = %dataset.name,
            table = %dataset.table,
            %window,
            fetch_calls = summary.fetch_calls,
            rows = summary.rows_published,
            "publication complete"
        );
        Ok(summary)
    }
}

//! Operational store + public mirror contracts, HTTP clients and the upsert gateway.

use std::time::Duration;

use async_trait::async_trait;
use parkrev_core::{Row, TimeWindow};
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

mod gateway;
mod http;
mod memory;
mod postgrest;
mod socrata;

pub use gateway::{PartialFailure, UpsertGateway, UpsertReport, DEFAULT_UPSERT_CHUNK_SIZE};
pub use memory::{Clock, InjectedFailure, MemoryMirror, MemoryStore};
pub use postgrest::PostgrestStore;
pub use socrata::SocrataMirror;

pub const CRATE_NAME: &str = "parkrev-storage";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Failure talking to the operational store or the public mirror.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("transient failure talking to {target}: {message}")]
    Transient {
        target: String,
        status: Option<u16>,
        message: String,
    },
    #[error("{target} rejected the request (http {status}): {message}")]
    Rejected {
        target: String,
        status: u16,
        message: String,
        payload: Option<Value>,
    },
    #[error("unexpected response from {target}: {message}")]
    Decode { target: String, message: String },
    #[error("request to {target} could not be sent: {message}")]
    Request { target: String, message: String },
}

impl StoreError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            Self::Transient { .. } => RetryDisposition::Retryable,
            Self::Rejected { .. } | Self::Decode { .. } | Self::Request { .. } => {
                RetryDisposition::NonRetryable
            }
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.disposition() == RetryDisposition::Retryable
    }

    /// Table or dataset the failed call was addressed to.
    pub fn target(&self) -> &str {
        match self {
            Self::Transient { target, .. }
            | Self::Rejected { target, .. }
            | Self::Decode { target, .. }
            | Self::Request { target, .. } => target,
        }
    }

    /// Payload the destination refused, kept for diagnosis.
    pub fn payload(&self) -> Option<&Value> {
        match self {
            Self::Rejected { payload, .. } => payload.as_ref(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Filtered, ordered, paginated read against one table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RowQuery {
    pub table: String,
    pub columns: Option<Vec<String>>,
    pub updated_between: Option<TimeWindow>,
    pub null_fields: Vec<String>,
    pub order_by: Vec<String>,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl RowQuery {
    pub fn table(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            columns: None,
            updated_between: None,
            null_fields: Vec::new(),
            order_by: Vec::new(),
            offset: 0,
            limit: None,
        }
    }

    pub fn columns(mut self, columns: &[&str]) -> Self {
        self.columns = Some(columns.iter().map(|c| c.to_string()).collect());
        self
    }

    pub fn updated_within(mut self, window: TimeWindow) -> Self {
        self.updated_between = Some(window);
        self
    }

    pub fn where_null(mut self, field: impl Into<String>) -> Self {
        self.null_fields.push(field.into());
        self
    }

    pub fn order_by(mut self, field: impl Into<String>) -> Self {
        self.order_by.push(field.into());
        self
    }

    pub fn page(mut self, offset: usize, limit: usize) -> Self {
        self.offset = offset;
        self.limit = Some(limit);
        self
    }
}

/// Counts reported by the mirror for one upsert request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MirrorReceipt {
    pub rows_created: usize,
    pub rows_updated: usize,
}

#[async_trait]
pub trait OperationalStore: Send + Sync {
    async fn select(&self, query: &RowQuery) -> Result<Vec<Row>, StoreError>;

    /// Insert-or-replace by `id`. Every column a row carries is overwritten, nulls
    /// included; columns it omits are left alone. Rows are applied in order and a
    /// failure leaves earlier rows committed.
    async fn upsert(&self, table: &str, rows: &[Row]) -> Result<(), StoreError>;
}

#[async_trait]
pub trait PublicMirror: Send + Sync {
    async fn upsert(&self, dataset_id: &str, rows: &[Row]) -> Result<MirrorReceipt, StoreError>;
}

/// Read every row matching `query`, one page at a time, until a page comes back empty.
pub async fn fetch_all_pages(
    store: &dyn OperationalStore,
    query: RowQuery,
    page_size: usize,
) -> Result<Vec<Row>, StoreError> {
    let page_size = page_size.max(1);
    let mut rows = Vec::new();
    let mut offset = 0usize;
    loop {
        let page = store.select(&query.clone().page(offset, page_size)).await?;
        if page.is_empty() {
            return Ok(rows);
        }
        offset += page_size;
        rows.extend(page);
    }
}

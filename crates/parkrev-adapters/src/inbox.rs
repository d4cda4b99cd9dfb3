use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parkrev_core::{RawRecord, TimeWindow};
use serde_json::Value;
use tracing::debug;

use crate::AdapterError;

/// Supplies raw vendor records for a source.
///
/// The window is the job's window; how a source honours it is up to the source.
#[async_trait]
pub trait RecordSource: Send + Sync {
    async fn fetch(&self, source_id: &str, window: &TimeWindow) -> Result<Vec<RawRecord>, AdapterError>;
}

/// Reads exported batches from `<root>/<source_id>/`.
///
/// `*.json` files hold an array of objects, `*.ndjson` one object per line.
/// Files are read in name order. A missing directory yields no records.
#[derive(Debug, Clone)]
pub struct InboxRecordSource {
    root: PathBuf,
}

impl InboxRecordSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl RecordSource for InboxRecordSource {
    async fn fetch(&self, source_id: &str, window: &TimeWindow) -> Result<Vec<RawRecord>, AdapterError> {
        let dir = self.root.join(source_id);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(AdapterError::Io {
                    path: dir.display().to_string(),
                    source,
                })
            }
        };

        let mut files = Vec::new();
        loop {
            let entry = entries.next_entry().await.map_err(|source| AdapterError::Io {
                path: dir.display().to_string(),
                source,
            })?;
            let Some(entry) = entry else { break };
            let path = entry.path();
            if batch_format(&path).is_some() {
                files.push(path);
            }
        }
        files.sort();

        let mut records = Vec::new();
        for path in &files {
            let batch = load_raw_batch(path).await?;
            debug!(source_id, file = %path.display(), records = batch.len(), %window, "read inbox batch");
            records.extend(batch);
        }
        Ok(records)
    }
}

/// Records held in memory per source, handed out on every fetch.
#[derive(Debug, Clone, Default)]
pub struct MemoryRecordSource {
    batches: BTreeMap<String, Vec<RawRecord>>,
}

impl MemoryRecordSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_batch(mut self, source_id: &str, records: Vec<RawRecord>) -> Self {
        self.batches
            .entry(source_id.to_string())
            .or_default()
            .extend(records);
        self
    }
}

#[async_trait]
impl RecordSource for MemoryRecordSource {
    async fn fetch(&self, source_id: &str, _window: &TimeWindow) -> Result<Vec<RawRecord>, AdapterError> {
        Ok(self.batches.get(source_id).cloned().unwrap_or_default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BatchFormat {
    JsonArray,
    JsonLines,
}

fn batch_format(path: &Path) -> Option<BatchFormat> {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => Some(BatchFormat::JsonArray),
        Some("ndjson") | Some("jsonl") => Some(BatchFormat::JsonLines),
        _ => None,
    }
}

fn parse_error(path: &Path, message: impl Into<String>) -> AdapterError {
    AdapterError::Parse {
        path: path.display().to_string(),
        message: message.into(),
    }
}

fn record_from_value(path: &Path, value: Value) -> Result<RawRecord, AdapterError> {
    match value {
        Value::Object(fields) => Ok(RawRecord::new(fields)),
        other => Err(parse_error(path, format!("expected an object, found {other}"))),
    }
}

/// Read one exported batch file.
pub async fn load_raw_batch(path: &Path) -> Result<Vec<RawRecord>, AdapterError> {
    let format = batch_format(path)
        .ok_or_else(|| parse_error(path, "unsupported batch file extension"))?;
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| AdapterError::Io {
            path: path.display().to_string(),
            source,
        })?;

    match format {
        BatchFormat::JsonArray => {
            let values: Vec<Value> =
                serde_json::from_str(&text).map_err(|err| parse_error(path, err.to_string()))?;
            values
                .into_iter()
                .map(|value| record_from_value(path, value))
                .collect()
        }
        BatchFormat::JsonLines => text
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(idx, line)| {
                let value: Value = serde_json::from_str(line)
                    .map_err(|err| parse_error(path, format!("line {}: {err}", idx + 1)))?;
                record_from_value(path, value)
            })
            .collect(),
    }
}

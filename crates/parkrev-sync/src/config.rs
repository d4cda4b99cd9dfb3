//! `parkrev.yaml` configuration, environment overrides and load-time validation.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use parkrev_adapters::{adapter_for_source, AdapterError, AdapterOptions, IdScheme, MeterLocation};
use parkrev_core::DedupPolicy;
use parkrev_storage::{BackoffPolicy, HttpClientConfig, DEFAULT_UPSERT_CHUNK_SIZE};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_CONFIG_PATH: &str = "parkrev.yaml";
pub const DEFAULT_PAGE_SIZE: usize = 10_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("`{field}` must be greater than zero")]
    ZeroSize { field: &'static str },
    #[error("{what} must not be empty")]
    EmptyIdentifier { what: String },
    #[error("source `{0}` is configured more than once")]
    DuplicateSource(String),
    #[error("dataset `{0}` is configured more than once")]
    DuplicateDataset(String),
    #[error("source `{source_id}`: {source}")]
    Adapter {
        source_id: String,
        #[source]
        source: AdapterError,
    },
    #[error("{0} is not configured")]
    Missing(&'static str),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreSettings {
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MirrorSettings {
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub app_token: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpSettings {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            user_agent: default_user_agent(),
        }
    }
}

impl HttpSettings {
    pub fn client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            backoff: BackoffPolicy {
                max_retries: self.max_retries,
                base_delay: Duration::from_millis(self.base_delay_ms),
                max_delay: Duration::from_millis(self.max_delay_ms),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestSettings {
    #[serde(default = "default_inbox_dir")]
    pub inbox_dir: PathBuf,
    #[serde(default = "default_upsert_chunk_size")]
    pub upsert_chunk_size: usize,
    #[serde(default)]
    pub hash_salt: String,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            inbox_dir: default_inbox_dir(),
            upsert_chunk_size: default_upsert_chunk_size(),
            hash_salt: String::new(),
        }
    }
}

/// Column subset of a source table copied into a combined table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectionSettings {
    pub table: String,
    pub fields: Vec<String>,
    #[serde(default)]
    pub source_label: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSettings {
    pub source_id: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Defaults to the adapter's own table.
    #[serde(default)]
    pub table: Option<String>,
    #[serde(default)]
    pub mapping_revision: Option<String>,
    #[serde(default)]
    pub mapping_path: Option<PathBuf>,
    /// Defaults to the adapter's own policy.
    #[serde(default)]
    pub dedup: Option<DedupPolicy>,
    #[serde(default)]
    pub id_scheme: IdScheme,
    #[serde(default)]
    pub projection: Option<ProjectionSettings>,
}

impl SourceSettings {
    pub fn new(source_id: &str) -> Self {
        Self {
            source_id: source_id.to_string(),
            enabled: true,
            table: None,
            mapping_revision: None,
            mapping_path: None,
            dedup: None,
            id_scheme: IdScheme::default(),
            projection: None,
        }
    }

    fn with_projection(mut self, table: &str, fields: &[&str], source_label: Option<&str>) -> Self {
        self.projection = Some(ProjectionSettings {
            table: table.to_string(),
            fields: fields.iter().map(|f| f.to_string()).collect(),
            source_label: source_label.map(str::to_string),
        });
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileSettings {
    #[serde(default = "default_settlement_table")]
    pub settlement_table: String,
    #[serde(default = "default_vendor_table")]
    pub vendor_table: String,
    #[serde(default = "default_history_start")]
    pub history_start: NaiveDate,
    #[serde(default)]
    pub max_distance_minutes: Option<i64>,
    #[serde(default = "default_page_size")]
    pub read_page_size: usize,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            settlement_table: default_settlement_table(),
            vendor_table: default_vendor_table(),
            history_start: default_history_start(),
            max_distance_minutes: None,
            read_page_size: default_page_size(),
        }
    }
}

impl ReconcileSettings {
    pub fn max_distance(&self) -> Option<chrono::Duration> {
        self.max_distance_minutes.map(chrono::Duration::minutes)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetSettings {
    pub name: String,
    pub table: String,
    #[serde(default)]
    pub dataset_id: String,
    #[serde(default = "default_order_by")]
    pub order_by: String,
    #[serde(default)]
    pub deny_fields: Vec<String>,
}

impl DatasetSettings {
    fn new(name: &str, table: &str, order_by: &str, deny_fields: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            table: table.to_string(),
            dataset_id: String::new(),
            order_by: order_by.to_string(),
            deny_fields: deny_fields.iter().map(|f| f.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishSettings {
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_upload_chunk_size")]
    pub upload_chunk_size: usize,
    #[serde(default = "default_datasets")]
    pub datasets: Vec<DatasetSettings>,
}

impl Default for PublishSettings {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            upload_chunk_size: default_upload_chunk_size(),
            datasets: default_datasets(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub store: StoreSettings,
    #[serde(default)]
    pub mirror: MirrorSettings,
    #[serde(default)]
    pub http: HttpSettings,
    #[serde(default)]
    pub ingest: IngestSettings,
    #[serde(default = "default_sources")]
    pub sources: Vec<SourceSettings>,
    #[serde(default)]
    pub meter_locations: Vec<MeterLocation>,
    #[serde(default)]
    pub reconcile: ReconcileSettings,
    #[serde(default)]
    pub publish: PublishSettings,
}

impl AppConfig {
    /// Read, apply `PARKREV_*` environment overrides and validate.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let mut config = Self::from_yaml(&text).with_context(|| format!("parsing {}", path.display()))?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config
            .validate()
            .with_context(|| format!("validating {}", path.display()))?;
        Ok(config)
    }

    pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(text)
    }

    /// Overlay credentials and endpoints from `lookup` (normally the process environment).
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let set = |slot: &mut String, key: &str| {
            if let Some(value) = lookup(key) {
                *slot = value;
            }
        };
        set(&mut self.store.endpoint, "PARKREV_STORE_ENDPOINT");
        set(&mut self.mirror.domain, "PARKREV_MIRROR_DOMAIN");
        set(&mut self.ingest.hash_salt, "PARKREV_HASH_SALT");

        let set_opt = |slot: &mut Option<String>, key: &str| {
            if let Some(value) = lookup(key) {
                *slot = Some(value);
            }
        };
        set_opt(&mut self.store.token, "PARKREV_STORE_TOKEN");
        set_opt(&mut self.mirror.app_token, "PARKREV_MIRROR_APP_TOKEN");
        set_opt(&mut self.mirror.username, "PARKREV_MIRROR_USERNAME");
        set_opt(&mut self.mirror.password, "PARKREV_MIRROR_PASSWORD");

        for dataset in &mut self.publish.datasets {
            let key = format!("PARKREV_DATASET_{}", dataset.name.to_ascii_uppercase());
            if let Some(value) = lookup(&key) {
                dataset.dataset_id = value;
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("ingest.upsert_chunk_size", self.ingest.upsert_chunk_size),
            ("reconcile.read_page_size", self.reconcile.read_page_size),
            ("publish.page_size", self.publish.page_size),
            ("publish.upload_chunk_size", self.publish.upload_chunk_size),
        ] {
            if value == 0 {
                return Err(ConfigError::ZeroSize { field });
            }
        }

        let mut source_ids = BTreeSet::new();
        for source in &self.sources {
            if !source_ids.insert(source.source_id.as_str()) {
                return Err(ConfigError::DuplicateSource(source.source_id.clone()));
            }
            if source.table.as_deref().is_some_and(|t| t.trim().is_empty()) {
                return Err(ConfigError::EmptyIdentifier {
                    what: format!("table of source `{}`", source.source_id),
                });
            }
            if let Some(projection) = &source.projection {
                if projection.table.trim().is_empty() || projection.fields.is_empty() {
                    return Err(ConfigError::EmptyIdentifier {
                        what: format!("projection of source `{}`", source.source_id),
                    });
                }
            }
            if source.enabled {
                adapter_for_source(&source.source_id, &self.adapter_options(source)).map_err(
                    |err| ConfigError::Adapter {
                        source_id: source.source_id.clone(),
                        source: err,
                    },
                )?;
            }
        }

        for (what, table) in [
            ("reconcile.settlement_table", &self.reconcile.settlement_table),
            ("reconcile.vendor_table", &self.reconcile.vendor_table),
        ] {
            if table.trim().is_empty() {
                return Err(ConfigError::EmptyIdentifier { what: what.to_string() });
            }
        }

        let mut names = BTreeSet::new();
        for dataset in &self.publish.datasets {
            if !names.insert(dataset.name.as_str()) {
                return Err(ConfigError::DuplicateDataset(dataset.name.clone()));
            }
            if dataset.name.trim().is_empty() || dataset.table.trim().is_empty() {
                return Err(ConfigError::EmptyIdentifier {
                    what: format!("name or table of dataset `{}`", dataset.name),
                });
            }
        }
        Ok(())
    }

    pub fn adapter_options(&self, source: &SourceSettings) -> AdapterOptions {
        AdapterOptions {
            hash_salt: self.ingest.hash_salt.clone(),
            meter_locations: self.meter_locations.clone(),
            id_scheme: source.id_scheme,
            mapping_revision: source.mapping_revision.clone(),
            mapping_path: source.mapping_path.clone(),
        }
    }

    pub fn source(&self, source_id: &str) -> Option<&SourceSettings> {
        self.sources.iter().find(|s| s.source_id == source_id)
    }

    pub fn dataset(&self, name: &str) -> Option<&DatasetSettings> {
        self.publish.datasets.iter().find(|d| d.name == name)
    }
}

fn default_true() -> bool {
    true
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_retries() -> usize {
    3
}

fn default_base_delay_ms() -> u64 {
    250
}

fn default_max_delay_ms() -> u64 {
    5_000
}

fn default_user_agent() -> String {
    format!("parkrev/{}", env!("CARGO_PKG_VERSION"))
}

fn default_inbox_dir() -> PathBuf {
    PathBuf::from("./inbox")
}

fn default_upsert_chunk_size() -> usize {
    DEFAULT_UPSERT_CHUNK_SIZE
}

fn default_upload_chunk_size() -> usize {
    1_000
}

fn default_page_size() -> usize {
    DEFAULT_PAGE_SIZE
}

fn default_order_by() -> String {
    "id".to_string()
}

fn default_settlement_table() -> String {
    "fiserv_reports_raw".to_string()
}

fn default_vendor_table() -> String {
    "flowbird_payments_raw".to_string()
}

fn default_history_start() -> NaiveDate {
    NaiveDate::from_ymd_opt(2022, 1, 1).unwrap_or_default()
}

const COMBINED_TABLE: &str = "transactions";

fn default_sources() -> Vec<SourceSettings> {
    vec![
        SourceSettings::new("fiserv"),
        SourceSettings::new("flowbird_payments"),
        SourceSettings::new("flowbird_transactions").with_projection(
            COMBINED_TABLE,
            &[
                "id",
                "payment_method",
                "meter_id",
                "duration_min",
                "start_time",
                "end_time",
                "amount",
                "location_name",
            ],
            Some("Parking Meters"),
        ),
        SourceSettings::new("flowbird_hub_tvm"),
        SourceSettings::new("flowbird_hub_web"),
        SourceSettings::new("flowbird_hub_mobile"),
        SourceSettings::new("passport").with_projection(
            COMBINED_TABLE,
            &[
                "id",
                "payment_method",
                "zone_group",
                "zone_id",
                "duration_min",
                "start_time",
                "end_time",
                "amount",
                "source",
            ],
            None,
        ),
    ]
}

fn default_datasets() -> Vec<DatasetSettings> {
    vec![
        DatasetSettings::new("fiserv", "fiserv_reports_raw", "invoice_id", &["match_field"]),
        DatasetSettings::new("meters", "flowbird_transactions_raw", "id", &[]),
        DatasetSettings::new("payments", "flowbird_payments_raw", "invoice_id", &["match_field"]),
        DatasetSettings::new("transactions", COMBINED_TABLE, "id", &[]),
    ]
}

//! Ingest, reconcile and publish orchestration over the operational store.

mod backfill;
pub mod config;
mod dedup;
mod ingest;
mod publish;
mod reconcile;

use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{NaiveDate, Utc};
use parkrev_adapters::{
    adapter_for_source, AdapterError, InboxRecordSource, RecordSource, SourceAdapter,
};
use parkrev_core::{TimeWindow, WindowDefault};
use parkrev_storage::{
    OperationalStore, PartialFailure, PostgrestStore, PublicMirror, SocrataMirror, StoreError,
    UpsertGateway,
};
use thiserror::Error;
use tracing::{info, info_span, Instrument};
use uuid::Uuid;

pub use backfill::{BackfillJob, BackfillSummary, DEFAULT_BACKFILL_PAGE_SIZE, LOCATION_NAME_FIELD};
pub use config::{AppConfig, ConfigError, DatasetSettings, SourceSettings};
pub use dedup::dedupe;
pub use ingest::{IngestJob, IngestSummary, RecordRejection};
pub use publish::{
    transform_page, transform_row, PhaseObserver, PublishError, PublishJob, PublishSummary,
    SyncPhase, TransformFailure, DEFAULT_UPLOAD_CHUNK_SIZE,
};
pub use reconcile::{reconcile, Exclusion, Link, ReconcileJob, ReconcileSummary, Reconciliation};

pub const CRATE_NAME: &str = "parkrev-sync";

const METER_TRANSACTIONS_SOURCE: &str = "flowbird_transactions";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("fetching raw records for `{source_id}`")]
    Source {
        source_id: String,
        #[source]
        source: AdapterError,
    },
    #[error("reading `{table}`")]
    Read {
        table: String,
        #[source]
        source: StoreError,
    },
    #[error("`{table}` still returns row {id} without `{field}` after it was rewritten")]
    Unchanged {
        table: String,
        field: &'static str,
        id: String,
    },
    #[error(transparent)]
    Write(#[from] PartialFailure),
    #[error(transparent)]
    Publish(#[from] PublishError),
}

/// `all` or a single source id / dataset name.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Target {
    #[default]
    All,
    Named(String),
}

impl Target {
    pub fn matches(&self, name: &str) -> bool {
        match self {
            Target::All => true,
            Target::Named(wanted) => wanted == name,
        }
    }
}

impl FromStr for Target {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim() {
            "" | "all" => Target::All,
            name => Target::Named(name.to_string()),
        })
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::All => f.write_str("all"),
            Target::Named(name) => f.write_str(name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Ingest,
    Reconcile,
    Publish,
}

/// Wires the jobs to their collaborators and the loaded configuration.
pub struct SyncRuntime {
    config: AppConfig,
    store: Arc<dyn OperationalStore>,
    mirror: Arc<dyn PublicMirror>,
    records: Arc<dyn RecordSource>,
}

impl SyncRuntime {
    pub fn new(
        config: AppConfig,
        store: Arc<dyn OperationalStore>,
        mirror: Arc<dyn PublicMirror>,
        records: Arc<dyn RecordSource>,
    ) -> Self {
        Self {
            config,
            store,
            mirror,
            records,
        }
    }

    /// Build the HTTP-backed store and mirror plus the file inbox from `config`.
    pub fn connect(config: AppConfig) -> Result<Self> {
        if config.store.endpoint.trim().is_empty() {
            return Err(ConfigError::Missing("store.endpoint").into());
        }
        if config.mirror.domain.trim().is_empty() {
            return Err(ConfigError::Missing("mirror.domain").into());
        }
        let http = config.http.client_config();
        let store = PostgrestStore::new(&config.store.endpoint, config.store.token.clone(), &http)
            .context("building operational store client")?;
        let mirror = SocrataMirror::new(
            &config.mirror.domain,
            config.mirror.app_token.clone(),
            config.mirror.username.clone(),
            config.mirror.password.clone(),
            &http,
        )
        .context("building public mirror client")?;
        let records = InboxRecordSource::new(&config.ingest.inbox_dir);
        Ok(Self::new(config, Arc::new(store), Arc::new(mirror), Arc::new(records)))
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Resolve CLI dates into a window; a missing start falls back per job kind.
    pub fn window(
        &self,
        kind: JobKind,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    ) -> Result<TimeWindow> {
        let default_start = match kind {
            JobKind::Ingest | JobKind::Publish => WindowDefault::Yesterday,
            JobKind::Reconcile => WindowDefault::Since(self.config.reconcile.history_start),
        };
        Ok(TimeWindow::resolve(start, end, default_start, Utc::now())?)
    }

    fn gateway(&self) -> UpsertGateway {
        UpsertGateway::new(self.store.clone(), self.config.ingest.upsert_chunk_size)
    }

    pub async fn ingest(&self, target: &Target, window: TimeWindow) -> Result<Vec<IngestSummary>> {
        let selected: Vec<&SourceSettings> = self
            .config
            .sources
            .iter()
            .filter(|s| target.matches(&s.source_id))
            .collect();
        if let Target::Named(name) = target {
            match selected.first() {
                None => bail!("unknown source `{name}`"),
                Some(source) if !source.enabled => bail!("source `{name}` is disabled"),
                Some(_) => {}
            }
        }

        let mut summaries = Vec::new();
        for source in selected.into_iter().filter(|s| s.enabled) {
            let run_id = Uuid::new_v4();
            let span = info_span!("ingest", %run_id, source_id = %source.source_id);
            let summary = self
                .ingest_source(run_id, source, window)
                .instrument(span)
                .await
                .with_context(|| format!("ingesting source `{}`", source.source_id))?;
            summaries.push(summary);
        }
        Ok(summaries)
    }

    async fn ingest_source(
        &self,
        run_id: Uuid,
        source: &SourceSettings,
        window: TimeWindow,
    ) -> Result<IngestSummary, SyncError> {
        let source_err = |err| SyncError::Source {
            source_id: source.source_id.clone(),
            source: err,
        };
        let adapter = adapter_for_source(&source.source_id, &self.config.adapter_options(source))
            .map_err(source_err)?;
        let records = self
            .records
            .fetch(&source.source_id, &window)
            .await
            .map_err(source_err)?;
        info!(records = records.len(), %window, "fetched raw records");

        let mut job = IngestJob::new(adapter, self.gateway()).with_projection(source.projection.clone());
        if let Some(table) = &source.table {
            job = job.with_table(table);
        }
        if let Some(policy) = source.dedup {
            job = job.with_dedup(policy);
        }
        job.run(run_id, records).await
    }

    pub async fn reconcile(&self, window: TimeWindow) -> Result<ReconcileSummary> {
        let settings = &self.config.reconcile;
        let run_id = Uuid::new_v4();
        let span = info_span!(
            "reconcile",
            %run_id,
            table = %settings.settlement_table,
            vendor_table = %settings.vendor_table
        );
        ReconcileJob::new(
            self.gateway(),
            &settings.settlement_table,
            &settings.vendor_table,
        )
        .with_page_size(settings.read_page_size)
        .with_max_distance(settings.max_distance())
        .run(run_id, window)
        .instrument(span)
        .await
        .with_context(|| format!("reconciling `{}`", settings.settlement_table))
    }

    /// Label meter transactions that were stored without a `location_name`.
    pub async fn backfill_locations(&self) -> Result<BackfillSummary> {
        let source = self
            .config
            .source(METER_TRANSACTIONS_SOURCE)
            .cloned()
            .unwrap_or_else(|| SourceSettings::new(METER_TRANSACTIONS_SOURCE));
        let table = match &source.table {
            Some(table) => table.clone(),
            None => adapter_for_source(&source.source_id, &self.config.adapter_options(&source))?
                .default_table()
                .to_string(),
        };
        let run_id = Uuid::new_v4();
        let span = info_span!("backfill", %run_id, table = %table);
        BackfillJob::new(self.gateway(), &table, self.config.meter_locations.clone())
            .with_projection(source.projection.clone())
            .run(run_id)
            .instrument(span)
            .await
            .with_context(|| format!("backfilling locations in `{table}`"))
    }

    pub async fn publish(&self, target: &Target, window: TimeWindow) -> Result<Vec<PublishSummary>> {
        let datasets: Vec<&DatasetSettings> = self
            .config
            .publish
            .datasets
            .iter()
            .filter(|d| target.matches(&d.name))
            .collect();
        if let Target::Named(name) = target {
            if datasets.is_empty() {
                bail!("unknown dataset `{name}`");
            }
        }

        let job = PublishJob::new(self.store.clone(), self.mirror.clone())
            .with_page_size(self.config.publish.page_size)
            .with_upload_chunk_size(self.config.publish.upload_chunk_size);
        let mut summaries = Vec::new();
        for dataset in datasets {
            if dataset.dataset_id.trim().is_empty() {
                bail!("dataset `{}` has no dataset_id", dataset.name);
            }
            let run_id = Uuid::new_v4();
            let span = info_span!(
                "publish",
                %run_id,
                dataset = %dataset.name,
                table = %dataset.table
            );
            let summary = job
                .run(run_id, dataset, window)
                .instrument(span)
                .await
                .with_context(|| format!("publishing `{}` to `{}`", dataset.table, dataset.dataset_id))?;
            summaries.push(summary);
        }
        Ok(summaries)
    }
}

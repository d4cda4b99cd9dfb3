use async_trait::async_trait;
use chrono::SecondsFormat;
use parkrev_core::{Row, UPDATED_AT_FIELD};
use serde_json::Value;
use tracing::debug;

use crate::http::{build_client, decode_json, send_with_retry};
use crate::{BackoffPolicy, HttpClientConfig, OperationalStore, RowQuery, StoreError};

/// Operational store reached through a PostgREST endpoint.
#[derive(Debug, Clone)]
pub struct PostgrestStore {
    client: reqwest::Client,
    endpoint: String,
    token: Option<String>,
    backoff: BackoffPolicy,
}

impl PostgrestStore {
    pub fn new(
        endpoint: impl Into<String>,
        token: Option<String>,
        config: &HttpClientConfig,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            client: build_client(config)?,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            token,
            backoff: config.backoff,
        })
    }

    fn resource_url(&self, table: &str) -> String {
        format!("{}/{}", self.endpoint, table)
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }
}

/// PostgREST query-string parameters for a `RowQuery`.
pub(crate) fn query_params(query: &RowQuery) -> Vec<(String, String)> {
    let mut params = Vec::new();
    let select = query
        .columns
        .as_ref()
        .map(|cols| cols.join(","))
        .unwrap_or_else(|| "*".to_string());
    params.push(("select".to_string(), select));

    if let Some(window) = &query.updated_between {
        params.push((
            "and".to_string(),
            format!(
                "({field}.gte.{start},{field}.lte.{end})",
                field = UPDATED_AT_FIELD,
                start = window.start.to_rfc3339_opts(SecondsFormat::Micros, true),
                end = window.end.to_rfc3339_opts(SecondsFormat::Micros, true),
            ),
        ));
    }
    for field in &query.null_fields {
        params.push((field.clone(), "is.null".to_string()));
    }
    if !query.order_by.is_empty() {
        params.push(("order".to_string(), query.order_by.join(",")));
    }
    if query.offset > 0 {
        params.push(("offset".to_string(), query.offset.to_string()));
    }
    if let Some(limit) = query.limit {
        params.push(("limit".to_string(), limit.to_string()));
    }
    params
}

#[async_trait]
impl OperationalStore for PostgrestStore {
    async fn select(&self, query: &RowQuery) -> Result<Vec<Row>, StoreError> {
        let url = self.resource_url(&query.table);
        let params = query_params(query);
        debug!(table = %query.table, offset = query.offset, limit = ?query.limit, "postgrest select");
        let resp = send_with_retry(&self.backoff, &query.table, None, || {
            self.authorized(self.client.get(&url).query(&params))
        })
        .await?;
        decode_json(&query.table, resp).await
    }

    async fn upsert(&self, table: &str, rows: &[Row]) -> Result<(), StoreError> {
        if rows.is_empty() {
            return Ok(());
        }
        let url = self.resource_url(table);
        let payload = Value::Array(rows.iter().cloned().map(Value::Object).collect());
        debug!(table, rows = rows.len(), "postgrest upsert");
        send_with_retry(&self.backoff, table, Some(&payload), || {
            self.authorized(
                self.client
                    .post(&url)
                    .header("Prefer", "resolution=merge-duplicates,return=minimal")
                    .json(&payload),
            )
        })
        .await?;
        Ok(())
    }
}

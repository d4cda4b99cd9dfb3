use async_trait::async_trait;
use parkrev_core::Row;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::http::{build_client, decode_json, send_with_retry};
use crate::{BackoffPolicy, HttpClientConfig, MirrorReceipt, PublicMirror, StoreError};

/// Public mirror hosted on a Socrata (SODA) data portal.
#[derive(Debug, Clone)]
pub struct SocrataMirror {
    client: reqwest::Client,
    domain: String,
    app_token: Option<String>,
    credentials: Option<(String, String)>,
    backoff: BackoffPolicy,
}

/// Body returned by a SODA upsert.
#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct SodaUpsertResponse {
    #[serde(rename = "Rows Created", default)]
    rows_created: usize,
    #[serde(rename = "Rows Updated", default)]
    rows_updated: usize,
    #[serde(rename = "Errors", default)]
    errors: usize,
}

impl SocrataMirror {
    pub fn new(
        domain: impl Into<String>,
        app_token: Option<String>,
        username: Option<String>,
        password: Option<String>,
        config: &HttpClientConfig,
    ) -> anyhow::Result<Self> {
        let domain = domain.into();
        let domain = if domain.starts_with("http://") || domain.starts_with("https://") {
            domain
        } else {
            format!("https://{domain}")
        };
        Ok(Self {
            client: build_client(config)?,
            domain: domain.trim_end_matches('/').to_string(),
            app_token,
            credentials: username.zip(password),
            backoff: config.backoff,
        })
    }

    fn resource_url(&self, dataset_id: &str) -> String {
        format!("{}/resource/{}.json", self.domain, dataset_id)
    }
}

/// Per-row errors reported inside a 200 response are still a refusal.
pub(crate) fn receipt_from_response(
    dataset_id: &str,
    response: SodaUpsertResponse,
    payload: &Value,
) -> Result<MirrorReceipt, StoreError> {
    if response.errors > 0 {
        return Err(StoreError::Rejected {
            target: dataset_id.to_string(),
            status: 200,
            message: format!("{} rows reported errors", response.errors),
            payload: Some(payload.clone()),
        });
    }
    Ok(MirrorReceipt {
        rows_created: response.rows_created,
        rows_updated: response.rows_updated,
    })
}

#[async_trait]
impl PublicMirror for SocrataMirror {
    async fn upsert(&self, dataset_id: &str, rows: &[Row]) -> Result<MirrorReceipt, StoreError> {
        if rows.is_empty() {
            return Ok(MirrorReceipt::default());
        }
        let url = self.resource_url(dataset_id);
        let payload = Value::Array(rows.iter().cloned().map(Value::Object).collect());
        debug!(dataset_id, rows = rows.len(), "socrata upsert");
        let resp = send_with_retry(&self.backoff, dataset_id, Some(&payload), || {
            let mut builder = self.client.post(&url).json(&payload);
            if let Some(token) = &self.app_token {
                builder = builder.header("X-App-Token", token);
            }
            if let Some((user, password)) = &self.credentials {
                builder = builder.basic_auth(user, Some(password));
            }
            builder
        })
        .await?;
        let response: SodaUpsertResponse = decode_json(dataset_id, resp).await?;
        receipt_from_response(dataset_id, response, &payload)
    }
}

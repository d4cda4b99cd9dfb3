use reqwest::{RequestBuilder, Response};
use serde_json::Value;
use tracing::{debug, warn};

use crate::{classify_reqwest_error, classify_status, BackoffPolicy, RetryDisposition, StoreError};

pub(crate) fn build_client(config: &crate::HttpClientConfig) -> anyhow::Result<reqwest::Client> {
    use anyhow::Context;

    let mut builder = reqwest::Client::builder().gzip(true).timeout(config.timeout);
    if let Some(user_agent) = &config.user_agent {
        builder = builder.user_agent(user_agent.clone());
    }
    builder.build().context("building reqwest client")
}

/// Send a request, retrying retryable failures with capped exponential backoff.
///
/// `build` is called once per attempt because a `RequestBuilder` is consumed on send.
/// Non-retryable responses surface as `StoreError::Rejected` carrying `payload`.
pub(crate) async fn send_with_retry<F>(
    backoff: &BackoffPolicy,
    target: &str,
    payload: Option<&Value>,
    build: F,
) -> Result<Response, StoreError>
where
    F: Fn() -> RequestBuilder,
{
    let mut attempt = 0usize;
    loop {
        match build().send().await {
            Ok(resp) => {
                let status = resp.status();
                if status.is_success() {
                    return Ok(resp);
                }

                let disposition = classify_status(status);
                if disposition == RetryDisposition::Retryable && attempt < backoff.max_retries {
                    let delay = backoff.delay_for_attempt(attempt);
                    warn!(target_name = target, status = status.as_u16(), attempt, ?delay, "retrying after http status");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                    continue;
                }

                let body = resp.text().await.unwrap_or_default();
                return Err(match disposition {
                    RetryDisposition::Retryable => StoreError::Transient {
                        target: target.to_string(),
                        status: Some(status.as_u16()),
                        message: body,
                    },
                    RetryDisposition::NonRetryable => StoreError::Rejected {
                        target: target.to_string(),
                        status: status.as_u16(),
                        message: body,
                        payload: payload.cloned(),
                    },
                });
            }
            Err(err) => {
                let disposition = classify_reqwest_error(&err);
                if disposition == RetryDisposition::Retryable && attempt < backoff.max_retries {
                    let delay = backoff.delay_for_attempt(attempt);
                    debug!(target_name = target, attempt, ?delay, error = %err, "retrying after transport error");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                    continue;
                }
                return Err(match disposition {
                    RetryDisposition::Retryable => StoreError::Transient {
                        target: target.to_string(),
                        status: err.status().map(|s| s.as_u16()),
                        message: err.to_string(),
                    },
                    RetryDisposition::NonRetryable => StoreError::Request {
                        target: target.to_string(),
                        message: err.to_string(),
                    },
                });
            }
        }
    }
}

pub(crate) async fn decode_json<T: serde::de::DeserializeOwned>(
    target: &str,
    resp: Response,
) -> Result<T, StoreError> {
    let bytes = resp.bytes().await.map_err(|err| StoreError::Transient {
        target: target.to_string(),
        status: None,
        message: format!("reading response body: {err}"),
    })?;
    serde_json::from_slice(&bytes).map_err(|err| StoreError::Decode {
        target: target.to_string(),
        message: err.to_string(),
    })
}

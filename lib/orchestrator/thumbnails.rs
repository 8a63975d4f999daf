use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::warn;

use crate::accounts::Account;
use crate::redaction::redact_secrets;

#[derive(Error, Debug)]
pub enum ThumbnailWarmError {
    #[error("thumbnail warm request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("thumbnail warm endpoint answered {0}")]
    Status(u16),
}

/// External thumbnail proxy. Warming is fire-and-forget from the caller's point of view.
pub trait ThumbnailWarmer: Send + Sync {
    /// Returns how many thumbnails the proxy reported warming.
    fn warm<'a>(&'a self, account: &'a Account) -> BoxFuture<'a, Result<u64, ThumbnailWarmError>>;
}

impl<T> ThumbnailWarmer for Arc<T>
where
    T: ThumbnailWarmer + ?Sized,
{
    fn warm<'a>(&'a self, account: &'a Account) -> BoxFuture<'a, Result<u64, ThumbnailWarmError>> {
        (**self).warm(account)
    }
}

pub struct HttpThumbnailWarmer {
    client: reqwest::Client,
    url: String,
}

impl HttpThumbnailWarmer {
    pub fn new(url: &str, request_timeout: Duration) -> Result<Self, ThumbnailWarmError> {
        let client = reqwest::Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

impl ThumbnailWarmer for HttpThumbnailWarmer {
    fn warm<'a>(&'a self, account: &'a Account) -> BoxFuture<'a, Result<u64, ThumbnailWarmError>> {
        Box::pin(async move {
            let response = self
                .client
                .post(&self.url)
                .json(&json!({
                    "ig_user_id": account.platform_user_id,
                    "owner_user_id": account.owner_user_id,
                }))
                .send()
                .await
                .map_err(|err| ThumbnailWarmError::Request(err.without_url()))?;

            let status = response.status();
            if !status.is_success() {
                return Err(ThumbnailWarmError::Status(status.as_u16()));
            }
            let body = response
                .bytes()
                .await
                .map_err(|err| ThumbnailWarmError::Request(err.without_url()))?;
            Ok(warmed_count(&body))
        })
    }
}

/// Reads `warmed` from the proxy's reply. An undecodable body counts as zero warmed.
fn warmed_count(body: &[u8]) -> u64 {
    match serde_json::from_slice::<Value>(body) {
        Ok(body) => body.get("warmed").and_then(Value::as_u64).unwrap_or(0),
        Err(err) => {
            warn!(
                event = "thumbnail_warm_body_undecodable",
                error = %redact_secrets(&err.to_string()),
                body = %redact_secrets(&String::from_utf8_lossy(&body[..body.len().min(200)])),
                "thumbnail proxy returned a non-JSON body"
            );
            0
        }
    }
}

/// Used when no thumbnail proxy is configured.
pub struct NoopThumbnailWarmer;

impl ThumbnailWarmer for NoopThumbnailWarmer {
    fn warm<'a>(&'a self, _account: &'a Account) -> BoxFuture<'a, Result<u64, ThumbnailWarmError>> {
        Box::pin(async { Ok(0) })
    }
}

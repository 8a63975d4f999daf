use reqwest::header::RETRY_AFTER;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::redaction::{redact_secrets, redact_token};

/// Thin typed client for the upstream Graph API.
///
/// Every response body is decoded into `Value` first so API errors delivered with a 200 status
/// are still surfaced as [`GraphClientErr::Api`].
pub struct GraphClient {
    client: reqwest::Client,
    base_url: String,
    api_version: String,
}

/// One `insights` call. `since`/`until` are unix seconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsightsQuery<'a> {
    pub ig_user_id: &'a str,
    pub metrics: &'a [&'a str],
    /// `Some("total_value")` for the totals family, `None` for day series.
    pub metric_type: Option<&'a str>,
    pub since: i64,
    pub until: i64,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct InsightsEnvelope {
    #[serde(default)]
    pub data: Vec<RawMetric>,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct RawMetric {
    pub name: String,
    #[serde(default)]
    pub period: Option<String>,
    #[serde(default)]
    pub values: Option<Vec<RawValue>>,
    #[serde(default)]
    pub total_value: Option<RawTotal>,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct RawValue {
    #[serde(default)]
    pub end_time: Option<String>,
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(default)]
    pub total_value: Option<RawTotal>,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct RawTotal {
    #[serde(default)]
    pub value: Option<Value>,
}

#[derive(Deserialize, Debug, Clone, Default)]
struct GraphApiError {
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    error_subcode: Option<i64>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Error, Debug)]
pub enum GraphClientErr {
    #[error("graph error on {resource} (status {status}, code {code:?}, subcode {subcode:?}): {message}")]
    Api {
        resource: String,
        status: u16,
        code: Option<i64>,
        subcode: Option<i64>,
        message: String,
        retry_after_secs: Option<u64>,
    },
    #[error("unexpected HTTP status while fetching {resource}: {status}")]
    UnexpectedStatus {
        resource: String,
        status: u16,
        retry_after_secs: Option<u64>,
    },
    #[error("parse error: {0}")]
    ParseError(String),
    #[error(transparent)]
    JsonParseError(#[from] serde_json::Error),
    #[error(transparent)]
    RequestError(#[from] reqwest::Error),
}

impl GraphClient {
    pub fn new(
        base_url: &str,
        api_version: &str,
        request_timeout: Duration,
    ) -> Result<Self, GraphClientErr> {
        let client = reqwest::Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_version: api_version.trim_matches('/').to_string(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}/{}", self.base_url, self.api_version, path)
    }

    /// Fetches one insights window for `query`.
    pub async fn get_insights(
        &self,
        query: &InsightsQuery<'_>,
        token: &str,
    ) -> Result<InsightsEnvelope, GraphClientErr> {
        let mut params = vec![
            ("metric", query.metrics.join(",")),
            ("period", "day".to_string()),
            ("since", query.since.to_string()),
            ("until", query.until.to_string()),
            ("access_token", token.to_string()),
        ];
        if let Some(metric_type) = query.metric_type {
            params.push(("metric_type", metric_type.to_string()));
        }

        let resource = format!("insights for {}", query.ig_user_id);
        let body = self
            .get_json(&format!("{}/insights", query.ig_user_id), &params, &resource, token)
            .await?;
        Ok(serde_json::from_value(body)?)
    }

    /// Exchanges a user-level token for the page-scoped token of `page_id`.
    pub async fn get_page_access_token(
        &self,
        page_id: &str,
        user_token: &str,
    ) -> Result<String, GraphClientErr> {
        let params = vec![
            ("fields", "access_token".to_string()),
            ("access_token", user_token.to_string()),
        ];
        let resource = format!("page token for {page_id}");
        let body = self.get_json(page_id, &params, &resource, user_token).await?;

        body.get("access_token")
            .and_then(Value::as_str)
            .filter(|token| !token.is_empty())
            .map(str::to_string)
            .ok_or_else(|| {
                GraphClientErr::ParseError(format!("{resource}: response carried no access_token"))
            })
    }

    /// Returns the raw `followers_count` field for an account, if present.
    pub async fn get_followers_count(
        &self,
        ig_user_id: &str,
        token: &str,
    ) -> Result<Option<Value>, GraphClientErr> {
        let params = vec![
            ("fields", "followers_count".to_string()),
            ("access_token", token.to_string()),
        ];
        let resource = format!("profile for {ig_user_id}");
        let body = self.get_json(ig_user_id, &params, &resource, token).await?;
        Ok(body.get("followers_count").cloned())
    }

    async fn get_json(
        &self,
        path: &str,
        params: &[(&str, String)],
        resource: &str,
        token: &str,
    ) -> Result<Value, GraphClientErr> {
        let url = self.endpoint(path);
        let response = self
            .client
            .get(&url)
            .query(params)
            .send()
            .await
            .map_err(|err| GraphClientErr::RequestError(err.without_url()))?;

        let status = response.status();
        let retry_after_secs = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok());
        let text = response
            .text()
            .await
            .map_err(|err| GraphClientErr::RequestError(err.without_url()))?;

        debug!(
            event = "graph_response",
            path = %redact_secrets(path),
            status = status.as_u16(),
            bytes = text.len(),
            "graph call finished"
        );

        let parsed = serde_json::from_str::<Value>(&text).ok();
        if let Some(error) = parsed.as_ref().and_then(|body| body.get("error")) {
            let api_error: GraphApiError =
                serde_json::from_value(error.clone()).unwrap_or_default();
            return Err(GraphClientErr::Api {
                resource: resource.to_string(),
                status: status.as_u16(),
                code: api_error.code,
                subcode: api_error.error_subcode,
                message: redact_token(
                    api_error.message.as_deref().unwrap_or("unknown graph error"),
                    token,
                ),
                retry_after_secs,
            });
        }

        if !status.is_success() {
            return Err(GraphClientErr::UnexpectedStatus {
                resource: resource.to_string(),
                status: status.as_u16(),
                retry_after_secs,
            });
        }

        parsed.ok_or_else(|| {
            GraphClientErr::ParseError(format!("{resource}: response body is not JSON"))
        })
    }
}

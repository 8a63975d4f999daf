use std::time::Duration;

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use thiserror::Error;

use crate::db::StoreError;
use crate::insights::{FetchError, FetchErrorKind};
use crate::redaction::redact_secrets;
use crate::snapshots::ReconcileError;

/// Caller-facing failure with a stable string code.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    #[error("no access token available for this request")]
    MissingToken,
    #[error("no matching instagram account")]
    AccountNotFound,
    #[error("unknown action: {0}")]
    InvalidAction(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("cron secret missing or invalid")]
    UnauthorizedCron,
    #[error("upstream rate limited: {message}")]
    UpstreamRateLimited {
        retry_after: Duration,
        message: String,
    },
    #[error("upstream timed out: {0}")]
    UpstreamTimeout(String),
    #[error("upstream request failed: {0}")]
    UpstreamFailed(String),
    #[error("store failure: {0}")]
    StoreFailed(String),
}

impl ApiError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingToken => "missing_token",
            Self::AccountNotFound => "account_not_found",
            Self::InvalidAction(_) => "invalid_action",
            Self::InvalidRequest(_) => "invalid_request",
            Self::UnauthorizedCron => "unauthorized_cron",
            Self::UpstreamRateLimited { .. } => "upstream_rate_limited",
            Self::UpstreamTimeout(_) => "upstream_timeout",
            Self::UpstreamFailed(_) => "upstream_failed",
            Self::StoreFailed(_) => "store_failed",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::MissingToken | Self::UnauthorizedCron => StatusCode::UNAUTHORIZED,
            Self::AccountNotFound => StatusCode::NOT_FOUND,
            Self::InvalidAction(_) | Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::UpstreamRateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::UpstreamFailed(_) => StatusCode::BAD_GATEWAY,
            Self::StoreFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::UpstreamRateLimited { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    /// JSON body; the message is scrubbed of anything token-shaped.
    pub fn body(&self) -> Value {
        let mut body = json!({
            "ok": false,
            "error": self.code(),
            "message": redact_secrets(&self.to_string()),
        });
        if let Some(retry_after) = self.retry_after() {
            body["retry_after"] = json!(retry_after.as_secs());
        }
        body
    }
}

impl From<FetchError> for ApiError {
    fn from(err: FetchError) -> Self {
        match err.kind {
            FetchErrorKind::RateLimited => Self::UpstreamRateLimited {
                retry_after: err
                    .retry_after
                    .unwrap_or(crate::insights::error_mapping::DEFAULT_RATE_LIMIT_BACKOFF),
                message: err.message,
            },
            FetchErrorKind::Timeout => Self::UpstreamTimeout(err.message),
            _ => Self::UpstreamFailed(err.to_string()),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        Self::StoreFailed(err.to_string())
    }
}

impl From<ReconcileError> for ApiError {
    fn from(err: ReconcileError) -> Self {
        match err {
            ReconcileError::Upstream(err) => err.into(),
            ReconcileError::Store(err) => err.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response = (self.status(), Json(self.body())).into_response();
        if let Some(retry_after) = self.retry_after() {
            if let Ok(value) = HeaderValue::from_str(&retry_after.as_secs().to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

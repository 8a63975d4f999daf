use chrono::{DateTime, Utc};
use std::time::Duration;

use super::window::DayWindow;

/// Upstream limit on `until - since` for one insights call.
pub const MAX_WINDOW_DAYS: i64 = 30;

pub const SERIES_METRICS: &[&str] = &["reach", "views"];
pub const SERIES_FALLBACK_METRICS: &[&str] = &["reach"];
pub const TOTALS_METRICS: &[&str] = &["total_interactions", "accounts_engaged", "profile_views"];
pub const TOTALS_FALLBACK_METRICS: &[&str] = &["total_interactions", "accounts_engaged"];

/// The two upstream parameter shapes for insights calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricFamily {
    /// `period=day`, one value per day.
    Series,
    /// `metric_type=total_value`, one aggregate per window.
    Totals,
}

impl MetricFamily {
    pub fn metric_type(self) -> Option<&'static str> {
        match self {
            Self::Series => None,
            Self::Totals => Some("total_value"),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Series => "series",
            Self::Totals => "totals",
        }
    }
}

/// One low-level upstream call: a single window, a single metric list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricRequest<'a> {
    pub ig_user_id: &'a str,
    pub token: &'a str,
    pub metrics: &'a [&'a str],
    pub family: MetricFamily,
    pub window: DayWindow,
}

/// A normalized upstream value. `value` is `None` when upstream sent nothing usable.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricPoint {
    pub end_time: DateTime<Utc>,
    pub value: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricSeries {
    pub name: String,
    pub points: Vec<MetricPoint>,
}

/// Window total for one metric. `None` means upstream could not provide it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricTotal {
    pub name: String,
    pub value: Option<i64>,
}

/// Page-scoped credentials for one account, resolved once per operation.
#[derive(Clone, PartialEq, Eq)]
pub struct GraphSession {
    pub ig_user_id: String,
    pub token: String,
}

impl std::fmt::Debug for GraphSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphSession")
            .field("ig_user_id", &self.ig_user_id)
            .field("token", &crate::redaction::REDACTED)
            .finish()
    }
}

/// Normalized upstream failure classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchErrorKind {
    Network,
    Timeout,
    RateLimited,
    UnsupportedMetric,
    Unauthorized,
    UpstreamUnavailable,
    MalformedResponse,
    Other,
}

impl FetchErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Timeout => "timeout",
            Self::RateLimited => "rate_limited",
            Self::UnsupportedMetric => "unsupported_metric",
            Self::Unauthorized => "unauthorized",
            Self::UpstreamUnavailable => "upstream_unavailable",
            Self::MalformedResponse => "malformed_response",
            Self::Other => "other",
        }
    }
}

/// Typed upstream failure. `message` is always token-free.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchError {
    pub kind: FetchErrorKind,
    pub message: String,
    pub retry_after: Option<Duration>,
}

impl FetchError {
    pub fn new(kind: FetchErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn with_retry_after(mut self, retry_after: Option<Duration>) -> Self {
        self.retry_after = retry_after;
        self
    }

    /// Transient failures the retry runner may repeat within one logical call.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            FetchErrorKind::Network | FetchErrorKind::UpstreamUnavailable
        )
    }

    pub fn is_rate_limited(&self) -> bool {
        self.kind == FetchErrorKind::RateLimited
    }
}

impl std::fmt::Display for FetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

impl std::error::Error for FetchError {}

/// Configures micro retry behavior for transient upstream failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first attempt.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(2),
            jitter: Duration::from_millis(50),
        }
    }
}

use std::time::Duration;

use crate::graph_client::GraphClientErr;
use crate::redaction::redact_secrets;

use super::types::{FetchError, FetchErrorKind};

/// Graph error codes that signal throttling (app, user, page and BUC limits).
const RATE_LIMIT_CODES: &[i64] = &[4, 17, 32, 613, 80001, 80002, 80004, 80005, 80006];
const RATE_LIMIT_SUBCODES: &[i64] = &[2446079];
const RATE_LIMIT_PHRASES: &[&str] = &["rate limit", "too many", "reduce"];

const INVALID_TOKEN_CODES: &[i64] = &[102, 190];

const UNSUPPORTED_METRIC_CODE: i64 = 100;
const UNSUPPORTED_METRIC_PHRASES: &[&str] = &["unsupported", "invalid", "metric"];

/// Default backoff hint when a rate-limited response carries no `Retry-After`.
pub const DEFAULT_RATE_LIMIT_BACKOFF: Duration = Duration::from_secs(60);

pub fn map_graph_error(error: GraphClientErr) -> FetchError {
    match error {
        GraphClientErr::Api {
            resource,
            status,
            code,
            subcode,
            message,
            retry_after_secs,
        } => classify_api_error(&resource, status, code, subcode, &message, retry_after_secs),
        GraphClientErr::UnexpectedStatus {
            resource,
            status,
            retry_after_secs,
        } => map_status(&resource, status, retry_after_secs),
        GraphClientErr::RequestError(req_err) => {
            if req_err.is_timeout() {
                return FetchError::new(
                    FetchErrorKind::Timeout,
                    format!("upstream timeout: {}", redact_secrets(&req_err.to_string())),
                );
            }
            if let Some(status) = req_err.status() {
                return map_status("graph request", status.as_u16(), None);
            }
            if req_err.is_decode() {
                return FetchError::new(
                    FetchErrorKind::MalformedResponse,
                    format!("undecodable graph response: {}", redact_secrets(&req_err.to_string())),
                );
            }
            FetchError::new(
                FetchErrorKind::Network,
                format!("network/transport error: {}", redact_secrets(&req_err.to_string())),
            )
        }
        GraphClientErr::JsonParseError(err) => FetchError::new(
            FetchErrorKind::MalformedResponse,
            format!("graph payload did not match the expected shape: {err}"),
        ),
        GraphClientErr::ParseError(message) => FetchError::new(
            FetchErrorKind::MalformedResponse,
            redact_secrets(&message),
        ),
    }
}

/// Classifies a structured Graph error.
///
/// Order matters: throttling wins over everything, then token problems (whose messages also
/// contain "invalid"), then metric rejections, then the HTTP status class.
pub fn classify_api_error(
    resource: &str,
    status: u16,
    code: Option<i64>,
    subcode: Option<i64>,
    message: &str,
    retry_after_secs: Option<u64>,
) -> FetchError {
    let lowered = message.to_ascii_lowercase();
    let detail = format!(
        "{resource}: {} (status {status}, code {}, subcode {})",
        redact_secrets(message),
        code.map_or_else(|| "-".to_string(), |c| c.to_string()),
        subcode.map_or_else(|| "-".to_string(), |c| c.to_string()),
    );

    let rate_limited = status == 429
        || code.is_some_and(|c| RATE_LIMIT_CODES.contains(&c))
        || subcode.is_some_and(|c| RATE_LIMIT_SUBCODES.contains(&c))
        || RATE_LIMIT_PHRASES.iter().any(|p| lowered.contains(p));
    if rate_limited {
        return FetchError::new(FetchErrorKind::RateLimited, detail).with_retry_after(Some(
            retry_after_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_RATE_LIMIT_BACKOFF),
        ));
    }

    if status == 401 || code.is_some_and(|c| INVALID_TOKEN_CODES.contains(&c)) {
        return FetchError::new(FetchErrorKind::Unauthorized, detail);
    }

    if code == Some(UNSUPPORTED_METRIC_CODE)
        || UNSUPPORTED_METRIC_PHRASES.iter().any(|p| lowered.contains(p))
    {
        return FetchError::new(FetchErrorKind::UnsupportedMetric, detail);
    }

    let mut mapped = map_status(resource, status, retry_after_secs);
    mapped.message = detail;
    mapped
}

fn map_status(resource: &str, status: u16, retry_after_secs: Option<u64>) -> FetchError {
    match status {
        429 => FetchError::new(
            FetchErrorKind::RateLimited,
            format!("rate limited while fetching {resource}"),
        )
        .with_retry_after(Some(
            retry_after_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_RATE_LIMIT_BACKOFF),
        )),
        401 | 403 => FetchError::new(
            FetchErrorKind::Unauthorized,
            format!("unauthorized ({status}) while fetching {resource}"),
        ),
        400..=499 => FetchError::new(
            FetchErrorKind::Other,
            format!("upstream client error {status} while fetching {resource}"),
        ),
        500..=599 => FetchError::new(
            FetchErrorKind::UpstreamUnavailable,
            format!("upstream server error {status} while fetching {resource}"),
        ),
        _ => FetchError::new(
            FetchErrorKind::Other,
            format!("unexpected HTTP status {status} while fetching {resource}"),
        ),
    }
}

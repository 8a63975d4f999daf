use std::collections::HashMap;

use axum::http::{header, HeaderMap};
use cookie::Cookie;
use sha2::{Digest, Sha256};

use super::error::ApiError;

pub const OWNER_COOKIE: &str = "app_user_id";
pub const ACCOUNT_COOKIE: &str = "ig_account_id";
pub const TOKEN_COOKIE: &str = "ig_access_token";
pub const CRON_SECRET_HEADER: &str = "x-cron-secret";

/// Where a request's upstream credential came from. Resolved once per request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    Cron,
    Session,
    Env,
}

impl CredentialSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cron => "cron",
            Self::Session => "session",
            Self::Env => "env",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CredentialConfig {
    pub cron_secret: Option<String>,
    pub env_access_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCredential {
    pub source: CredentialSource,
    pub token: String,
}

/// Caller identity as carried by the session layer's cookies.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallerCookies {
    pub values: HashMap<String, String>,
}

impl CallerCookies {
    /// Parses every `Cookie` header. Values are percent-decoded and unquoted; empty ones dropped.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let values = headers
            .get_all(header::COOKIE)
            .iter()
            .filter_map(|raw| raw.to_str().ok())
            .flat_map(Cookie::split_parse_encoded)
            .filter_map(Result::ok)
            .filter(|cookie| !cookie.value_trimmed().is_empty())
            .map(|cookie| (cookie.name().to_string(), cookie.value_trimmed().to_string()))
            .collect();
        Self { values }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    pub fn owner_user_id(&self) -> Option<&str> {
        self.get(OWNER_COOKIE)
    }

    pub fn ig_account_id(&self) -> Option<&str> {
        self.get(ACCOUNT_COOKIE)
    }

    pub fn access_token(&self) -> Option<&str> {
        self.get(TOKEN_COOKIE)
    }
}

fn presented_cron_secret(headers: &HeaderMap) -> Option<&str> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim);
    bearer.or_else(|| {
        headers
            .get(CRON_SECRET_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
    })
}

/// Compares SHA-256 digests of both values.
fn secrets_match(presented: &str, expected: &str) -> bool {
    Sha256::digest(presented.as_bytes()) == Sha256::digest(expected.as_bytes())
}

/// True when the request carries the configured cron secret. Always false when none is set.
pub fn is_cron_request(headers: &HeaderMap, config: &CredentialConfig) -> bool {
    match (presented_cron_secret(headers), config.cron_secret.as_deref()) {
        (Some(presented), Some(expected)) if !expected.is_empty() => {
            secrets_match(presented, expected)
        }
        _ => false,
    }
}

/// Cron first, then the session cookie, then the environment token.
pub fn resolve_credential(
    headers: &HeaderMap,
    cookies: &CallerCookies,
    config: &CredentialConfig,
) -> Result<ResolvedCredential, ApiError> {
    let env_token = config
        .env_access_token
        .as_deref()
        .filter(|token| !token.is_empty());

    if is_cron_request(headers, config) {
        return env_token
            .map(|token| ResolvedCredential {
                source: CredentialSource::Cron,
                token: token.to_string(),
            })
            .ok_or(ApiError::MissingToken);
    }
    if let Some(token) = cookies.access_token() {
        return Ok(ResolvedCredential {
            source: CredentialSource::Session,
            token: token.to_string(),
        });
    }
    env_token
        .map(|token| ResolvedCredential {
            source: CredentialSource::Env,
            token: token.to_string(),
        })
        .ok_or(ApiError::MissingToken)
}

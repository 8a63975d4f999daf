use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {name}: {value}")]
    InvalidValue { name: String, value: String },
}

/// Account used by the environment and cron credential modes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvAccount {
    pub ig_user_id: String,
    pub page_id: String,
    pub owner_user_id: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub db_url: String,
    /// Upstream base URL, without version segment.
    pub graph_api_url: String,
    pub graph_api_version: String,
    /// Per upstream HTTP call. Default: 10s
    pub graph_request_timeout: Duration,
    /// Process-wide upstream request budget. Default: 20/s
    pub graph_rps: u32,
    pub env_access_token: Option<String>,
    pub env_account: Option<EnvAccount>,
    pub cron_secret: Option<String>,
    pub token_fingerprint_salt: String,
    pub cache_success_ttl: Duration,
    pub cache_rate_limited_ttl: Duration,
    pub cache_max_entries: usize,
    pub prewarm_task_timeout: Duration,
    pub prewarm_cooldown: Duration,
    pub repair_cooldown: Duration,
    pub thumbnail_lock_stale_after: Duration,
    pub thumbnail_warm_url: Option<String>,
    pub bind_addr: SocketAddr,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let db_url = env::var("DATABASE_URL")
            .map_err(|_| ConfigError::MissingEnvVar("DATABASE_URL".to_string()))?;

        let env_account = match (optional_var("IG_USER_ID"), optional_var("IG_PAGE_ID")) {
            (Some(ig_user_id), page_id) => Some(EnvAccount {
                ig_user_id,
                page_id: page_id.unwrap_or_default(),
                owner_user_id: optional_var("IG_OWNER_USER_ID")
                    .unwrap_or_else(|| "env".to_string()),
            }),
            (None, _) => None,
        };

        Ok(Self {
            db_url,
            graph_api_url: env::var("GRAPH_API_URL")
                .unwrap_or_else(|_| "https://graph.facebook.com".to_string()),
            graph_api_version: env::var("GRAPH_API_VERSION").unwrap_or_else(|_| "v21.0".to_string()),
            graph_request_timeout: Duration::from_millis(parse_var(
                "GRAPH_REQUEST_TIMEOUT_MS",
                10_000u64,
            )?),
            graph_rps: parse_var("GRAPH_RPS", 20u32)?.max(1),
            env_access_token: optional_var("IG_ACCESS_TOKEN"),
            env_account,
            cron_secret: optional_var("CRON_SECRET"),
            token_fingerprint_salt: env::var("TOKEN_FINGERPRINT_SALT")
                .unwrap_or_else(|_| "insights-worker".to_string()),
            cache_success_ttl: Duration::from_secs(parse_var("SNAPSHOT_CACHE_TTL_SECS", 30u64)?),
            cache_rate_limited_ttl: Duration::from_secs(parse_var(
                "SNAPSHOT_RATE_LIMITED_TTL_SECS",
                10u64,
            )?),
            cache_max_entries: parse_var("SNAPSHOT_CACHE_MAX_ENTRIES", 500usize)?.max(1),
            prewarm_task_timeout: Duration::from_millis(parse_var(
                "PREWARM_TASK_TIMEOUT_MS",
                700u64,
            )?),
            prewarm_cooldown: Duration::from_secs(parse_var("PREWARM_COOLDOWN_SECS", 120u64)?),
            repair_cooldown: Duration::from_secs(parse_var("REPAIR_COOLDOWN_SECS", 60u64)?),
            thumbnail_lock_stale_after: Duration::from_secs(parse_var(
                "THUMBNAIL_LOCK_STALE_SECS",
                600u64,
            )?),
            thumbnail_warm_url: optional_var("THUMBNAIL_WARM_URL"),
            bind_addr: parse_var("BIND_ADDR", SocketAddr::from(([0, 0, 0, 0], 3000)))?,
        })
    }
}

/// Empty values are treated as unset.
fn optional_var(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_var<T: FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match optional_var(name) {
        Some(raw) => parse_value(name, &raw),
        None => Ok(default),
    }
}

fn parse_value<T: FromStr>(name: &str, raw: &str) -> Result<T, ConfigError> {
    raw.parse::<T>().map_err(|_| ConfigError::InvalidValue {
        name: name.to_string(),
        value: raw.to_string(),
    })
}

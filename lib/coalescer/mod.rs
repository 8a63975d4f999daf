pub mod key;
pub mod snapshot;

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use moka::future::Cache;
use moka::Expiry;
use sha2::{Digest, Sha256};
use tracing::{debug, error};

use crate::server::monitoring::INSIGHTS_METRICS;
pub use key::{token_fingerprint, CacheKey};
pub use snapshot::CachedSnapshotReader;

/// Outcome class of a computed response. Only `Success` and `RateLimited` are cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    Success,
    RateLimited { retry_after: Duration },
    Failed { status: u16 },
}

impl ResponseKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::RateLimited { .. } => "rate_limited",
            Self::Failed { .. } => "failed",
        }
    }
}

/// A rendered response body with its validator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputedResponse {
    pub kind: ResponseKind,
    pub body: Arc<str>,
    pub etag: String,
}

impl ComputedResponse {
    pub fn new(kind: ResponseKind, body: String) -> Self {
        let etag = body_etag(&body);
        Self {
            kind,
            body: Arc::from(body),
            etag,
        }
    }

    pub fn success(body: String) -> Self {
        Self::new(ResponseKind::Success, body)
    }

    pub fn rate_limited(retry_after: Duration, body: String) -> Self {
        Self::new(ResponseKind::RateLimited { retry_after }, body)
    }

    pub fn failed(status: u16, body: String) -> Self {
        Self::new(ResponseKind::Failed { status }, body)
    }
}

/// Quoted SHA-256 of the body.
pub fn body_etag(body: &str) -> String {
    format!("\"{}\"", hex::encode(Sha256::digest(body.as_bytes())))
}

/// Whether an `If-None-Match` header value matches `etag`.
pub fn etag_matches(if_none_match: &str, etag: &str) -> bool {
    if_none_match.split(',').map(str::trim).any(|candidate| {
        candidate == "*" || candidate.trim_start_matches("W/") == etag
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServedFrom {
    Cache,
    Computed,
    Joined,
}

impl ServedFrom {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cache => "hit",
            Self::Computed => "miss",
            Self::Joined => "joined",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CoalescedReply {
    pub response: ComputedResponse,
    pub served_from: ServedFrom,
    /// Set when the caller's validator matched a successful response.
    pub not_modified: bool,
    /// Callers that attached to the same computation. Diagnostics only.
    pub joiners: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct CoalescerConfig {
    pub success_ttl: Duration,
    pub rate_limited_ttl: Duration,
    pub max_entries: usize,
}

/// Per-entry TTL by outcome class.
struct ResponseExpiry {
    success_ttl: Duration,
    rate_limited_ttl: Duration,
}

impl Expiry<CacheKey, ComputedResponse> for ResponseExpiry {
    fn expire_after_create(
        &self,
        _key: &CacheKey,
        value: &ComputedResponse,
        _created_at: Instant,
    ) -> Option<Duration> {
        match value.kind {
            ResponseKind::Success => Some(self.success_ttl),
            ResponseKind::RateLimited { .. } => Some(self.rate_limited_ttl),
            ResponseKind::Failed { .. } => Some(Duration::ZERO),
        }
    }
}

/// Process-wide response cache with in-flight deduplication. Advisory only: the store is the
/// system of record, and entries are dropped rather than corrected.
#[derive(Clone)]
pub struct ResponseCoalescer {
    cache: Cache<CacheKey, ComputedResponse>,
    /// Callers waiting per key while a computation runs. Diagnostics only.
    waiters: Cache<CacheKey, Arc<AtomicUsize>>,
}

impl ResponseCoalescer {
    pub fn new(config: CoalescerConfig) -> Self {
        let capacity = config.max_entries.max(1) as u64;
        Self {
            cache: Cache::builder()
                .max_capacity(capacity)
                .expire_after(ResponseExpiry {
                    success_ttl: config.success_ttl,
                    rate_limited_ttl: config.rate_limited_ttl,
                })
                .build(),
            waiters: Cache::builder()
                .max_capacity(capacity)
                .time_to_live(Duration::from_secs(300))
                .build(),
        }
    }

    /// Serves `key` from cache, joins a running computation, or starts `compute`.
    ///
    /// Only one computation per key runs at a time; concurrent callers wait for its result.
    /// Failed responses reach every waiting caller but are never stored.
    pub async fn get_or_compute<F, Fut>(
        &self,
        key: CacheKey,
        if_none_match: Option<&str>,
        compute: F,
    ) -> CoalescedReply
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = ComputedResponse> + Send + 'static,
    {
        if let Some(cached) = self.cache.get(&key).await {
            if let Some(metrics) = INSIGHTS_METRICS.get() {
                metrics.cache_hits_total.inc();
            }
            return self.reply(cached, ServedFrom::Cache, if_none_match, 0);
        }

        let waiting = self
            .waiters
            .get_with(key.clone(), async { Arc::new(AtomicUsize::new(0)) })
            .await;
        waiting.fetch_add(1, Ordering::SeqCst);

        let ran = Arc::new(AtomicBool::new(false));
        let init = {
            let ran = ran.clone();
            async move {
                ran.store(true, Ordering::SeqCst);
                let response = run_detached(compute()).await;
                match response.kind {
                    ResponseKind::Failed { .. } => Err(response),
                    _ => Ok(response),
                }
            }
        };
        let response = match self.cache.entry(key.clone()).or_try_insert_with(init).await {
            Ok(entry) => entry.into_value(),
            Err(failed) => ComputedResponse::clone(&failed),
        };

        let joiners = waiting.load(Ordering::SeqCst).saturating_sub(1);
        let served_from = if ran.load(Ordering::SeqCst) {
            ServedFrom::Computed
        } else {
            ServedFrom::Joined
        };

        if served_from == ServedFrom::Computed {
            self.waiters.invalidate(&key).await;
            if joiners > 0 {
                debug!(
                    event = "coalesced_computation_finished",
                    key = %key,
                    joiners,
                    kind = response.kind.as_str(),
                    "in-flight computation served joined callers"
                );
            }
        }
        if let Some(metrics) = INSIGHTS_METRICS.get() {
            match served_from {
                ServedFrom::Joined => metrics.cache_joins_total.inc(),
                _ => metrics.cache_misses_total.inc(),
            };
            metrics.cache_entries.set(self.cache.entry_count() as i64);
        }
        self.reply(response, served_from, if_none_match, joiners)
    }

    fn reply(
        &self,
        response: ComputedResponse,
        served_from: ServedFrom,
        if_none_match: Option<&str>,
        joiners: usize,
    ) -> CoalescedReply {
        let not_modified = response.kind == ResponseKind::Success
            && if_none_match.is_some_and(|header| etag_matches(header, &response.etag));
        if not_modified {
            if let Some(metrics) = INSIGHTS_METRICS.get() {
                metrics.cache_not_modified_total.inc();
            }
        }
        CoalescedReply {
            response,
            served_from,
            not_modified,
            joiners,
        }
    }

    /// Drops every cached response for `account_id`, e.g. after the store changed under it.
    pub async fn invalidate_account(&self, account_id: &str) {
        let keys: Vec<CacheKey> = self
            .cache
            .iter()
            .filter(|(key, _)| key.account_id == account_id)
            .map(|(key, _)| CacheKey::clone(&key))
            .collect();
        for key in &keys {
            self.cache.invalidate(key).await;
        }
        if !keys.is_empty() {
            debug!(
                event = "coalescer_account_invalidated",
                account_id,
                entries = keys.len(),
                "dropped cached responses for account"
            );
        }
        if let Some(metrics) = INSIGHTS_METRICS.get() {
            metrics.cache_entries.set(self.cache.entry_count() as i64);
        }
    }

    pub async fn cached_entries(&self) -> usize {
        self.cache.run_pending_tasks().await;
        self.cache.entry_count() as usize
    }
}

/// Runs a computation on its own task so a panic fails only this read.
async fn run_detached<Fut>(computation: Fut) -> ComputedResponse
where
    Fut: Future<Output = ComputedResponse> + Send + 'static,
{
    tokio::spawn(computation).await.unwrap_or_else(|err| {
        error!(
            event = "coalesced_computation_panicked",
            error = %err,
            "response computation did not complete"
        );
        ComputedResponse::failed(
            500,
            r#"{"ok":false,"error":"internal_error","message":"computation failed"}"#.to_string(),
        )
    })
}

#[cfg(test)]
#[path = "coalescer_tests.rs"]
mod tests;

use std::sync::Arc;

use chrono::NaiveDate;

use super::{token_fingerprint, CacheKey, CoalescedReply, ComputedResponse, ResponseCoalescer};
use crate::accounts::Account;
use crate::insights::{DayWindow, MetricFetcher};
use crate::server::error::ApiError;
use crate::snapshots::{DailySnapshotReport, ReconcileError, SnapshotReader};

pub const DAILY_SNAPSHOT_MODE: &str = "daily_snapshot";

/// The read endpoint's computation behind the response coalescer.
#[derive(Clone)]
pub struct CachedSnapshotReader {
    reader: SnapshotReader,
    fetcher: MetricFetcher,
    coalescer: ResponseCoalescer,
    fingerprint_salt: Arc<str>,
}

impl CachedSnapshotReader {
    pub fn new(
        reader: SnapshotReader,
        fetcher: MetricFetcher,
        coalescer: ResponseCoalescer,
        fingerprint_salt: &str,
    ) -> Self {
        Self {
            reader,
            fetcher,
            coalescer,
            fingerprint_salt: Arc::from(fingerprint_salt),
        }
    }

    pub fn coalescer(&self) -> &ResponseCoalescer {
        &self.coalescer
    }

    pub async fn read(
        &self,
        account: &Account,
        credential: &str,
        days: u32,
        today: NaiveDate,
        if_none_match: Option<&str>,
    ) -> CoalescedReply {
        let key = CacheKey::new(
            DAILY_SNAPSHOT_MODE,
            account,
            DayWindow::ending_at(today, days),
            token_fingerprint(&self.fingerprint_salt, credential),
        );
        let reader = self.reader.clone();
        let fetcher = self.fetcher.clone();
        let account = account.clone();
        let credential = credential.to_string();

        self.coalescer
            .get_or_compute(key, if_none_match, move || async move {
                render_report(
                    compute_report(&reader, &fetcher, &account, &credential, days, today).await,
                )
            })
            .await
    }
}

async fn compute_report(
    reader: &SnapshotReader,
    fetcher: &MetricFetcher,
    account: &Account,
    credential: &str,
    days: u32,
    today: NaiveDate,
) -> Result<DailySnapshotReport, ReconcileError> {
    let session = fetcher.open_session(account, credential).await?;
    reader.read(account, &session, days, today).await
}

/// Renders a read result into a cacheable response. Rate limits keep their own outcome class.
pub fn render_report(result: Result<DailySnapshotReport, ReconcileError>) -> ComputedResponse {
    let rendered = result
        .map_err(ApiError::from)
        .and_then(|report| {
            serde_json::to_string(&report)
                .map_err(|err| ApiError::InvalidRequest(format!("unserializable report: {err}")))
        });

    match rendered {
        Ok(body) => ComputedResponse::success(body),
        Err(err) => {
            let body = err.body().to_string();
            match err {
                ApiError::UpstreamRateLimited { retry_after, .. } => {
                    ComputedResponse::rate_limited(retry_after, body)
                }
                other => ComputedResponse::failed(other.status().as_u16(), body),
            }
        }
    }
}

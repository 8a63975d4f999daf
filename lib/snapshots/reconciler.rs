use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use serde::Serialize;
use tracing::{debug, info};

use super::store::SnapshotStore;
use super::types::{DailySnapshot, ReconcileError, SnapshotSource};
use crate::accounts::Account;
use crate::insights::{apply_totals, merge_series, DayWindow, GraphSession, MetricFetcher};
use crate::server::monitoring::INSIGHTS_METRICS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnsureReason {
    AlreadyComplete,
    Wrote,
    /// Upstream answered but had no value for the day. Not an error.
    NoData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EnsureDayOutcome {
    pub day: NaiveDate,
    pub wrote: bool,
    pub reason: EnsureReason,
}

/// Decides per day whether the stored row is authoritative or must be written from upstream.
#[derive(Clone)]
pub struct SnapshotReconciler {
    fetcher: MetricFetcher,
    store: Arc<dyn SnapshotStore>,
}

impl SnapshotReconciler {
    pub fn new(fetcher: MetricFetcher, store: Arc<dyn SnapshotStore>) -> Self {
        Self { fetcher, store }
    }

    pub fn fetcher(&self) -> &MetricFetcher {
        &self.fetcher
    }

    pub fn store(&self) -> &Arc<dyn SnapshotStore> {
        &self.store
    }

    /// Makes sure `day` has a complete row, fetching `day - 1 ..= day` when it does not.
    ///
    /// Any row with a resolved reach short-circuits, today's included.
    pub async fn ensure_day(
        &self,
        account: &Account,
        session: &GraphSession,
        day: NaiveDate,
        source: SnapshotSource,
        today: NaiveDate,
    ) -> Result<EnsureDayOutcome, ReconcileError> {
        if let Some(existing) = self.store.load_day(account, day).await? {
            if existing.is_complete() {
                debug!(
                    event = "snapshot_day_already_complete",
                    account_id = %account.account_id,
                    day = %day,
                    "stored snapshot is complete; skipping upstream"
                );
                return Ok(EnsureDayOutcome {
                    day,
                    wrote: false,
                    reason: EnsureReason::AlreadyComplete,
                });
            }
        }

        let window = DayWindow {
            since: day.pred_opt().unwrap_or(day),
            until: day,
        };
        let fetched = self.fetcher.fetch_series(session, window).await?;
        let mut buckets = merge_series(&fetched.series);

        if !buckets.get(&day).is_some_and(|bucket| bucket.reach.is_some()) {
            info!(
                event = "snapshot_day_no_data",
                account_id = %account.account_id,
                day = %day,
                "upstream returned no reach for day"
            );
            return Ok(EnsureDayOutcome {
                day,
                wrote: false,
                reason: EnsureReason::NoData,
            });
        }

        let totals = self.fetcher.fetch_totals(session, DayWindow::single(day)).await;
        apply_totals(&mut buckets, day, &totals.totals);
        let bucket = buckets.get(&day).copied().unwrap_or_default();

        let row = DailySnapshot::from_bucket(day, &bucket, source, Utc::now());
        let written = self
            .store
            .upsert_days(account, std::slice::from_ref(&row), today)
            .await?;
        if let Some(metrics) = INSIGHTS_METRICS.get() {
            metrics.snapshot_rows_written_total.inc_by(written as u64);
        }
        if written == 0 {
            // A concurrent writer completed the day first.
            return Ok(EnsureDayOutcome {
                day,
                wrote: false,
                reason: EnsureReason::AlreadyComplete,
            });
        }

        info!(
            event = "snapshot_day_written",
            account_id = %account.account_id,
            day = %day,
            source = source.as_str(),
            reach = bucket.reach.unwrap_or_default(),
            totals_degraded = totals.failure.is_some(),
            "wrote daily snapshot"
        );

        Ok(EnsureDayOutcome {
            day,
            wrote: true,
            reason: EnsureReason::Wrote,
        })
    }
}

use std::collections::BTreeMap;

use chrono::{NaiveDate, Utc};
use serde::Serialize;
use tracing::warn;

use super::reconciler::{EnsureDayOutcome, SnapshotReconciler};
use super::types::{DailySnapshot, ReconcileError, SnapshotSource};
use crate::accounts::Account;
use crate::insights::types::TOTALS_METRICS;
use crate::insights::{merge_series, pad_points, DailyPoint, DayBuckets, DayWindow, GraphSession};

pub const DEFAULT_READ_DAYS: u32 = 7;
pub const MAX_READ_DAYS: u32 = 120;

/// Clamps the requested point count into `1..=120`, defaulting to 7.
pub fn normalize_read_days(days: Option<i64>) -> u32 {
    match days {
        Some(days) => days.clamp(1, i64::from(MAX_READ_DAYS)) as u32,
        None => DEFAULT_READ_DAYS,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PointsSource {
    Db,
    GraphSeries,
    Empty,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TotalValue {
    pub value: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InsightTotal {
    pub name: String,
    pub total_value: TotalValue,
}

/// Payload of the daily snapshot read endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DailySnapshotReport {
    pub ok: bool,
    pub days: u32,
    pub points: Vec<DailyPoint>,
    pub insights_daily: Vec<InsightTotal>,
    pub points_source: PointsSource,
    pub points_ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ensured: Option<EnsureDayOutcome>,
}

/// Builds the padded point series for the read endpoint. The store wins over fresh upstream data.
#[derive(Clone)]
pub struct SnapshotReader {
    reconciler: SnapshotReconciler,
}

impl SnapshotReader {
    pub fn new(reconciler: SnapshotReconciler) -> Self {
        Self { reconciler }
    }

    /// Reads `days` points ending at `today`.
    ///
    /// Only a rate-limited upstream fails the read; every other upstream failure degrades to
    /// stored data with `points_ok == false`.
    pub async fn read(
        &self,
        account: &Account,
        session: &GraphSession,
        days: u32,
        today: NaiveDate,
    ) -> Result<DailySnapshotReport, ReconcileError> {
        let window = DayWindow::ending_at(today, days);
        let mut points_ok = true;

        let ensured = match today.pred_opt() {
            Some(yesterday) => match self
                .reconciler
                .ensure_day(account, session, yesterday, SnapshotSource::GraphSeed, today)
                .await
            {
                Ok(outcome) => Some(outcome),
                Err(ReconcileError::Upstream(err)) if err.is_rate_limited() => {
                    return Err(ReconcileError::Upstream(err));
                }
                Err(err) => {
                    warn!(
                        event = "snapshot_read_ensure_failed",
                        account_id = %account.account_id,
                        error = %err,
                        "could not ensure yesterday's snapshot"
                    );
                    points_ok = false;
                    None
                }
            },
            None => None,
        };

        let stored = self.reconciler.store().load_range(account, window).await?;
        let stored_complete: BTreeMap<NaiveDate, &DailySnapshot> = stored
            .iter()
            .filter(|row| row.is_final(today))
            .map(|row| (row.day, row))
            .collect();
        let history_complete = window
            .days()
            .filter(|day| *day < today)
            .all(|day| stored_complete.contains_key(&day));

        let mut buckets: DayBuckets = stored.iter().map(|row| (row.day, row.to_bucket())).collect();
        let mut points_source = if stored.is_empty() {
            PointsSource::Empty
        } else {
            PointsSource::Db
        };

        if !history_complete {
            match self.reconciler.fetcher().fetch_series(session, window).await {
                Ok(fetched) => {
                    let fresh = merge_series(&fetched.series);
                    if !fresh.is_empty() {
                        points_source = PointsSource::GraphSeries;
                        self.seed_store(account, &fresh, &stored_complete, today)
                            .await;
                    }
                    for (day, bucket) in fresh {
                        if !stored_complete.contains_key(&day) {
                            buckets.insert(day, bucket);
                        }
                    }
                }
                Err(err) if err.is_rate_limited() => return Err(err.into()),
                Err(err) => {
                    warn!(
                        event = "snapshot_read_series_failed",
                        account_id = %account.account_id,
                        kind = err.kind.as_str(),
                        error = %err,
                        "serving stored points only"
                    );
                    points_ok = false;
                }
            }
        }

        let totals = self.reconciler.fetcher().fetch_totals(session, window).await;
        let insights_daily = TOTALS_METRICS
            .iter()
            .map(|name| InsightTotal {
                name: (*name).to_string(),
                total_value: TotalValue {
                    value: totals.value_of(name),
                },
            })
            .collect();

        Ok(DailySnapshotReport {
            ok: true,
            days,
            points: pad_points(&buckets, today, days),
            insights_daily,
            points_source,
            points_ok,
            ensured,
        })
    }

    /// Best-effort write of freshly fetched history. Today stays out of the store.
    async fn seed_store(
        &self,
        account: &Account,
        fresh: &DayBuckets,
        stored_complete: &BTreeMap<NaiveDate, &DailySnapshot>,
        today: NaiveDate,
    ) {
        let wrote_at = Utc::now();
        let rows: Vec<DailySnapshot> = fresh
            .iter()
            .filter(|(day, bucket)| {
                **day < today && bucket.reach.is_some() && !stored_complete.contains_key(*day)
            })
            .map(|(day, bucket)| {
                DailySnapshot::from_bucket(*day, bucket, SnapshotSource::GraphSeed, wrote_at)
            })
            .collect();
        if rows.is_empty() {
            return;
        }

        if let Err(err) = self
            .reconciler
            .store()
            .upsert_days(account, &rows, today)
            .await {
            warn!(
                event = "snapshot_seed_failed",
                account_id = %account.account_id,
                rows = rows.len(),
                error = %err,
                "failed to seed snapshots from upstream series"
            );
        }
    }
}

#[cfg(test)]
#[path = "read_model_tests.rs"]
mod tests;

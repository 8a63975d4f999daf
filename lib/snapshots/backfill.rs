use std::collections::HashSet;
use std::sync::Arc;

use chrono::{Days, NaiveDate, Utc};
use serde::Serialize;
use tracing::{info, warn};

use super::store::SnapshotStore;
use super::types::{DailySnapshot, ReconcileError, SnapshotSource};
use crate::accounts::Account;
use crate::insights::{merge_series, DayWindow, GraphSession, MetricFetcher};
use crate::server::monitoring::INSIGHTS_METRICS;

pub const DEFAULT_BACKFILL_DAYS: u32 = 90;
pub const MAX_BACKFILL_DAYS: u32 = 120;

/// Clamps a requested lookback into `1..=120`, defaulting to 90.
pub fn normalize_lookback(days: Option<i64>) -> u32 {
    match days {
        Some(days) => days.clamp(1, i64::from(MAX_BACKFILL_DAYS)) as u32,
        None => DEFAULT_BACKFILL_DAYS,
    }
}

/// The lookback window ending at `today`, inclusive.
pub fn lookback_window(lookback_days: u32, today: NaiveDate) -> DayWindow {
    DayWindow::ending_at(today, lookback_days)
}

/// Days inside the lookback with no stored row or a placeholder row. `today` is never included.
pub fn plan_missing_days(
    existing: &[DailySnapshot],
    lookback_days: u32,
    today: NaiveDate,
) -> Vec<NaiveDate> {
    let complete: HashSet<NaiveDate> = existing
        .iter()
        .filter(|row| row.is_complete())
        .map(|row| row.day)
        .collect();

    lookback_window(lookback_days, today)
        .days()
        .filter(|day| *day < today)
        .filter(|day| !complete.contains(day))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackfillPlan {
    pub lookback: DayWindow,
    pub missing: Vec<NaiveDate>,
}

impl BackfillPlan {
    /// Smallest window covering every missing day, `None` when nothing is missing.
    pub fn fetch_window(&self) -> Option<DayWindow> {
        let since = self.missing.iter().min()?;
        let until = self.missing.iter().max()?;
        DayWindow::new(*since, *until)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackfillReport {
    pub inserted: usize,
    /// Count of `skipped_no_data`.
    pub skipped: usize,
    pub skipped_no_data: Vec<NaiveDate>,
    /// Missing days found complete by the pre-write re-check.
    pub already_complete: usize,
    pub missing: Vec<NaiveDate>,
    pub chunks: usize,
}

impl BackfillReport {
    fn empty() -> Self {
        Self {
            inserted: 0,
            skipped: 0,
            skipped_no_data: Vec::new(),
            already_complete: 0,
            missing: Vec::new(),
            chunks: 0,
        }
    }
}

pub struct BackfillPlanner {
    fetcher: MetricFetcher,
    store: Arc<dyn SnapshotStore>,
}

impl BackfillPlanner {
    pub fn new(fetcher: MetricFetcher, store: Arc<dyn SnapshotStore>) -> Self {
        Self { fetcher, store }
    }

    pub async fn plan(
        &self,
        account: &Account,
        lookback_days: u32,
        today: NaiveDate,
    ) -> Result<BackfillPlan, ReconcileError> {
        let lookback = lookback_window(lookback_days, today);
        let existing = self.store.load_range(account, lookback).await?;
        Ok(BackfillPlan {
            lookback,
            missing: plan_missing_days(&existing, lookback_days, today),
        })
    }

    /// Fetches `min(missing)..=max(missing)` and writes only missing days upstream has reach for.
    pub async fn execute(
        &self,
        account: &Account,
        session: &GraphSession,
        plan: &BackfillPlan,
        today: NaiveDate,
    ) -> Result<BackfillReport, ReconcileError> {
        let Some(window) = plan.fetch_window() else {
            return Ok(BackfillReport::empty());
        };

        // Days completed since planning are dropped from the write set.
        let complete: HashSet<NaiveDate> = self
            .store
            .load_range(account, window)
            .await?
            .into_iter()
            .filter(DailySnapshot::is_complete)
            .map(|row| row.day)
            .collect();
        let targets: Vec<NaiveDate> = plan
            .missing
            .iter()
            .copied()
            .filter(|day| *day < today && !complete.contains(day))
            .collect();

        let fetched = self.fetcher.fetch_series(session, window).await?;
        let buckets = merge_series(&fetched.series);
        let wrote_at = Utc::now();

        let mut rows = Vec::new();
        let mut skipped_no_data = Vec::new();
        for day in &targets {
            match buckets.get(day).filter(|bucket| bucket.reach.is_some()) {
                Some(bucket) => rows.push(DailySnapshot::from_bucket(
                    *day,
                    bucket,
                    SnapshotSource::BackfillGraph,
                    wrote_at,
                )),
                None => skipped_no_data.push(*day),
            }
        }

        let inserted = self.store.upsert_days(account, &rows, today).await?;
        if let Some(metrics) = INSIGHTS_METRICS.get() {
            metrics.snapshot_rows_written_total.inc_by(inserted as u64);
            metrics.backfill_inserted_total.inc_by(inserted as u64);
            metrics.backfill_skipped_total.inc_by(skipped_no_data.len() as u64);
        }
        if !skipped_no_data.is_empty() {
            warn!(
                event = "backfill_days_without_data",
                account_id = %account.account_id,
                count = skipped_no_data.len(),
                "upstream had no reach for some missing days"
            );
        }

        Ok(BackfillReport {
            inserted,
            skipped: skipped_no_data.len(),
            skipped_no_data,
            already_complete: plan.missing.len() - targets.len(),
            missing: plan.missing.clone(),
            chunks: fetched.chunks,
        })
    }

    pub async fn run(
        &self,
        account: &Account,
        session: &GraphSession,
        lookback_days: u32,
        today: NaiveDate,
    ) -> Result<BackfillReport, ReconcileError> {
        let plan = self.plan(account, lookback_days, today).await?;
        info!(
            event = "backfill_planned",
            account_id = %account.account_id,
            lookback_days,
            missing = plan.missing.len(),
            since = %plan.lookback.since,
            until = %today.checked_sub_days(Days::new(1)).unwrap_or(today),
            "planned backfill"
        );

        let report = self.execute(account, session, &plan, today).await?;
        info!(
            event = "backfill_completed",
            account_id = %account.account_id,
            inserted = report.inserted,
            skipped = report.skipped_no_data.len(),
            chunks = report.chunks,
            "backfill finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
#[path = "backfill_tests.rs"]
mod tests;

use std::sync::Arc;
use std::time::Instant;

use chrono::{NaiveDate, Utc};
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use super::audit::{record_best_effort, AuditRecord, AuditSink};
use super::followers::spawn_follower_snapshot;
use crate::accounts::Account;
use crate::coalescer::ResponseCoalescer;
use crate::insights::{apply_totals, merge_series, DayBuckets, DayWindow};
use crate::server::monitoring::{TaskLabels, INSIGHTS_METRICS};
use crate::snapshots::{DailySnapshot, ReconcileError, SnapshotReconciler, SnapshotSource};

/// Today when the upstream already has reach for it, else the latest day that has reach.
/// The flag is set when the fallback was taken.
pub fn choose_cron_day(buckets: &DayBuckets, today: NaiveDate) -> Option<(NaiveDate, bool)> {
    if buckets.get(&today).is_some_and(|bucket| bucket.reach.is_some()) {
        return Some((today, false));
    }
    buckets
        .iter()
        .rev()
        .find(|(day, bucket)| **day <= today && bucket.reach.is_some())
        .map(|(day, _)| (*day, true))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CronReport {
    pub ok: bool,
    pub chosen_day: Option<NaiveDate>,
    pub fallback: bool,
    pub wrote: bool,
    pub took_ms: u64,
}

/// Scheduled snapshot of the environment account.
#[derive(Clone)]
pub struct CronPrewarm {
    reconciler: SnapshotReconciler,
    coalescer: ResponseCoalescer,
    audit: Arc<dyn AuditSink>,
}

impl CronPrewarm {
    pub fn new(
        reconciler: SnapshotReconciler,
        coalescer: ResponseCoalescer,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            reconciler,
            coalescer,
            audit,
        }
    }

    pub async fn run(
        &self,
        account: &Account,
        credential: &str,
        today: NaiveDate,
    ) -> Result<CronReport, ReconcileError> {
        let started = Instant::now();
        let result = self.snapshot(account, credential, today).await;
        let took_ms = started.elapsed().as_millis() as u64;

        let (ok, details) = match &result {
            Ok((chosen, wrote)) => (
                true,
                json!({
                    "chosen_day": chosen.map(|(day, _)| day),
                    "fallback": chosen.is_some_and(|(_, fallback)| fallback),
                    "wrote": wrote,
                    "took_ms": took_ms,
                }),
            ),
            Err(err) => (false, json!({ "error": err.to_string(), "took_ms": took_ms })),
        };
        if let Some(metrics) = INSIGHTS_METRICS.get() {
            metrics
                .orchestrator_tasks_total
                .get_or_create(&TaskLabels {
                    task: "cron_prewarm",
                    outcome: if ok { "done" } else { "failed" },
                })
                .inc();
        }
        record_best_effort(
            self.audit.as_ref(),
            AuditRecord {
                owner_user_id: Some(account.owner_user_id.clone()),
                kind: "cron_prewarm",
                action: "snapshot".to_string(),
                ok,
                details,
            },
        )
        .await;

        let (chosen, wrote) = result?;
        Ok(CronReport {
            ok: true,
            chosen_day: chosen.map(|(day, _)| day),
            fallback: chosen.is_some_and(|(_, fallback)| fallback),
            wrote,
            took_ms,
        })
    }

    async fn snapshot(
        &self,
        account: &Account,
        credential: &str,
        today: NaiveDate,
    ) -> Result<(Option<(NaiveDate, bool)>, bool), ReconcileError> {
        let fetcher = self.reconciler.fetcher();
        let session = fetcher.open_session(account, credential).await?;
        let window = DayWindow {
            since: today.pred_opt().unwrap_or(today),
            until: today,
        };
        let fetched = fetcher.fetch_series(&session, window).await?;
        let mut buckets = merge_series(&fetched.series);

        let Some((day, fallback)) = choose_cron_day(&buckets, today) else {
            warn!(
                event = "cron_prewarm_no_data",
                account_id = %account.account_id,
                today = %today,
                "upstream returned no reach for yesterday or today"
            );
            return Ok((None, false));
        };
        if fallback {
            info!(
                event = "cron_prewarm_day_fallback",
                account_id = %account.account_id,
                today = %today,
                chosen_day = %day,
                "today not yet available upstream; using latest returned day"
            );
        }

        let totals = fetcher.fetch_totals(&session, DayWindow::single(day)).await;
        apply_totals(&mut buckets, day, &totals.totals);
        let bucket = buckets.get(&day).copied().unwrap_or_default();
        let row =
            DailySnapshot::from_bucket(day, &bucket, SnapshotSource::CronPrewarm, Utc::now());
        let written = self
            .reconciler
            .store()
            .upsert_days(account, std::slice::from_ref(&row), today)
            .await?;
        if let Some(metrics) = INSIGHTS_METRICS.get() {
            metrics.snapshot_rows_written_total.inc_by(written as u64);
        }
        self.coalescer.invalidate_account(&account.account_id).await;

        spawn_follower_snapshot(
            fetcher.clone(),
            self.reconciler.store().clone(),
            account.clone(),
            session,
            today,
        );

        info!(
            event = "cron_prewarm_written",
            account_id = %account.account_id,
            day = %day,
            reach = bucket.reach.unwrap_or_default(),
            "cron prewarm wrote snapshot"
        );
        Ok((Some((day, fallback)), written > 0))
    }
}

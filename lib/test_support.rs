use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use futures::future::BoxFuture;

use crate::accounts::Account;
use crate::db::StoreError;
use crate::insights::types::{MetricFamily, MetricPoint, MetricRequest, MetricSeries};
use crate::insights::{
    DayWindow, FetchError, FetchErrorKind, GraphSession, InsightsSource, RetryPolicy,
};
use crate::orchestrator::audit::{AuditRecord, AuditSink};
use crate::orchestrator::repair::{OwnerCard, RepairStore};
use crate::orchestrator::thumbnails::{ThumbnailWarmError, ThumbnailWarmer};
use crate::snapshots::store::dedupe_by_day;
use crate::snapshots::{DailySnapshot, SnapshotSource, SnapshotStore};

pub(crate) fn day(raw: &str) -> NaiveDate {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").expect("valid test date")
}

pub(crate) fn fast_retry_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 1,
        initial_backoff: Duration::ZERO,
        max_backoff: Duration::ZERO,
        jitter: Duration::ZERO,
    }
}

pub(crate) fn test_account() -> Account {
    Account {
        account_id: "acc-1".to_string(),
        platform_user_id: "1789".to_string(),
        page_id: String::new(),
        owner_user_id: "owner-1".to_string(),
    }
}

pub(crate) fn test_session() -> GraphSession {
    GraphSession {
        ig_user_id: "1789".to_string(),
        token: "user-token".to_string(),
    }
}

fn point(day: NaiveDate, value: Option<f64>) -> MetricPoint {
    MetricPoint {
        end_time: day.and_hms_opt(0, 0, 0).expect("midnight").and_utc(),
        value,
    }
}

pub(crate) type Responder =
    Box<dyn Fn(&MetricRequest<'_>) -> Result<Vec<MetricSeries>, FetchError> + Send + Sync>;

/// Per-day reach from `reach_for`; days mapped to `None` are absent from the series.
/// `views` is twice the reach. Totals use the fixed values of [`steady_responder`].
pub(crate) fn daily_responder<F>(reach_for: F) -> Responder
where
    F: Fn(NaiveDate) -> Option<f64> + Send + Sync + 'static,
{
    Box::new(move |request| {
        if request.family == MetricFamily::Totals {
            return Ok(fixed_totals(request));
        }
        let mut reach = Vec::new();
        let mut views = Vec::new();
        for d in request.window.days() {
            if let Some(value) = reach_for(d) {
                reach.push(point(d, Some(value)));
                views.push(point(d, Some(value * 2.0)));
            }
        }
        Ok(series_for(request, vec![("reach", reach), ("views", views)]))
    })
}

/// The same reach and views on every requested day. Totals are `total_interactions = 5`,
/// `accounts_engaged = 3` and `profile_views = 1` per upstream window.
pub(crate) fn steady_responder(reach: Option<f64>, views: f64) -> Responder {
    Box::new(move |request| {
        if request.family == MetricFamily::Totals {
            return Ok(fixed_totals(request));
        }
        let reach_points = request.window.days().map(|d| point(d, reach)).collect();
        let view_points = request.window.days().map(|d| point(d, Some(views))).collect();
        Ok(series_for(
            request,
            vec![("reach", reach_points), ("views", view_points)],
        ))
    })
}

fn fixed_totals(request: &MetricRequest<'_>) -> Vec<MetricSeries> {
    let until = request.window.until;
    series_for(
        request,
        vec![
            ("total_interactions", vec![point(until, Some(5.0))]),
            ("accounts_engaged", vec![point(until, Some(3.0))]),
            ("profile_views", vec![point(until, Some(1.0))]),
        ],
    )
}

fn series_for(
    request: &MetricRequest<'_>,
    available: Vec<(&str, Vec<MetricPoint>)>,
) -> Vec<MetricSeries> {
    available
        .into_iter()
        .filter(|(name, _)| request.metrics.contains(name))
        .map(|(name, points)| MetricSeries {
            name: name.to_string(),
            points,
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RecordedCall {
    pub(crate) family: MetricFamily,
    pub(crate) metrics: Vec<String>,
    pub(crate) window: DayWindow,
}

/// Upstream double that answers through a responder closure and records every call.
pub(crate) struct ScriptedSource {
    responder: Responder,
    page_token: Result<String, FetchError>,
    followers: Result<Option<i64>, FetchError>,
    delay: Duration,
    calls: Mutex<Vec<RecordedCall>>,
    page_token_calls: AtomicUsize,
    follower_calls: AtomicUsize,
}

impl ScriptedSource {
    pub(crate) fn new<F>(responder: F) -> Self
    where
        F: Fn(&MetricRequest<'_>) -> Result<Vec<MetricSeries>, FetchError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            responder: Box::new(responder),
            page_token: Ok("page-token".to_string()),
            followers: Ok(Some(1200)),
            delay: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
            page_token_calls: AtomicUsize::new(0),
            follower_calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn with_page_token(mut self, result: Result<String, FetchError>) -> Self {
        self.page_token = result;
        self
    }

    pub(crate) fn with_followers(mut self, result: Result<Option<i64>, FetchError>) -> Self {
        self.followers = result;
        self
    }

    /// Each metric call sleeps this long before answering.
    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub(crate) fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().expect("calls mutex poisoned").clone()
    }

    pub(crate) fn series_calls(&self) -> Vec<RecordedCall> {
        self.calls_for(MetricFamily::Series)
    }

    pub(crate) fn totals_calls(&self) -> Vec<RecordedCall> {
        self.calls_for(MetricFamily::Totals)
    }

    fn calls_for(&self, family: MetricFamily) -> Vec<RecordedCall> {
        self.calls()
            .into_iter()
            .filter(|call| call.family == family)
            .collect()
    }

    pub(crate) fn page_token_calls(&self) -> usize {
        self.page_token_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn follower_calls(&self) -> usize {
        self.follower_calls.load(Ordering::SeqCst)
    }
}

impl InsightsSource for ScriptedSource {
    fn fetch_metrics<'a>(
        &'a self,
        request: &'a MetricRequest<'a>,
    ) -> BoxFuture<'a, Result<Vec<MetricSeries>, FetchError>> {
        Box::pin(async move {
            self.calls
                .lock()
                .expect("calls mutex poisoned")
                .push(RecordedCall {
                    family: request.family,
                    metrics: request.metrics.iter().map(|m| m.to_string()).collect(),
                    window: request.window,
                });
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            (self.responder)(request)
        })
    }

    fn resolve_page_token<'a>(
        &'a self,
        _page_id: &'a str,
        _user_token: &'a str,
    ) -> BoxFuture<'a, Result<String, FetchError>> {
        Box::pin(async move {
            self.page_token_calls.fetch_add(1, Ordering::SeqCst);
            self.page_token.clone()
        })
    }

    fn fetch_followers_count<'a>(
        &'a self,
        _ig_user_id: &'a str,
        _token: &'a str,
    ) -> BoxFuture<'a, Result<Option<i64>, FetchError>> {
        Box::pin(async move {
            self.follower_calls.fetch_add(1, Ordering::SeqCst);
            self.followers.clone()
        })
    }
}

pub(crate) fn unsupported(message: &str) -> FetchError {
    FetchError::new(FetchErrorKind::UnsupportedMetric, message)
}

type RowKey = (String, String, String, NaiveDate);

fn row_key(account: &Account, day: NaiveDate) -> RowKey {
    (
        account.owner_user_id.clone(),
        account.platform_user_id.clone(),
        account.page_id.clone(),
        day,
    )
}

/// In-memory store with the same "complete rows are frozen" upsert rule as Postgres.
#[derive(Default)]
pub(crate) struct MemorySnapshotStore {
    rows: Mutex<BTreeMap<RowKey, DailySnapshot>>,
    followers: Mutex<HashMap<(String, NaiveDate), i64>>,
    upsert_calls: AtomicUsize,
    fail_writes: bool,
}

impl MemorySnapshotStore {
    pub(crate) fn failing_writes() -> Self {
        Self {
            fail_writes: true,
            ..Self::default()
        }
    }

    pub(crate) fn seed(&self, account: &Account, day: NaiveDate, reach: Option<i64>) {
        self.rows.lock().expect("rows mutex poisoned").insert(
            row_key(account, day),
            DailySnapshot {
                day,
                reach,
                impressions: 0,
                total_interactions: 0,
                accounts_engaged: 0,
                source_used: SnapshotSource::GraphSeed,
                wrote_at: Utc::now(),
            },
        );
    }

    pub(crate) fn row(&self, account: &Account, day: NaiveDate) -> Option<DailySnapshot> {
        self.rows
            .lock()
            .expect("rows mutex poisoned")
            .get(&row_key(account, day))
            .cloned()
    }

    pub(crate) fn upsert_calls(&self) -> usize {
        self.upsert_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn followers_for(&self, account: &Account, day: NaiveDate) -> Option<i64> {
        self.followers
            .lock()
            .expect("followers mutex poisoned")
            .get(&(account.platform_user_id.clone(), day))
            .copied()
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn load_range<'a>(
        &'a self,
        account: &'a Account,
        window: DayWindow,
    ) -> BoxFuture<'a, Result<Vec<DailySnapshot>, StoreError>> {
        Box::pin(async move {
            let rows = self.rows.lock().expect("rows mutex poisoned");
            Ok(window
                .days()
                .filter_map(|day| rows.get(&row_key(account, day)).cloned())
                .collect())
        })
    }

    /// Mirrors the Postgres conflict guard: complete rows before `today` stay untouched and a
    /// known reach survives a null one.
    fn upsert_days<'a>(
        &'a self,
        account: &'a Account,
        rows: &'a [DailySnapshot],
        today: NaiveDate,
    ) -> BoxFuture<'a, Result<usize, StoreError>> {
        Box::pin(async move {
            self.upsert_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_writes {
                return Err(StoreError::Retryable("connection closed".to_string()));
            }
            let mut stored = self.rows.lock().expect("rows mutex poisoned");
            let mut written = 0;
            for row in dedupe_by_day(rows) {
                let key = row_key(account, row.day);
                let reach = match stored.get(&key) {
                    Some(existing) if existing.is_final(today) => continue,
                    Some(existing) => row.reach.or(existing.reach),
                    None => row.reach,
                };
                stored.insert(key, DailySnapshot { reach, ..row });
                written += 1;
            }
            Ok(written)
        })
    }

    fn record_followers<'a>(
        &'a self,
        account: &'a Account,
        day: NaiveDate,
        followers_count: i64,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            self.followers
                .lock()
                .expect("followers mutex poisoned")
                .insert((account.platform_user_id.clone(), day), followers_count);
            Ok(())
        })
    }
}

/// Audit sink that keeps every record in memory.
#[derive(Default)]
pub(crate) struct RecordingAuditSink {
    records: Mutex<Vec<AuditRecord>>,
}

impl RecordingAuditSink {
    pub(crate) fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().expect("audit mutex poisoned").clone()
    }
}

impl AuditSink for RecordingAuditSink {
    fn record<'a>(&'a self, record: &'a AuditRecord) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            self.records
                .lock()
                .expect("audit mutex poisoned")
                .push(record.clone());
            Ok(())
        })
    }
}

/// Thumbnail proxy double: sleeps `delay`, then reports `warmed` or a status failure.
pub(crate) struct ScriptedThumbnailWarmer {
    delay: Duration,
    fail_status: Option<u16>,
    warmed: u64,
    calls: AtomicUsize,
    finished: AtomicUsize,
}

impl ScriptedThumbnailWarmer {
    pub(crate) fn new(warmed: u64) -> Self {
        Self {
            delay: Duration::ZERO,
            fail_status: None,
            warmed,
            calls: AtomicUsize::new(0),
            finished: AtomicUsize::new(0),
        }
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub(crate) fn failing(mut self, status: u16) -> Self {
        self.fail_status = Some(status);
        self
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Calls that ran to completion, including ones the caller stopped waiting for.
    pub(crate) fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }
}

impl ThumbnailWarmer for ScriptedThumbnailWarmer {
    fn warm<'a>(&'a self, _account: &'a Account) -> BoxFuture<'a, Result<u64, ThumbnailWarmError>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.finished.fetch_add(1, Ordering::SeqCst);
            match self.fail_status {
                Some(status) => Err(ThumbnailWarmError::Status(status)),
                None => Ok(self.warmed),
            }
        })
    }
}

/// In-memory creator cards and thumbnail locks.
#[derive(Default)]
pub(crate) struct MemoryRepairStore {
    cards: Mutex<HashMap<String, Vec<OwnerCard>>>,
    /// `(url_hash, locked_at)` of rows still in the processing state.
    locks: Mutex<Vec<(String, chrono::DateTime<Utc>)>>,
    set_calls: AtomicUsize,
}

impl MemoryRepairStore {
    pub(crate) fn with_cards(owner: &str, cards: Vec<OwnerCard>) -> Self {
        let store = Self::default();
        store
            .cards
            .lock()
            .expect("cards mutex poisoned")
            .insert(owner.to_string(), cards);
        store
    }

    pub(crate) fn lock_thumbnail(&self, url_hash: &str, locked_at: chrono::DateTime<Utc>) {
        self.locks
            .lock()
            .expect("locks mutex poisoned")
            .push((url_hash.to_string(), locked_at));
    }

    pub(crate) fn locked_thumbnails(&self) -> usize {
        self.locks.lock().expect("locks mutex poisoned").len()
    }

    pub(crate) fn cards(&self, owner: &str) -> Vec<OwnerCard> {
        self.cards
            .lock()
            .expect("cards mutex poisoned")
            .get(owner)
            .cloned()
            .unwrap_or_default()
    }

    pub(crate) fn set_calls(&self) -> usize {
        self.set_calls.load(Ordering::SeqCst)
    }
}

impl RepairStore for MemoryRepairStore {
    fn release_stale_thumbnail_locks<'a>(
        &'a self,
        stale_before: chrono::DateTime<Utc>,
        dry_run: bool,
    ) -> BoxFuture<'a, Result<u64, StoreError>> {
        Box::pin(async move {
            let mut locks = self.locks.lock().expect("locks mutex poisoned");
            let stale = locks
                .iter()
                .filter(|(_, locked_at)| *locked_at < stale_before)
                .count() as u64;
            if !dry_run {
                locks.retain(|(_, locked_at)| *locked_at >= stale_before);
            }
            Ok(stale)
        })
    }

    fn owner_cards<'a>(&'a self, owner: &'a str) -> BoxFuture<'a, Result<Vec<OwnerCard>, StoreError>> {
        Box::pin(async move { Ok(self.cards(owner)) })
    }

    fn set_owner_card<'a>(
        &'a self,
        owner: &'a str,
        keep_id: &'a str,
    ) -> BoxFuture<'a, Result<u64, StoreError>> {
        Box::pin(async move {
            self.set_calls.fetch_add(1, Ordering::SeqCst);
            let mut cards = self.cards.lock().expect("cards mutex poisoned");
            let mut changed = 0;
            for card in cards.entry(owner.to_string()).or_default() {
                let flag = card.id == keep_id;
                if card.is_owner_card != flag {
                    card.is_owner_card = flag;
                    changed += 1;
                }
            }
            Ok(changed)
        })
    }
}

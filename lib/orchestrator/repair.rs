use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, NaiveDate, Utc};
use diesel::dsl::count_star;
use diesel::prelude::*;
use diesel_async::RunQueryDsl;
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use super::audit::{record_best_effort, AuditRecord, AuditSink};
use super::throttle::CooldownGate;
use crate::accounts::Account;
use crate::coalescer::ResponseCoalescer;
use crate::db::models::CreatorCardRow;
use crate::db::schema::{creator_cards, thumbnail_cache};
use crate::db::{map_diesel_error, map_pool_error, DbPool, StoreError};
use crate::server::monitoring::{TaskLabels, INSIGHTS_METRICS};
use crate::snapshots::{EnsureReason, ReconcileError, SnapshotReconciler, SnapshotSource};

/// Status a thumbnail row holds while a worker owns its lock.
const THUMBNAIL_PROCESSING: &str = "processing";
const THUMBNAIL_IDLE: &str = "idle";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairAction {
    UnlockThumbs,
    SnapshotToday,
    FixOwnerCard,
}

impl RepairAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UnlockThumbs => "unlock_thumbs",
            Self::SnapshotToday => "snapshot_today",
            Self::FixOwnerCard => "fix_owner_card",
        }
    }
}

impl FromStr for RepairAction {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "unlock_thumbs" => Ok(Self::UnlockThumbs),
            "snapshot_today" => Ok(Self::SnapshotToday),
            "fix_owner_card" => Ok(Self::FixOwnerCard),
            other => Err(format!("unknown repair action: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerCard {
    pub id: String,
    pub is_owner_card: bool,
    pub updated_at: DateTime<Utc>,
}

impl From<CreatorCardRow> for OwnerCard {
    fn from(row: CreatorCardRow) -> Self {
        Self {
            id: row.id,
            is_owner_card: row.is_owner_card,
            updated_at: row.updated_at,
        }
    }
}

/// Tables touched only by repair actions.
pub trait RepairStore: Send + Sync {
    /// Processing locks taken before `stale_before`. Released unless `dry_run`.
    fn release_stale_thumbnail_locks<'a>(
        &'a self,
        stale_before: DateTime<Utc>,
        dry_run: bool,
    ) -> BoxFuture<'a, Result<u64, StoreError>>;

    fn owner_cards<'a>(&'a self, owner: &'a str) -> BoxFuture<'a, Result<Vec<OwnerCard>, StoreError>>;

    /// Flags `keep_id` and clears every other card of `owner`. Returns rows changed.
    fn set_owner_card<'a>(
        &'a self,
        owner: &'a str,
        keep_id: &'a str,
    ) -> BoxFuture<'a, Result<u64, StoreError>>;
}

impl<T> RepairStore for Arc<T>
where
    T: RepairStore + ?Sized,
{
    fn release_stale_thumbnail_locks<'a>(
        &'a self,
        stale_before: DateTime<Utc>,
        dry_run: bool,
    ) -> BoxFuture<'a, Result<u64, StoreError>> {
        (**self).release_stale_thumbnail_locks(stale_before, dry_run)
    }

    fn owner_cards<'a>(&'a self, owner: &'a str) -> BoxFuture<'a, Result<Vec<OwnerCard>, StoreError>> {
        (**self).owner_cards(owner)
    }

    fn set_owner_card<'a>(
        &'a self,
        owner: &'a str,
        keep_id: &'a str,
    ) -> BoxFuture<'a, Result<u64, StoreError>> {
        (**self).set_owner_card(owner, keep_id)
    }
}

pub struct PgRepairStore {
    pool: DbPool,
}

impl PgRepairStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

impl RepairStore for PgRepairStore {
    fn release_stale_thumbnail_locks<'a>(
        &'a self,
        stale_before: DateTime<Utc>,
        dry_run: bool,
    ) -> BoxFuture<'a, Result<u64, StoreError>> {
        Box::pin(async move {
            let mut conn = self.pool.get().await.map_err(map_pool_error)?;
            let stale = thumbnail_cache::status
                .eq(THUMBNAIL_PROCESSING)
                .and(thumbnail_cache::locked_at.lt(stale_before));

            let affected = if dry_run {
                thumbnail_cache::table
                    .filter(stale)
                    .select(count_star())
                    .get_result::<i64>(&mut conn)
                    .await
                    .map_err(map_diesel_error)? as u64
            } else {
                diesel::update(thumbnail_cache::table.filter(stale))
                    .set((
                        thumbnail_cache::status.eq(THUMBNAIL_IDLE),
                        thumbnail_cache::locked_at.eq(None::<DateTime<Utc>>),
                        thumbnail_cache::updated_at.eq(Utc::now()),
                    ))
                    .execute(&mut conn)
                    .await
                    .map_err(map_diesel_error)? as u64
            };
            Ok(affected)
        })
    }

    fn owner_cards<'a>(&'a self, owner: &'a str) -> BoxFuture<'a, Result<Vec<OwnerCard>, StoreError>> {
        Box::pin(async move {
            let mut conn = self.pool.get().await.map_err(map_pool_error)?;
            let rows = creator_cards::table
                .filter(creator_cards::owner_user_id.eq(owner))
                .select(CreatorCardRow::as_select())
                .load::<CreatorCardRow>(&mut conn)
                .await
                .map_err(map_diesel_error)?;
            Ok(rows.into_iter().map(OwnerCard::from).collect())
        })
    }

    fn set_owner_card<'a>(
        &'a self,
        owner: &'a str,
        keep_id: &'a str,
    ) -> BoxFuture<'a, Result<u64, StoreError>> {
        Box::pin(async move {
            let mut conn = self.pool.get().await.map_err(map_pool_error)?;
            // Flags exactly one card in a single statement.
            let changed = diesel::update(
                creator_cards::table
                    .filter(creator_cards::owner_user_id.eq(owner))
                    .filter(
                        creator_cards::is_owner_card
                            .ne(creator_cards::id.eq(keep_id)),
                    ),
            )
            .set((
                creator_cards::is_owner_card.eq(creator_cards::id.eq(keep_id)),
                creator_cards::updated_at.eq(Utc::now()),
            ))
            .execute(&mut conn)
            .await
            .map_err(map_diesel_error)?;
            Ok(changed as u64)
        })
    }
}

/// The card that keeps the owner flag: the most recently updated flagged card, or the most
/// recently updated card when none is flagged. Ties go to the greater id.
pub fn choose_owner_card(cards: &[OwnerCard]) -> Option<&OwnerCard> {
    let any_flagged = cards.iter().any(|card| card.is_owner_card);
    cards
        .iter()
        .filter(|card| card.is_owner_card || !any_flagged)
        .max_by(|a, b| {
            a.updated_at
                .cmp(&b.updated_at)
                .then_with(|| a.id.cmp(&b.id))
        })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairSkip {
    Throttled,
    AlreadyOk,
    NoCards,
    NoAccount,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RepairOutcome {
    pub ok: bool,
    pub action: RepairAction,
    pub dry_run: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped: Option<RepairSkip>,
    pub details: Value,
    pub took_ms: u64,
}

/// Account and credential for actions that talk to the upstream.
#[derive(Debug, Clone)]
pub struct RepairTarget {
    pub account: Account,
    pub credential: String,
}

#[derive(Debug, Clone)]
pub struct RepairRequest {
    pub action: RepairAction,
    pub dry_run: bool,
    pub owner_user_id: String,
    pub target: Option<RepairTarget>,
    pub today: NaiveDate,
}

struct ActionResult {
    skipped: Option<RepairSkip>,
    details: Value,
}

impl ActionResult {
    fn done(details: Value) -> Self {
        Self {
            skipped: None,
            details,
        }
    }

    fn skipped(reason: RepairSkip, details: Value) -> Self {
        Self {
            skipped: Some(reason),
            details,
        }
    }
}

/// Whole seconds until the slot frees up, rounded up.
fn retry_after_secs(remaining: Duration) -> u64 {
    (remaining.as_millis().div_ceil(1000) as u64).max(1)
}

/// Runs named, idempotent repair actions. One execution per owner and action per cooldown.
pub struct Repairer {
    store: Arc<dyn RepairStore>,
    reconciler: SnapshotReconciler,
    coalescer: ResponseCoalescer,
    audit: Arc<dyn AuditSink>,
    gate: CooldownGate,
    thumbnail_lock_stale_after: Duration,
}

impl Repairer {
    pub fn new(
        store: Arc<dyn RepairStore>,
        reconciler: SnapshotReconciler,
        coalescer: ResponseCoalescer,
        audit: Arc<dyn AuditSink>,
        cooldown: Duration,
        thumbnail_lock_stale_after: Duration,
    ) -> Self {
        Self {
            store,
            reconciler,
            coalescer,
            audit,
            gate: CooldownGate::new(cooldown),
            thumbnail_lock_stale_after,
        }
    }

    pub async fn run(&self, request: RepairRequest) -> Result<RepairOutcome, ReconcileError> {
        let started = Instant::now();
        let action = request.action;

        let result = if request.dry_run {
            self.execute(&request).await
        } else {
            match self
                .gate
                .try_acquire(&format!("{}:{}", request.owner_user_id, action.as_str()))
            {
                Ok(()) => self.execute(&request).await,
                Err(remaining) => Ok(ActionResult::skipped(
                    RepairSkip::Throttled,
                    json!({ "retry_after_secs": retry_after_secs(remaining) }),
                )),
            }
        };
        let took_ms = started.elapsed().as_millis() as u64;

        let (ok, details) = match &result {
            Ok(result) => (true, result.details.clone()),
            Err(err) => (false, json!({ "error": err.to_string() })),
        };
        let outcome_label = match &result {
            Ok(ActionResult { skipped: Some(_), .. }) => "skipped",
            Ok(_) => "done",
            Err(_) => "failed",
        };
        if let Some(metrics) = INSIGHTS_METRICS.get() {
            metrics
                .orchestrator_tasks_total
                .get_or_create(&TaskLabels {
                    task: action.as_str(),
                    outcome: outcome_label,
                })
                .inc();
        }
        if let Err(err) = &result {
            warn!(
                event = "repair_failed",
                action = action.as_str(),
                owner_user_id = %request.owner_user_id,
                dry_run = request.dry_run,
                error = %err,
                "repair action failed"
            );
        } else {
            info!(
                event = "repair_finished",
                action = action.as_str(),
                owner_user_id = %request.owner_user_id,
                dry_run = request.dry_run,
                outcome = outcome_label,
                took_ms,
                "repair action finished"
            );
        }

        record_best_effort(
            self.audit.as_ref(),
            AuditRecord {
                owner_user_id: Some(request.owner_user_id.clone()),
                kind: "repair",
                action: action.as_str().to_string(),
                ok,
                details: json!({
                    "dry_run": request.dry_run,
                    "details": details,
                    "took_ms": took_ms,
                }),
            },
        )
        .await;

        let result = result?;
        Ok(RepairOutcome {
            ok,
            action,
            dry_run: request.dry_run,
            skipped: result.skipped,
            details: result.details,
            took_ms,
        })
    }

    async fn execute(&self, request: &RepairRequest) -> Result<ActionResult, ReconcileError> {
        match request.action {
            RepairAction::UnlockThumbs => self.unlock_thumbs(request.dry_run).await,
            RepairAction::FixOwnerCard => {
                self.fix_owner_card(&request.owner_user_id, request.dry_run)
                    .await
            }
            RepairAction::SnapshotToday => match &request.target {
                Some(target) => {
                    self.snapshot_today(target, request.today, request.dry_run)
                        .await
                }
                None => Ok(ActionResult::skipped(RepairSkip::NoAccount, json!({}))),
            },
        }
    }

    async fn unlock_thumbs(&self, dry_run: bool) -> Result<ActionResult, ReconcileError> {
        let stale_after = chrono::Duration::from_std(self.thumbnail_lock_stale_after)
            .unwrap_or_else(|_| chrono::Duration::seconds(600));
        let stale_before = Utc::now() - stale_after;
        let count = self
            .store
            .release_stale_thumbnail_locks(stale_before, dry_run)
            .await?;
        let details = if dry_run {
            json!({ "would_release": count, "stale_before": stale_before })
        } else {
            json!({ "released": count, "stale_before": stale_before })
        };
        Ok(ActionResult::done(details))
    }

    async fn fix_owner_card(&self, owner: &str, dry_run: bool) -> Result<ActionResult, ReconcileError> {
        let cards = self.store.owner_cards(owner).await?;
        let Some(keep) = choose_owner_card(&cards) else {
            return Ok(ActionResult::skipped(RepairSkip::NoCards, json!({})));
        };

        let to_clear: Vec<&str> = cards
            .iter()
            .filter(|card| card.is_owner_card && card.id != keep.id)
            .map(|card| card.id.as_str())
            .collect();
        if keep.is_owner_card && to_clear.is_empty() {
            return Ok(ActionResult::skipped(
                RepairSkip::AlreadyOk,
                json!({ "kept": keep.id }),
            ));
        }

        if !dry_run {
            self.store.set_owner_card(owner, &keep.id).await?;
        }
        Ok(ActionResult::done(json!({
            "kept": keep.id,
            "cleared": to_clear,
            "flagged_kept": !keep.is_owner_card,
        })))
    }

    async fn snapshot_today(
        &self,
        target: &RepairTarget,
        today: NaiveDate,
        dry_run: bool,
    ) -> Result<ActionResult, ReconcileError> {
        let existing = self
            .reconciler
            .store()
            .load_day(&target.account, today)
            .await?;
        if existing.as_ref().is_some_and(|row| row.is_complete()) {
            return Ok(ActionResult::skipped(
                RepairSkip::AlreadyOk,
                json!({ "day": today }),
            ));
        }
        if dry_run {
            return Ok(ActionResult::done(json!({
                "day": today,
                "would_write": true,
                "placeholder": existing.is_some(),
            })));
        }

        let session = self
            .reconciler
            .fetcher()
            .open_session(&target.account, &target.credential)
            .await?;
        let outcome = self
            .reconciler
            .ensure_day(&target.account, &session, today, SnapshotSource::Repair, today)
            .await?;
        if outcome.wrote {
            self.coalescer.invalidate_account(&target.account.account_id).await;
        }
        Ok(ActionResult::done(json!({
            "day": today,
            "wrote": outcome.wrote,
            "no_data": outcome.reason == EnsureReason::NoData,
        })))
    }
}

#[cfg(test)]
#[path = "repair_tests.rs"]
mod tests;

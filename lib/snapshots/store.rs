use std::collections::HashSet;
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use diesel::insert_into;
use diesel::pg::upsert::excluded;
use diesel::dsl::sql;
use diesel::prelude::*;
use diesel::sql_types::{BigInt, Bool, Date, Nullable};
use diesel_async::RunQueryDsl;
use futures::future::BoxFuture;

use super::types::{DailySnapshot, SnapshotSource};
use crate::accounts::Account;
use crate::db::models::{DailySnapshotRow, NewFollowerSnapshot};
use crate::db::schema::{daily_snapshots, follower_snapshots};
use crate::db::{map_diesel_error, map_pool_error, DbPool, StoreError};
use crate::insights::DayWindow;

/// Durable per-account daily snapshots. Every call is scoped by the account's full identity.
pub trait SnapshotStore: Send + Sync {
    /// Rows inside `window`, ascending by day.
    fn load_range<'a>(
        &'a self,
        account: &'a Account,
        window: DayWindow,
    ) -> BoxFuture<'a, Result<Vec<DailySnapshot>, StoreError>>;

    /// Upserts `rows`. Complete rows before `today` are left untouched, and a known reach is
    /// never replaced by a null one. Returns the rows actually inserted or updated.
    fn upsert_days<'a>(
        &'a self,
        account: &'a Account,
        rows: &'a [DailySnapshot],
        today: NaiveDate,
    ) -> BoxFuture<'a, Result<usize, StoreError>>;

    fn record_followers<'a>(
        &'a self,
        account: &'a Account,
        day: NaiveDate,
        followers_count: i64,
    ) -> BoxFuture<'a, Result<(), StoreError>>;

    fn load_day<'a>(
        &'a self,
        account: &'a Account,
        day: NaiveDate,
    ) -> BoxFuture<'a, Result<Option<DailySnapshot>, StoreError>> {
        Box::pin(async move {
            let rows = self.load_range(account, DayWindow::single(day)).await?;
            Ok(rows.into_iter().find(|row| row.day == day))
        })
    }
}

impl<T> SnapshotStore for Arc<T>
where
    T: SnapshotStore + ?Sized,
{
    fn load_range<'a>(
        &'a self,
        account: &'a Account,
        window: DayWindow,
    ) -> BoxFuture<'a, Result<Vec<DailySnapshot>, StoreError>> {
        (**self).load_range(account, window)
    }

    fn upsert_days<'a>(
        &'a self,
        account: &'a Account,
        rows: &'a [DailySnapshot],
        today: NaiveDate,
    ) -> BoxFuture<'a, Result<usize, StoreError>> {
        (**self).upsert_days(account, rows, today)
    }

    fn record_followers<'a>(
        &'a self,
        account: &'a Account,
        day: NaiveDate,
        followers_count: i64,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        (**self).record_followers(account, day, followers_count)
    }
}

pub struct PgSnapshotStore {
    pool: DbPool,
}

impl PgSnapshotStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn to_row(account: &Account, snapshot: &DailySnapshot) -> DailySnapshotRow {
    DailySnapshotRow {
        owner_user_id: account.owner_user_id.clone(),
        ig_user_id: account.platform_user_id.clone(),
        page_id: account.page_id.clone(),
        day: snapshot.day,
        account_id: account.account_id.clone(),
        reach: snapshot.reach,
        impressions: snapshot.impressions,
        total_interactions: snapshot.total_interactions,
        accounts_engaged: snapshot.accounts_engaged,
        source_used: snapshot.source_used.as_str().to_string(),
        wrote_at: snapshot.wrote_at,
    }
}

fn from_row(row: DailySnapshotRow) -> Result<DailySnapshot, StoreError> {
    Ok(DailySnapshot {
        day: row.day,
        reach: row.reach,
        impressions: row.impressions,
        total_interactions: row.total_interactions,
        accounts_engaged: row.accounts_engaged,
        source_used: row.source_used.parse::<SnapshotSource>()?,
        wrote_at: row.wrote_at,
    })
}

/// Keeps the last row per day so one upsert never touches the same conflict key twice.
pub(crate) fn dedupe_by_day(rows: &[DailySnapshot]) -> Vec<DailySnapshot> {
    let mut seen: HashSet<NaiveDate> = HashSet::with_capacity(rows.len());
    let mut unique: Vec<DailySnapshot> = rows
        .iter()
        .rev()
        .filter(|row| seen.insert(row.day))
        .cloned()
        .collect();
    unique.reverse();
    unique
}

impl SnapshotStore for PgSnapshotStore {
    fn load_range<'a>(
        &'a self,
        account: &'a Account,
        window: DayWindow,
    ) -> BoxFuture<'a, Result<Vec<DailySnapshot>, StoreError>> {
        Box::pin(async move {
            let mut conn = self.pool.get().await.map_err(map_pool_error)?;
            let rows = daily_snapshots::table
                .filter(daily_snapshots::owner_user_id.eq(&account.owner_user_id))
                .filter(daily_snapshots::ig_user_id.eq(&account.platform_user_id))
                .filter(daily_snapshots::page_id.eq(&account.page_id))
                .filter(daily_snapshots::day.between(window.since, window.until))
                .order(daily_snapshots::day.asc())
                .select(DailySnapshotRow::as_select())
                .load::<DailySnapshotRow>(&mut conn)
                .await
                .map_err(map_diesel_error)?;

            rows.into_iter().map(from_row).collect()
        })
    }

    fn upsert_days<'a>(
        &'a self,
        account: &'a Account,
        rows: &'a [DailySnapshot],
        today: NaiveDate,
    ) -> BoxFuture<'a, Result<usize, StoreError>> {
        Box::pin(async move {
            use diesel::query_dsl::methods::FilterDsl;

            if rows.is_empty() {
                return Ok(0);
            }

            let batch: Vec<DailySnapshotRow> = dedupe_by_day(rows)
                .iter()
                .map(|snapshot| to_row(account, snapshot))
                .collect();
            let mut conn = self.pool.get().await.map_err(map_pool_error)?;

            // Only placeholders and rows on or after `today` may be rewritten. Rows the
            // guard skips are not counted by Postgres.
            insert_into(daily_snapshots::table)
                .values(&batch)
                .on_conflict((
                    daily_snapshots::owner_user_id,
                    daily_snapshots::ig_user_id,
                    daily_snapshots::page_id,
                    daily_snapshots::day,
                ))
                .do_update()
                .set((
                    daily_snapshots::account_id.eq(excluded(daily_snapshots::account_id)),
                    daily_snapshots::reach.eq(sql::<Nullable<BigInt>>(
                        "COALESCE(EXCLUDED.reach, daily_snapshots.reach)",
                    )),
                    daily_snapshots::impressions.eq(excluded(daily_snapshots::impressions)),
                    daily_snapshots::total_interactions
                        .eq(excluded(daily_snapshots::total_interactions)),
                    daily_snapshots::accounts_engaged
                        .eq(excluded(daily_snapshots::accounts_engaged)),
                    daily_snapshots::source_used.eq(excluded(daily_snapshots::source_used)),
                    daily_snapshots::wrote_at.eq(excluded(daily_snapshots::wrote_at)),
                ))
                .filter(
                    sql::<Bool>("(daily_snapshots.reach IS NULL OR daily_snapshots.day >= ")
                        .bind::<Date, _>(today)
                        .sql(")"),
                )
                .execute(&mut conn)
                .await
                .map_err(map_diesel_error)
        })
    }

    fn record_followers<'a>(
        &'a self,
        account: &'a Account,
        day: NaiveDate,
        followers_count: i64,
    ) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            let mut conn = self.pool.get().await.map_err(map_pool_error)?;
            let row = NewFollowerSnapshot {
                owner_user_id: account.owner_user_id.clone(),
                ig_user_id: account.platform_user_id.clone(),
                day,
                followers_count,
                wrote_at: Utc::now(),
            };

            insert_into(follower_snapshots::table)
                .values(&row)
                .on_conflict((
                    follower_snapshots::owner_user_id,
                    follower_snapshots::ig_user_id,
                    follower_snapshots::day,
                ))
                .do_update()
                .set((
                    follower_snapshots::followers_count
                        .eq(excluded(follower_snapshots::followers_count)),
                    follower_snapshots::wrote_at.eq(excluded(follower_snapshots::wrote_at)),
                ))
                .execute(&mut conn)
                .await
                .map_err(map_diesel_error)?;

            Ok(())
        })
    }
}

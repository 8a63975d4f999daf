use chrono::{DateTime, NaiveDate, Utc};
use diesel::prelude::*;

use super::schema::{
    creator_cards, daily_snapshots, follower_snapshots, ig_accounts, ops_audit_events,
};

#[derive(Queryable, Selectable, Insertable, Debug, Clone, PartialEq, Eq)]
#[diesel(table_name = daily_snapshots)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct DailySnapshotRow {
    pub owner_user_id: String,
    pub ig_user_id: String,
    pub page_id: String,
    pub day: NaiveDate,
    pub account_id: String,
    pub reach: Option<i64>,
    pub impressions: i64,
    pub total_interactions: i64,
    pub accounts_engaged: i64,
    pub source_used: String,
    pub wrote_at: DateTime<Utc>,
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = follower_snapshots)]
pub struct NewFollowerSnapshot {
    pub owner_user_id: String,
    pub ig_user_id: String,
    pub day: NaiveDate,
    pub followers_count: i64,
    pub wrote_at: DateTime<Utc>,
}

#[derive(Queryable, Selectable, Debug, Clone)]
#[diesel(table_name = ig_accounts)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct IgAccountRow {
    pub id: String,
    pub owner_user_id: String,
    pub ig_user_id: String,
    pub page_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Queryable, Selectable, Debug, Clone)]
#[diesel(table_name = creator_cards)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct CreatorCardRow {
    pub id: String,
    pub owner_user_id: String,
    pub is_owner_card: bool,
    pub updated_at: DateTime<Utc>,
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = ops_audit_events)]
pub struct NewAuditEvent {
    pub owner_user_id: Option<String>,
    pub kind: String,
    pub action: String,
    pub ok: bool,
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

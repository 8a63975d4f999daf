use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::db::StoreError;
use crate::insights::{DayBucket, FetchError};

/// Provenance tag stored with every snapshot row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotSource {
    GraphSeed,
    BackfillGraph,
    Prewarm,
    Repair,
    CronPrewarm,
}

impl SnapshotSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::GraphSeed => "graph_seed",
            Self::BackfillGraph => "backfill_graph",
            Self::Prewarm => "prewarm",
            Self::Repair => "repair",
            Self::CronPrewarm => "cron_prewarm",
        }
    }
}

impl FromStr for SnapshotSource {
    type Err = StoreError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "graph_seed" => Ok(Self::GraphSeed),
            "backfill_graph" => Ok(Self::BackfillGraph),
            "prewarm" => Ok(Self::Prewarm),
            "repair" => Ok(Self::Repair),
            "cron_prewarm" => Ok(Self::CronPrewarm),
            other => Err(StoreError::Fatal(format!(
                "unknown snapshot source_used value: {other}"
            ))),
        }
    }
}

/// One UTC day of aggregate metrics for one account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DailySnapshot {
    pub day: NaiveDate,
    pub reach: Option<i64>,
    pub impressions: i64,
    pub total_interactions: i64,
    pub accounts_engaged: i64,
    pub source_used: SnapshotSource,
    pub wrote_at: DateTime<Utc>,
}

impl DailySnapshot {
    pub fn from_bucket(
        day: NaiveDate,
        bucket: &DayBucket,
        source_used: SnapshotSource,
        wrote_at: DateTime<Utc>,
    ) -> Self {
        Self {
            day,
            reach: bucket.reach,
            impressions: bucket.impressions,
            total_interactions: bucket.total_interactions,
            accounts_engaged: bucket.accounts_engaged,
            source_used,
            wrote_at,
        }
    }

    /// Rows with a resolved reach. Complete rows before today are never rewritten.
    pub fn is_complete(&self) -> bool {
        self.reach.is_some()
    }

    /// Today's row stays mutable even once reach is known.
    pub fn is_final(&self, today: NaiveDate) -> bool {
        self.is_complete() && self.day < today
    }

    pub fn to_bucket(&self) -> DayBucket {
        DayBucket {
            reach: self.reach,
            impressions: self.impressions,
            total_interactions: self.total_interactions,
            accounts_engaged: self.accounts_engaged,
        }
    }
}

/// Failure of an operation that talks to both the upstream and the store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    #[error("upstream fetch failed: {0}")]
    Upstream(#[from] FetchError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

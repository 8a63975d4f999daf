use std::collections::BTreeMap;

use chrono::{Days, NaiveDate};
use serde::Serialize;

use super::normalize::to_count;
use super::types::{MetricSeries, MetricTotal};

/// Per-day values before persistence. `reach == None` means upstream had nothing for the day.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DayBucket {
    pub reach: Option<i64>,
    pub impressions: i64,
    pub total_interactions: i64,
    pub accounts_engaged: i64,
}

pub type DayBuckets = BTreeMap<NaiveDate, DayBucket>;

/// Buckets series points by the UTC date of their `end_time`.
///
/// The day set is the union across every series. `views` wins over `impressions` regardless
/// of the order the series arrive in.
pub fn merge_series(series: &[MetricSeries]) -> DayBuckets {
    let mut buckets = DayBuckets::new();
    let mut impressions_from_views: BTreeMap<NaiveDate, bool> = BTreeMap::new();

    for metric in series {
        for point in &metric.points {
            let date = point.end_time.date_naive();
            let bucket = buckets.entry(date).or_default();
            let Some(value) = point.value else {
                continue;
            };
            let count = to_count(value);

            match metric.name.as_str() {
                "reach" => bucket.reach = Some(count),
                "views" => {
                    bucket.impressions = count;
                    impressions_from_views.insert(date, true);
                }
                "impressions" => {
                    if !impressions_from_views.get(&date).copied().unwrap_or(false) {
                        bucket.impressions = count;
                    }
                }
                "total_interactions" => bucket.total_interactions = count,
                "accounts_engaged" => bucket.accounts_engaged = count,
                _ => {}
            }
        }
    }

    buckets
}

/// Writes window totals onto `day`. Missing totals leave the existing values untouched.
pub fn apply_totals(buckets: &mut DayBuckets, day: NaiveDate, totals: &[MetricTotal]) {
    let bucket = buckets.entry(day).or_default();
    for total in totals {
        let Some(value) = total.value else {
            continue;
        };
        match total.name.as_str() {
            "total_interactions" => bucket.total_interactions = value,
            "accounts_engaged" => bucket.accounts_engaged = value,
            _ => {}
        }
    }
}

/// One row of the read payload, always present for every day in the requested range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DailyPoint {
    pub date: NaiveDate,
    pub reach: i64,
    pub impressions: i64,
    pub interactions: i64,
    pub engaged_accounts: i64,
}

impl DailyPoint {
    pub fn zero(date: NaiveDate) -> Self {
        Self {
            date,
            reach: 0,
            impressions: 0,
            interactions: 0,
            engaged_accounts: 0,
        }
    }

    pub fn from_bucket(date: NaiveDate, bucket: &DayBucket) -> Self {
        Self {
            date,
            reach: bucket.reach.unwrap_or(0),
            impressions: bucket.impressions,
            interactions: bucket.total_interactions,
            engaged_accounts: bucket.accounts_engaged,
        }
    }
}

/// Exactly `days` points ending at `until`, ascending, zero-filled where no bucket exists.
pub fn pad_points(buckets: &DayBuckets, until: NaiveDate, days: u32) -> Vec<DailyPoint> {
    let span = u64::from(days.max(1) - 1);
    let Some(since) = until.checked_sub_days(Days::new(span)) else {
        return Vec::new();
    };

    since
        .iter_days()
        .take(days as usize)
        .map(|date| match buckets.get(&date) {
            Some(bucket) => DailyPoint::from_bucket(date, bucket),
            None => DailyPoint::zero(date),
        })
        .collect()
}

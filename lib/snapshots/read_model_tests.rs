use std::sync::Arc;

use super::{normalize_read_days, PointsSource, SnapshotReader};
use crate::insights::{FetchError, FetchErrorKind, MetricFamily, MetricFetcher};
use crate::snapshots::reconciler::SnapshotReconciler;
use crate::snapshots::types::ReconcileError;
use crate::test_support::{
    day, daily_responder, fast_retry_policy, steady_responder, test_account, test_session,
    MemorySnapshotStore, ScriptedSource,
};

fn reader(source: &Arc<ScriptedSource>, store: &Arc<MemorySnapshotStore>) -> SnapshotReader {
    SnapshotReader::new(SnapshotReconciler::new(
        MetricFetcher::new(source.clone(), fast_retry_policy()),
        store.clone(),
    ))
}

#[test]
fn read_days_are_clamped() {
    assert_eq!(normalize_read_days(None), 7);
    assert_eq!(normalize_read_days(Some(0)), 1);
    assert_eq!(normalize_read_days(Some(365)), 120);
}

#[tokio::test]
async fn points_always_match_requested_length() {
    let sparse = daily_responder(|d| (d == day("2024-06-12")).then_some(5.0));
    let source = Arc::new(ScriptedSource::new(sparse));
    let store = Arc::new(MemorySnapshotStore::default());
    let reader = reader(&source, &store);

    for days in [1, 7, 31, 120] {
        let report = reader
            .read(&test_account(), &test_session(), days, day("2024-06-15"))
            .await
            .expect("read");
        assert_eq!(report.points.len(), days as usize);
        assert_eq!(report.points.last().map(|p| p.date), Some(day("2024-06-15")));
    }
}

#[tokio::test]
async fn complete_history_is_served_from_the_store() {
    let source = Arc::new(ScriptedSource::new(steady_responder(Some(1.0), 1.0)));
    let store = Arc::new(MemorySnapshotStore::default());
    let account = test_account();
    for offset in 1..=6u64 {
        let d = day("2024-06-15") - chrono::Days::new(offset);
        store.seed(&account, d, Some(100 + offset as i64));
    }

    let report = reader(&source, &store)
        .read(&account, &test_session(), 7, day("2024-06-15"))
        .await
        .expect("read");

    assert_eq!(report.points_source, PointsSource::Db);
    assert!(source.series_calls().is_empty());
    assert_eq!(report.points[5].reach, 101);
    assert_eq!(report.points[6].reach, 0);
}

#[tokio::test]
async fn missing_history_is_fetched_and_seeded_without_today() {
    let source = Arc::new(ScriptedSource::new(steady_responder(Some(42.0), 80.0)));
    let store = Arc::new(MemorySnapshotStore::default());
    let account = test_account();

    let report = reader(&source, &store)
        .read(&account, &test_session(), 7, day("2024-06-15"))
        .await
        .expect("read");

    assert_eq!(report.points_source, PointsSource::GraphSeries);
    assert!(report.points_ok);
    assert!(report.points.iter().all(|point| point.reach == 42));
    assert_eq!(report.points[6].impressions, 80);
    assert!(store.row(&account, day("2024-06-09")).is_some());
    assert!(store.row(&account, day("2024-06-15")).is_none());
}

#[tokio::test]
async fn stored_rows_win_over_fresh_upstream_values() {
    let source = Arc::new(ScriptedSource::new(steady_responder(Some(42.0), 80.0)));
    let store = Arc::new(MemorySnapshotStore::default());
    let account = test_account();
    store.seed(&account, day("2024-06-10"), Some(7));

    let report = reader(&source, &store)
        .read(&account, &test_session(), 7, day("2024-06-15"))
        .await
        .expect("read");

    let point = report
        .points
        .iter()
        .find(|point| point.date == day("2024-06-10"))
        .expect("point");
    assert_eq!(point.reach, 7);
}

#[tokio::test]
async fn empty_upstream_and_store_reports_empty() {
    let source = Arc::new(ScriptedSource::new(|_| Ok(Vec::new())));
    let store = Arc::new(MemorySnapshotStore::default());

    let report = reader(&source, &store)
        .read(&test_account(), &test_session(), 7, day("2024-06-15"))
        .await
        .expect("read");

    assert_eq!(report.points_source, PointsSource::Empty);
    assert_eq!(report.points.len(), 7);
    assert!(report.points.iter().all(|point| point.reach == 0));
}

#[tokio::test]
async fn rate_limits_fail_the_read() {
    let source = Arc::new(ScriptedSource::new(|_| {
        Err(FetchError::new(FetchErrorKind::RateLimited, "rate limit reached"))
    }));
    let store = Arc::new(MemorySnapshotStore::default());

    let err = reader(&source, &store)
        .read(&test_account(), &test_session(), 7, day("2024-06-15"))
        .await
        .expect_err("rate limited");

    assert!(matches!(err, ReconcileError::Upstream(ref e) if e.is_rate_limited()));
}

#[tokio::test]
async fn other_upstream_failures_degrade_to_padded_points() {
    let source = Arc::new(ScriptedSource::new(|_| {
        Err(FetchError::new(FetchErrorKind::UpstreamUnavailable, "status 503"))
    }));
    let store = Arc::new(MemorySnapshotStore::default());
    let account = test_account();
    store.seed(&account, day("2024-06-11"), Some(9));

    let report = reader(&source, &store)
        .read(&account, &test_session(), 7, day("2024-06-15"))
        .await
        .expect("degraded read");

    assert!(!report.points_ok);
    assert_eq!(report.points_source, PointsSource::Db);
    assert_eq!(report.points.len(), 7);
    assert!(report
        .insights_daily
        .iter()
        .all(|total| total.total_value.value.is_none()));
}

#[tokio::test]
async fn window_totals_are_reported_by_name() {
    let source = Arc::new(ScriptedSource::new(steady_responder(Some(42.0), 80.0)));
    let store = Arc::new(MemorySnapshotStore::default());

    let report = reader(&source, &store)
        .read(&test_account(), &test_session(), 7, day("2024-06-15"))
        .await
        .expect("read");

    let names: Vec<&str> = report
        .insights_daily
        .iter()
        .map(|total| total.name.as_str())
        .collect();
    assert_eq!(
        names,
        vec!["total_interactions", "accounts_engaged", "profile_views"]
    );
    assert_eq!(report.insights_daily[0].total_value.value, Some(5));
    assert!(source
        .calls()
        .iter()
        .any(|call| call.family == MetricFamily::Totals && call.window.day_count() == 7));
}

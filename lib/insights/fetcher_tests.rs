use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::MetricFetcher;
use crate::insights::types::{FetchError, FetchErrorKind, MetricFamily, RetryPolicy};
use crate::insights::window::DayWindow;
use crate::test_support::{
    day, fast_retry_policy, steady_responder, test_account, ScriptedSource,
};

fn rejects_views() -> ScriptedSource {
    let steady = steady_responder(Some(40.0), 90.0);
    ScriptedSource::new(move |request| {
        if request.metrics.contains(&"views") || request.metrics.contains(&"profile_views") {
            return Err(FetchError::new(
                FetchErrorKind::UnsupportedMetric,
                "(#100) metric[1] must be one of the following values",
            ));
        }
        steady(request)
    })
}

fn fetcher(source: &Arc<ScriptedSource>) -> MetricFetcher {
    MetricFetcher::new(source.clone(), fast_retry_policy())
}

fn session() -> crate::insights::types::GraphSession {
    crate::insights::types::GraphSession {
        ig_user_id: "1789".to_string(),
        token: "user-token".to_string(),
    }
}

#[tokio::test]
async fn rejected_metric_list_falls_back_exactly_once() {
    let source = Arc::new(rejects_views());
    let window = DayWindow::ending_at(day("2024-06-14"), 7);

    let fetched = fetcher(&source)
        .fetch_series(&session(), window)
        .await
        .expect("fallback should succeed");

    assert!(fetched.used_fallback);
    let calls = source.series_calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].metrics, vec!["reach", "views"]);
    assert_eq!(calls[1].metrics, vec!["reach"]);
    assert_eq!(fetched.series.len(), 1);
    assert_eq!(fetched.series[0].name, "reach");
    assert_eq!(fetched.series[0].points.len(), 7);
}

#[tokio::test]
async fn long_windows_are_split_into_contiguous_chunks() {
    let source = Arc::new(ScriptedSource::new(steady_responder(Some(10.0), 20.0)));
    let window = DayWindow::ending_at(day("2024-06-14"), 95);

    let fetched = fetcher(&source)
        .fetch_series(&session(), window)
        .await
        .expect("series fetch");

    assert_eq!(fetched.chunks, 4);
    let windows: Vec<DayWindow> = source.series_calls().iter().map(|c| c.window).collect();
    let sizes: Vec<i64> = windows.iter().map(DayWindow::day_count).collect();
    assert_eq!(sizes, vec![30, 30, 30, 5]);
    assert_eq!(windows[0].since, window.since);
    assert_eq!(windows[3].until, window.until);
    for pair in windows.windows(2) {
        assert_eq!(pair[0].until.succ_opt(), Some(pair[1].since));
    }

    let reach = fetched
        .series
        .iter()
        .find(|series| series.name == "reach")
        .expect("reach series");
    assert_eq!(reach.points.len(), 95);
}

#[tokio::test]
async fn fallback_stays_active_for_later_chunks() {
    let source = Arc::new(rejects_views());
    let window = DayWindow::ending_at(day("2024-06-14"), 95);

    fetcher(&source)
        .fetch_series(&session(), window)
        .await
        .expect("series fetch");

    let calls = source.series_calls();
    assert_eq!(calls.len(), 5);
    assert!(calls[1..].iter().all(|call| call.metrics == vec!["reach"]));
}

#[tokio::test]
async fn rejected_fallback_surfaces_the_error() {
    let source = Arc::new(ScriptedSource::new(|_| {
        Err(FetchError::new(
            FetchErrorKind::UnsupportedMetric,
            "invalid metric",
        ))
    }));

    let err = fetcher(&source)
        .fetch_series(&session(), DayWindow::single(day("2024-06-14")))
        .await
        .expect_err("both lists rejected");

    assert_eq!(err.kind, FetchErrorKind::UnsupportedMetric);
    assert_eq!(source.series_calls().len(), 2);
}

#[tokio::test]
async fn rate_limits_are_not_retried_or_masked() {
    let source = Arc::new(ScriptedSource::new(|_| {
        Err(
            FetchError::new(FetchErrorKind::RateLimited, "too many calls")
                .with_retry_after(Some(Duration::from_secs(60))),
        )
    }));
    let retrying = MetricFetcher::new(
        source.clone(),
        RetryPolicy {
            max_attempts: 3,
            ..fast_retry_policy()
        },
    );

    let err = retrying
        .fetch_series(&session(), DayWindow::single(day("2024-06-14")))
        .await
        .expect_err("rate limited");

    assert!(err.is_rate_limited());
    assert_eq!(err.retry_after, Some(Duration::from_secs(60)));
    assert_eq!(source.series_calls().len(), 1);
}

#[tokio::test]
async fn transient_failures_are_retried_within_one_call() {
    let failures = Arc::new(AtomicUsize::new(0));
    let steady = steady_responder(Some(10.0), 20.0);
    let seen = failures.clone();
    let source = Arc::new(ScriptedSource::new(move |request| {
        if seen.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(FetchError::new(FetchErrorKind::Network, "connection reset"));
        }
        steady(request)
    }));
    let retrying = MetricFetcher::new(
        source.clone(),
        RetryPolicy {
            max_attempts: 2,
            ..fast_retry_policy()
        },
    );

    let fetched = retrying
        .fetch_series(&session(), DayWindow::single(day("2024-06-14")))
        .await
        .expect("second attempt succeeds");

    assert!(!fetched.used_fallback);
    assert_eq!(source.series_calls().len(), 2);
}

#[tokio::test]
async fn totals_failure_degrades_to_nulls() {
    let steady = steady_responder(Some(10.0), 20.0);
    let source = Arc::new(ScriptedSource::new(move |request| {
        if request.family == MetricFamily::Totals {
            return Err(FetchError::new(
                FetchErrorKind::UpstreamUnavailable,
                "status 503",
            ));
        }
        steady(request)
    }));
    let fetcher = fetcher(&source);
    let window = DayWindow::single(day("2024-06-14"));

    let totals = fetcher.fetch_totals(&session(), window).await;
    let series = fetcher
        .fetch_series(&session(), window)
        .await
        .expect("series unaffected by totals failure");

    assert!(totals.failure.is_some());
    assert!(totals.totals.iter().all(|total| total.value.is_none()));
    assert_eq!(totals.totals.len(), 3);
    assert!(!series.series.is_empty());
}

#[tokio::test]
async fn totals_fallback_drops_profile_views() {
    let source = Arc::new(rejects_views());

    let totals = fetcher(&source)
        .fetch_totals(&session(), DayWindow::single(day("2024-06-14")))
        .await;

    assert!(totals.failure.is_none());
    assert_eq!(totals.value_of("total_interactions"), Some(5));
    assert_eq!(totals.value_of("accounts_engaged"), Some(3));
    assert_eq!(totals.value_of("profile_views"), None);
}

#[tokio::test]
async fn totals_are_summed_across_chunks() {
    let source = Arc::new(ScriptedSource::new(steady_responder(Some(10.0), 20.0)));

    let totals = fetcher(&source)
        .fetch_totals(&session(), DayWindow::ending_at(day("2024-06-14"), 60))
        .await;

    assert_eq!(source.totals_calls().len(), 2);
    assert_eq!(totals.value_of("total_interactions"), Some(10));
}

#[tokio::test]
async fn page_token_failure_is_fatal_before_any_metric_call() {
    let source = Arc::new(
        ScriptedSource::new(steady_responder(Some(10.0), 20.0)).with_page_token(Err(
            FetchError::new(FetchErrorKind::Unauthorized, "Error validating access token"),
        )),
    );
    let mut account = test_account();
    account.page_id = "page-1".to_string();

    let err = fetcher(&source)
        .open_session(&account, "user-token")
        .await
        .expect_err("token resolution fails");

    assert_eq!(err.kind, FetchErrorKind::Unauthorized);
    assert_eq!(source.page_token_calls(), 1);
    assert!(source.calls().is_empty());
}

#[tokio::test]
async fn accounts_without_page_use_the_credential_directly() {
    let source = Arc::new(ScriptedSource::new(steady_responder(Some(10.0), 20.0)));

    let session = fetcher(&source)
        .open_session(&test_account(), "user-token")
        .await
        .expect("session");

    assert_eq!(session.token, "user-token");
    assert_eq!(source.page_token_calls(), 0);
}

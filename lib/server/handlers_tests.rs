use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Bytes};
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::{
    backfill, cron_prewarm, daily_snapshot, prewarm, repair, SnapshotQuery, CACHE_STATUS_HEADER,
};
use crate::accounts::StaticAccountDirectory;
use crate::coalescer::{CachedSnapshotReader, CoalescerConfig, ResponseCoalescer};
use crate::insights::{FetchError, FetchErrorKind, MetricFetcher};
use crate::orchestrator::{
    AuditSink, CookieThrottle, CronPrewarm, NoopThumbnailWarmer, Prewarmer, Repairer,
};
use crate::server::credentials::CredentialConfig;
use crate::snapshots::{BackfillPlanner, SnapshotReader, SnapshotReconciler};
use crate::state::{AppState, Services};
use crate::test_support::{
    fast_retry_policy, steady_responder, test_account, MemoryRepairStore, MemorySnapshotStore,
    RecordingAuditSink, ScriptedSource,
};

fn credentials() -> CredentialConfig {
    CredentialConfig {
        cron_secret: Some("s3cret".to_string()),
        env_access_token: Some("env-token".to_string()),
    }
}

fn app_state(source: ScriptedSource, credentials: CredentialConfig) -> Arc<AppState> {
    let store = Arc::new(MemorySnapshotStore::default());
    let fetcher = MetricFetcher::new(Arc::new(source), fast_retry_policy());
    let reconciler = SnapshotReconciler::new(fetcher.clone(), store.clone());
    let coalescer = ResponseCoalescer::new(CoalescerConfig {
        success_ttl: Duration::from_secs(30),
        rate_limited_ttl: Duration::from_secs(10),
        max_entries: 10,
    });
    let snapshots = CachedSnapshotReader::new(
        SnapshotReader::new(reconciler.clone()),
        fetcher.clone(),
        coalescer.clone(),
        "salt",
    );
    let audit: Arc<dyn AuditSink> = Arc::new(RecordingAuditSink::default());

    let services = Services {
        accounts: Arc::new(StaticAccountDirectory::new(test_account())),
        fetcher: fetcher.clone(),
        snapshots: snapshots.clone(),
        backfill: BackfillPlanner::new(fetcher, store),
        prewarmer: Prewarmer::new(
            reconciler.clone(),
            snapshots,
            Arc::new(NoopThumbnailWarmer),
            audit.clone(),
            Duration::from_millis(700),
        ),
        repairer: Repairer::new(
            Arc::new(MemoryRepairStore::default()),
            reconciler.clone(),
            coalescer.clone(),
            audit.clone(),
            Duration::from_secs(60),
            Duration::from_secs(600),
        ),
        cron: CronPrewarm::new(reconciler, coalescer, audit),
        prewarm_throttle: CookieThrottle::new(Duration::from_secs(120)),
        credentials,
        env_account: Some(test_account()),
    };
    Arc::new(AppState::new(services, CancellationToken::new()))
}

fn steady_state() -> Arc<AppState> {
    app_state(
        ScriptedSource::new(steady_responder(Some(10.0), 20.0)),
        credentials(),
    )
}

fn headers(pairs: &[(header::HeaderName, &str)]) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in pairs {
        map.append(name.clone(), HeaderValue::from_str(value).expect("header value"));
    }
    map
}

fn query(days: Option<&str>) -> Query<SnapshotQuery> {
    Query(SnapshotQuery {
        days: days.map(str::to_string),
        ig_account_id: None,
    })
}

async fn json_body(response: Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body readable");
    serde_json::from_slice(&bytes).expect("json body")
}

fn header_str<'a>(response: &'a Response, name: &str) -> Option<&'a str> {
    response
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
}

#[tokio::test]
async fn read_without_any_credential_is_missing_token() {
    let state = app_state(
        ScriptedSource::new(steady_responder(Some(10.0), 20.0)),
        CredentialConfig::default(),
    );

    let response = daily_snapshot(State(state), query(None), HeaderMap::new())
        .await
        .into_response();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(json_body(response).await["error"], "missing_token");
}

#[tokio::test]
async fn env_read_returns_points_with_validator_then_not_modified() {
    let state = steady_state();

    let first = daily_snapshot(State(state.clone()), query(Some("5")), HeaderMap::new())
        .await
        .into_response();
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(header_str(&first, CACHE_STATUS_HEADER), Some("miss"));
    let etag = header_str(&first, "etag").expect("etag set").to_string();
    let body = json_body(first).await;
    assert_eq!(body["ok"], true);
    assert_eq!(body["points"].as_array().map(Vec::len), Some(5));

    let second = daily_snapshot(
        State(state),
        query(Some("5")),
        headers(&[(header::IF_NONE_MATCH, &etag)]),
    )
    .await
    .into_response();
    assert_eq!(second.status(), StatusCode::NOT_MODIFIED);
    assert_eq!(header_str(&second, CACHE_STATUS_HEADER), Some("hit"));
}

#[tokio::test]
async fn rate_limited_read_is_429_with_retry_after() {
    let state = app_state(
        ScriptedSource::new(|_| {
            Err(FetchError::new(FetchErrorKind::RateLimited, "too many calls")
                .with_retry_after(Some(Duration::from_secs(60))))
        }),
        credentials(),
    );

    let response = daily_snapshot(State(state), query(None), HeaderMap::new())
        .await
        .into_response();

    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(header_str(&response, "retry-after"), Some("60"));
    assert_eq!(json_body(response).await["error"], "upstream_rate_limited");
}

#[tokio::test]
async fn non_numeric_days_is_invalid_request() {
    let response = daily_snapshot(State(steady_state()), query(Some("week")), HeaderMap::new())
        .await
        .into_response();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["error"], "invalid_request");
}

#[tokio::test]
async fn session_caller_with_unknown_account_is_not_found() {
    let cookies = headers(&[(
        header::COOKIE,
        "app_user_id=owner-1; ig_account_id=someone-else; ig_access_token=user-token",
    )]);

    let response = daily_snapshot(State(steady_state()), query(None), cookies)
        .await
        .into_response();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(json_body(response).await["error"], "account_not_found");
}

#[tokio::test]
async fn unknown_repair_action_is_rejected() {
    let response = repair(
        State(steady_state()),
        HeaderMap::new(),
        Bytes::from_static(br#"{"action":"reboot"}"#),
    )
    .await
    .into_response();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["error"], "invalid_action");
}

#[tokio::test]
async fn repair_dry_run_answers_with_action_details() {
    let response = repair(
        State(steady_state()),
        HeaderMap::new(),
        Bytes::from_static(br#"{"action":"fix_owner_card","dry_run":true}"#),
    )
    .await
    .into_response();

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["ok"], true);
    assert_eq!(body["action"], "fix_owner_card");
    assert_eq!(body["skipped"], "no_cards");
}

#[tokio::test]
async fn cron_requires_the_shared_secret() {
    let denied = cron_prewarm(State(steady_state()), HeaderMap::new())
        .await
        .into_response();
    assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(json_body(denied).await["error"], "unauthorized_cron");

    let allowed = cron_prewarm(
        State(steady_state()),
        headers(&[(header::AUTHORIZATION, "Bearer s3cret")]),
    )
    .await
    .into_response();
    assert_eq!(allowed.status(), StatusCode::OK);
    let body = json_body(allowed).await;
    assert_eq!(body["ok"], true);
    assert_eq!(body["fallback"], false);
}

#[tokio::test]
async fn second_prewarm_inside_the_window_is_throttled_by_cookie() {
    let state = steady_state();

    let first = prewarm(State(state.clone()), HeaderMap::new(), Bytes::new())
        .await
        .into_response();
    assert_eq!(first.status(), StatusCode::OK);
    let set_cookie = header_str(&first, "set-cookie")
        .expect("throttle cookie set")
        .to_string();
    assert!(set_cookie.starts_with("prewarm_full="));
    assert!(json_body(first).await.get("skipped").is_none());

    let marker = set_cookie
        .split(';')
        .next()
        .expect("cookie pair")
        .to_string();
    let second = prewarm(
        State(state),
        headers(&[(header::COOKIE, &marker)]),
        Bytes::new(),
    )
    .await
    .into_response();
    assert_eq!(json_body(second).await["skipped"], "throttled");
}

#[tokio::test]
async fn backfill_fills_the_requested_lookback() {
    let response = backfill(
        State(steady_state()),
        HeaderMap::new(),
        Bytes::from_static(br#"{"days":3}"#),
    )
    .await
    .into_response();

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["ok"], true);
    assert_eq!(body["lookback_days"], 3);
    assert_eq!(body["inserted"], 2);
    assert_eq!(body["skipped"], 0);
    assert_eq!(body["skipped_no_data"].as_array().map(Vec::len), Some(0));
    assert_eq!(body["missing"].as_array().map(Vec::len), Some(2));
}

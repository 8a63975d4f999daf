use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::credentials::{
    is_cron_request, resolve_credential, CallerCookies, CredentialSource,
};
use super::error::ApiError;
use crate::accounts::Account;
use crate::coalescer::{CoalescedReply, ResponseKind};
use crate::orchestrator::{
    CronReport, PrewarmInput, PrewarmMode, RepairAction, RepairOutcome, RepairRequest,
    RepairTarget, ThrottleDecision,
};
use crate::snapshots::{normalize_lookback, normalize_read_days, BackfillReport};
use crate::state::{AppState, Services};

/// Diagnostics header naming where a read was served from.
pub const CACHE_STATUS_HEADER: &str = "x-insights-cache";

/// The caller's credential and the account it acts on.
#[derive(Debug, Clone)]
pub struct Caller {
    pub source: CredentialSource,
    pub credential: String,
    pub account: Account,
}

async fn resolve_account(
    services: &Services,
    source: CredentialSource,
    cookies: &CallerCookies,
    requested: Option<&str>,
) -> Result<Account, ApiError> {
    match source {
        CredentialSource::Cron | CredentialSource::Env => services
            .env_account
            .clone()
            .filter(|account| {
                requested.map_or(true, |wanted| {
                    wanted == account.account_id || wanted == account.platform_user_id
                })
            })
            .ok_or(ApiError::AccountNotFound),
        CredentialSource::Session => {
            let owner = cookies.owner_user_id().ok_or(ApiError::AccountNotFound)?;
            let wanted = requested.or(cookies.ig_account_id());
            services
                .accounts
                .resolve(owner, wanted)
                .await?
                .ok_or(ApiError::AccountNotFound)
        }
    }
}

async fn resolve_caller(
    services: &Services,
    headers: &HeaderMap,
    requested: Option<&str>,
) -> Result<Caller, ApiError> {
    let cookies = CallerCookies::from_headers(headers);
    let credential = resolve_credential(headers, &cookies, &services.credentials)?;
    let account = resolve_account(services, credential.source, &cookies, requested).await?;
    debug!(
        event = "caller_resolved",
        source = credential.source.as_str(),
        account_id = %account.account_id,
        "resolved caller"
    );
    Ok(Caller {
        source: credential.source,
        credential: credential.token,
        account,
    })
}

/// Empty bodies read as the type's default.
fn parse_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|err| ApiError::InvalidRequest(err.to_string()))
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

#[derive(Debug, Default, Deserialize)]
pub struct SnapshotQuery {
    pub days: Option<String>,
    pub ig_account_id: Option<String>,
}

fn parse_days(raw: Option<&str>) -> Result<u32, ApiError> {
    match non_empty(raw) {
        None => Ok(normalize_read_days(None)),
        Some(raw) => raw
            .parse::<i64>()
            .map(|days| normalize_read_days(Some(days)))
            .map_err(|_| ApiError::InvalidRequest(format!("days must be an integer, got {raw}"))),
    }
}

pub async fn daily_snapshot(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SnapshotQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let days = parse_days(query.days.as_deref())?;
    let services = &state.services;
    let caller = resolve_caller(services, &headers, non_empty(query.ig_account_id.as_deref())).await?;
    let if_none_match = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|value| value.to_str().ok());

    let reply = services
        .snapshots
        .read(
            &caller.account,
            &caller.credential,
            days,
            Utc::now().date_naive(),
            if_none_match,
        )
        .await;
    debug!(
        event = "daily_snapshot_served",
        account_id = %caller.account.account_id,
        days,
        served_from = reply.served_from.as_str(),
        kind = reply.response.kind.as_str(),
        not_modified = reply.not_modified,
        joiners = reply.joiners,
        "served daily snapshot"
    );
    Ok(snapshot_response(reply))
}

fn snapshot_response(reply: CoalescedReply) -> Response {
    let CoalescedReply {
        response,
        served_from,
        not_modified,
        ..
    } = reply;
    let status = match response.kind {
        ResponseKind::Success if not_modified => StatusCode::NOT_MODIFIED,
        ResponseKind::Success => StatusCode::OK,
        ResponseKind::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        ResponseKind::Failed { status } => {
            StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
        }
    };

    let mut builder = Response::builder()
        .status(status)
        .header(CACHE_STATUS_HEADER, served_from.as_str())
        .header(header::CACHE_CONTROL, "private, no-cache");
    match response.kind {
        ResponseKind::Success => {
            builder = builder.header(header::ETAG, response.etag.as_str());
        }
        ResponseKind::RateLimited { retry_after } => {
            builder = builder.header(
                header::RETRY_AFTER,
                retry_after.as_secs().max(1).to_string(),
            );
        }
        ResponseKind::Failed { .. } => {}
    }

    let built = if not_modified {
        builder.body(Body::empty())
    } else {
        builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(response.body.to_string()))
    };
    built.unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct PrewarmBody {
    pub mode: Option<String>,
    pub reason: Option<String>,
    pub ig_account_id: Option<String>,
}

pub async fn prewarm(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let body: PrewarmBody = parse_body(&body)?;
    let mode = match non_empty(body.mode.as_deref()) {
        None => PrewarmMode::Full,
        Some(raw) => raw.parse::<PrewarmMode>().map_err(ApiError::InvalidRequest)?,
    };
    let services = &state.services;
    let cookies = CallerCookies::from_headers(&headers);
    let decision =
        services
            .prewarm_throttle
            .check(&cookies.values, mode.as_str(), Utc::now().timestamp());

    let credential = resolve_credential(&headers, &cookies, &services.credentials).ok();
    let source = credential
        .as_ref()
        .map_or(CredentialSource::Session, |credential| credential.source);
    let account = match resolve_account(
        services,
        source,
        &cookies,
        non_empty(body.ig_account_id.as_deref()),
    )
    .await
    {
        Ok(account) => Some(account),
        Err(ApiError::AccountNotFound) => None,
        Err(err) => return Err(err),
    };

    let report = services
        .prewarmer
        .run(PrewarmInput {
            mode,
            reason: body.reason.unwrap_or_else(|| "manual".to_string()),
            throttled: decision.is_throttled(),
            account,
            credential: credential.map(|credential| credential.token),
            today: Utc::now().date_naive(),
        })
        .await;

    let mut response = Json(&report).into_response();
    if let ThrottleDecision::Allowed { set_cookie } = decision {
        if report.skipped.is_none() {
            if let Ok(value) = HeaderValue::from_str(&set_cookie) {
                response.headers_mut().insert(header::SET_COOKIE, value);
            }
        }
    }
    Ok(response)
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RepairBody {
    pub action: Option<String>,
    pub dry_run: bool,
    pub ig_account_id: Option<String>,
}

pub async fn repair(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<RepairOutcome>, ApiError> {
    let body: RepairBody = parse_body(&body)?;
    let raw_action = non_empty(body.action.as_deref()).unwrap_or_default();
    let action = raw_action
        .parse::<RepairAction>()
        .map_err(|_| ApiError::InvalidAction(raw_action.to_string()))?;

    let services = &state.services;
    let cookies = CallerCookies::from_headers(&headers);
    let credential = resolve_credential(&headers, &cookies, &services.credentials).ok();
    let source = credential
        .as_ref()
        .map_or(CredentialSource::Session, |credential| credential.source);
    let owner_user_id = match source {
        CredentialSource::Session => cookies.owner_user_id().map(str::to_string),
        CredentialSource::Cron | CredentialSource::Env => services
            .env_account
            .as_ref()
            .map(|account| account.owner_user_id.clone()),
    }
    .ok_or(ApiError::AccountNotFound)?;

    let target = if action == RepairAction::SnapshotToday {
        let credential = credential.ok_or(ApiError::MissingToken)?;
        match resolve_account(
            services,
            credential.source,
            &cookies,
            non_empty(body.ig_account_id.as_deref()),
        )
        .await
        {
            Ok(account) => Some(RepairTarget {
                account,
                credential: credential.token,
            }),
            Err(ApiError::AccountNotFound) => None,
            Err(err) => return Err(err),
        }
    } else {
        None
    };

    let outcome = services
        .repairer
        .run(RepairRequest {
            action,
            dry_run: body.dry_run,
            owner_user_id,
            target,
            today: Utc::now().date_naive(),
        })
        .await?;
    Ok(Json(outcome))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct BackfillBody {
    pub days: Option<i64>,
    pub ig_account_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct BackfillResponse {
    pub ok: bool,
    pub account_id: String,
    pub lookback_days: u32,
    #[serde(flatten)]
    pub report: BackfillReport,
}

pub async fn backfill(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<BackfillResponse>, ApiError> {
    let body: BackfillBody = parse_body(&body)?;
    let services = &state.services;
    let caller = resolve_caller(services, &headers, non_empty(body.ig_account_id.as_deref())).await?;
    let lookback_days = normalize_lookback(body.days);

    let session = services
        .fetcher
        .open_session(&caller.account, &caller.credential)
        .await?;
    let report = services
        .backfill
        .run(&caller.account, &session, lookback_days, Utc::now().date_naive())
        .await?;
    if report.inserted > 0 {
        services
            .snapshots
            .coalescer()
            .invalidate_account(&caller.account.account_id)
            .await;
    }
    info!(
        event = "backfill_request_finished",
        account_id = %caller.account.account_id,
        source = caller.source.as_str(),
        lookback_days,
        inserted = report.inserted,
        "backfill request finished"
    );

    Ok(Json(BackfillResponse {
        ok: true,
        account_id: caller.account.account_id,
        lookback_days,
        report,
    }))
}

pub async fn cron_prewarm(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<CronReport>, ApiError> {
    let services = &state.services;
    if !is_cron_request(&headers, &services.credentials) {
        return Err(ApiError::UnauthorizedCron);
    }
    let token = services
        .credentials
        .env_access_token
        .clone()
        .filter(|token| !token.is_empty())
        .ok_or(ApiError::MissingToken)?;
    let account = services
        .env_account
        .clone()
        .ok_or(ApiError::AccountNotFound)?;

    let report = services
        .cron
        .run(&account, &token, Utc::now().date_naive())
        .await?;
    Ok(Json(report))
}

#[cfg(test)]
#[path = "handlers_tests.rs"]
mod tests;

use std::sync::Arc;

use futures::future::BoxFuture;
use governor::{clock::DefaultClock, state::InMemoryState, state::NotKeyed, RateLimiter};
use tracing::{debug, warn};

use super::error_mapping::map_graph_error;
use super::normalize::{series_from_envelope, to_count, to_finite_number_or_null};
use super::retry::{run_with_retry, seed_for};
use super::types::{
    FetchError, FetchErrorKind, GraphSession, MetricFamily, MetricRequest, MetricSeries,
    MetricTotal, RetryPolicy, MAX_WINDOW_DAYS, SERIES_FALLBACK_METRICS, SERIES_METRICS,
    TOTALS_FALLBACK_METRICS, TOTALS_METRICS,
};
use super::window::DayWindow;
use crate::accounts::Account;
use crate::graph_client::{GraphClient, InsightsQuery};
use crate::server::monitoring::{FailureLabels, INSIGHTS_METRICS};

pub type GraphRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Low-level upstream seam. One call covers one window and one metric list.
pub trait InsightsSource: Send + Sync {
    fn fetch_metrics<'a>(
        &'a self,
        request: &'a MetricRequest<'a>,
    ) -> BoxFuture<'a, Result<Vec<MetricSeries>, FetchError>>;

    fn resolve_page_token<'a>(
        &'a self,
        page_id: &'a str,
        user_token: &'a str,
    ) -> BoxFuture<'a, Result<String, FetchError>>;

    fn fetch_followers_count<'a>(
        &'a self,
        ig_user_id: &'a str,
        token: &'a str,
    ) -> BoxFuture<'a, Result<Option<i64>, FetchError>>;
}

impl<T> InsightsSource for Arc<T>
where
    T: InsightsSource + ?Sized,
{
    fn fetch_metrics<'a>(
        &'a self,
        request: &'a MetricRequest<'a>,
    ) -> BoxFuture<'a, Result<Vec<MetricSeries>, FetchError>> {
        (**self).fetch_metrics(request)
    }

    fn resolve_page_token<'a>(
        &'a self,
        page_id: &'a str,
        user_token: &'a str,
    ) -> BoxFuture<'a, Result<String, FetchError>> {
        (**self).resolve_page_token(page_id, user_token)
    }

    fn fetch_followers_count<'a>(
        &'a self,
        ig_user_id: &'a str,
        token: &'a str,
    ) -> BoxFuture<'a, Result<Option<i64>, FetchError>> {
        (**self).fetch_followers_count(ig_user_id, token)
    }
}

/// Graph-backed source sharing one process-wide request budget.
pub struct GraphInsightsSource {
    client: GraphClient,
    rate_limiter: Arc<GraphRateLimiter>,
}

impl GraphInsightsSource {
    pub fn new(client: GraphClient, rate_limiter: Arc<GraphRateLimiter>) -> Self {
        Self {
            client,
            rate_limiter,
        }
    }
}

impl InsightsSource for GraphInsightsSource {
    fn fetch_metrics<'a>(
        &'a self,
        request: &'a MetricRequest<'a>,
    ) -> BoxFuture<'a, Result<Vec<MetricSeries>, FetchError>> {
        Box::pin(async move {
            self.rate_limiter.until_ready().await;
            let query = InsightsQuery {
                ig_user_id: request.ig_user_id,
                metrics: request.metrics,
                metric_type: request.family.metric_type(),
                since: request.window.since_unix(),
                until: request.window.until_unix(),
            };
            let envelope = self
                .client
                .get_insights(&query, request.token)
                .await
                .map_err(map_graph_error)?;
            Ok(series_from_envelope(&envelope, &request.window))
        })
    }

    fn resolve_page_token<'a>(
        &'a self,
        page_id: &'a str,
        user_token: &'a str,
    ) -> BoxFuture<'a, Result<String, FetchError>> {
        Box::pin(async move {
            self.rate_limiter.until_ready().await;
            self.client
                .get_page_access_token(page_id, user_token)
                .await
                .map_err(map_graph_error)
        })
    }

    fn fetch_followers_count<'a>(
        &'a self,
        ig_user_id: &'a str,
        token: &'a str,
    ) -> BoxFuture<'a, Result<Option<i64>, FetchError>> {
        Box::pin(async move {
            self.rate_limiter.until_ready().await;
            let raw = self
                .client
                .get_followers_count(ig_user_id, token)
                .await
                .map_err(map_graph_error)?;
            Ok(to_finite_number_or_null(raw.as_ref()).map(to_count))
        })
    }
}

/// Result of a chunked series fetch. `chunks` counts upstream windows, not calls.
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesFetch {
    pub series: Vec<MetricSeries>,
    pub used_fallback: bool,
    pub chunks: usize,
}

/// Best-effort window totals. When `failure` is set every total is `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct TotalsFetch {
    pub totals: Vec<MetricTotal>,
    pub failure: Option<FetchError>,
}

impl TotalsFetch {
    pub fn value_of(&self, name: &str) -> Option<i64> {
        self.totals
            .iter()
            .find(|total| total.name == name)
            .and_then(|total| total.value)
    }

    fn unavailable(failure: FetchError) -> Self {
        Self {
            totals: TOTALS_METRICS
                .iter()
                .map(|name| MetricTotal {
                    name: (*name).to_string(),
                    value: None,
                })
                .collect(),
            failure: Some(failure),
        }
    }
}

/// Turns logical metric requests into chunked upstream calls with fallback metric lists.
#[derive(Clone)]
pub struct MetricFetcher {
    source: Arc<dyn InsightsSource>,
    retry_policy: RetryPolicy,
}

impl MetricFetcher {
    pub fn new(source: Arc<dyn InsightsSource>, retry_policy: RetryPolicy) -> Self {
        Self {
            source,
            retry_policy,
        }
    }

    /// Resolves the page-scoped credential when the account has a linked page.
    ///
    /// A failure here is fatal for the enclosing operation; no metric call is attempted.
    pub async fn open_session(
        &self,
        account: &Account,
        credential: &str,
    ) -> Result<GraphSession, FetchError> {
        let token = match account.page_id() {
            Some(page_id) => run_with_retry(
                &self.retry_policy,
                seed_for(&account.platform_user_id),
                |_| self.source.resolve_page_token(page_id, credential),
                |err: &FetchError| err.is_retryable(),
            )
            .await
            .map(|(token, _)| token)
            .map_err(|terminal| terminal.error)?,
            None => credential.to_string(),
        };

        Ok(GraphSession {
            ig_user_id: account.platform_user_id.clone(),
            token,
        })
    }

    /// Fetches the daily series over `window`, splitting it into windows the upstream accepts.
    ///
    /// Chunks run sequentially. Once the primary metric list is rejected, the fallback list is
    /// used for every remaining chunk.
    pub async fn fetch_series(
        &self,
        session: &GraphSession,
        window: DayWindow,
    ) -> Result<SeriesFetch, FetchError> {
        let chunks = window.chunks(MAX_WINDOW_DAYS);
        let mut fallback_active = false;
        let mut series: Vec<MetricSeries> = Vec::new();

        for chunk in &chunks {
            let chunk_series = self
                .fetch_with_fallback(
                    session,
                    MetricFamily::Series,
                    SERIES_METRICS,
                    SERIES_FALLBACK_METRICS,
                    *chunk,
                    &mut fallback_active,
                )
                .await?;
            append_series(&mut series, chunk_series);
        }

        debug!(
            event = "graph_series_fetched",
            ig_user_id = %session.ig_user_id,
            since = %window.since,
            until = %window.until,
            chunks = chunks.len(),
            used_fallback = fallback_active,
            "fetched daily series"
        );

        Ok(SeriesFetch {
            series,
            used_fallback: fallback_active,
            chunks: chunks.len(),
        })
    }

    /// Fetches window totals. Never fails; failures degrade every total to `None`.
    ///
    /// Windows longer than one chunk are summed across chunks.
    pub async fn fetch_totals(&self, session: &GraphSession, window: DayWindow) -> TotalsFetch {
        let mut fallback_active = false;
        let mut collected: Vec<MetricSeries> = Vec::new();

        for chunk in window.chunks(MAX_WINDOW_DAYS) {
            match self
                .fetch_with_fallback(
                    session,
                    MetricFamily::Totals,
                    TOTALS_METRICS,
                    TOTALS_FALLBACK_METRICS,
                    chunk,
                    &mut fallback_active,
                )
                .await
            {
                Ok(chunk_series) => append_series(&mut collected, chunk_series),
                Err(err) => {
                    warn!(
                        event = "graph_totals_unavailable",
                        ig_user_id = %session.ig_user_id,
                        kind = err.kind.as_str(),
                        error = %err,
                        "window totals unavailable; reporting nulls"
                    );
                    return TotalsFetch::unavailable(err);
                }
            }
        }

        let totals = TOTALS_METRICS
            .iter()
            .map(|name| MetricTotal {
                name: (*name).to_string(),
                value: collected
                    .iter()
                    .find(|series| series.name == *name)
                    .and_then(|series| sum_points(series)),
            })
            .collect();

        TotalsFetch {
            totals,
            failure: None,
        }
    }

    pub async fn fetch_followers_count(
        &self,
        session: &GraphSession,
    ) -> Result<Option<i64>, FetchError> {
        run_with_retry(
            &self.retry_policy,
            seed_for(&session.ig_user_id),
            |_| {
                self.source
                    .fetch_followers_count(&session.ig_user_id, &session.token)
            },
            |err: &FetchError| err.is_retryable(),
        )
        .await
        .map(|(count, _)| count)
        .map_err(|terminal| terminal.error)
    }

    async fn fetch_with_fallback(
        &self,
        session: &GraphSession,
        family: MetricFamily,
        primary: &[&str],
        fallback: &[&str],
        window: DayWindow,
        fallback_active: &mut bool,
    ) -> Result<Vec<MetricSeries>, FetchError> {
        if !*fallback_active {
            match self.call(session, family, primary, window).await {
                Ok(series) => return Ok(series),
                Err(err) if err.kind == FetchErrorKind::UnsupportedMetric => {
                    warn!(
                        event = "graph_metric_fallback",
                        ig_user_id = %session.ig_user_id,
                        family = family.as_str(),
                        rejected = %primary.join(","),
                        fallback = %fallback.join(","),
                        error = %err,
                        "upstream rejected metric list; retrying with fallback"
                    );
                    if let Some(metrics) = INSIGHTS_METRICS.get() {
                        metrics.metric_fallbacks_total.inc();
                    }
                    *fallback_active = true;
                }
                Err(err) => return Err(err),
            }
        }

        self.call(session, family, fallback, window).await
    }

    async fn call(
        &self,
        session: &GraphSession,
        family: MetricFamily,
        metrics: &[&str],
        window: DayWindow,
    ) -> Result<Vec<MetricSeries>, FetchError> {
        let request = MetricRequest {
            ig_user_id: &session.ig_user_id,
            token: &session.token,
            metrics,
            family,
            window,
        };

        let result = run_with_retry(
            &self.retry_policy,
            seed_for(&session.ig_user_id),
            |_| {
                if let Some(metrics) = INSIGHTS_METRICS.get() {
                    metrics.upstream_calls_total.inc();
                }
                self.source.fetch_metrics(&request)
            },
            |err: &FetchError| err.is_retryable(),
        )
        .await;

        match result {
            Ok((series, _)) => Ok(series),
            Err(terminal) => {
                if let Some(metrics) = INSIGHTS_METRICS.get() {
                    metrics
                        .upstream_failures_total
                        .get_or_create(&FailureLabels {
                            kind: terminal.error.kind.as_str(),
                        })
                        .inc();
                }
                Err(terminal.error)
            }
        }
    }
}

fn append_series(into: &mut Vec<MetricSeries>, incoming: Vec<MetricSeries>) {
    for series in incoming {
        match into.iter_mut().find(|existing| existing.name == series.name) {
            Some(existing) => existing.points.extend(series.points),
            None => into.push(series),
        }
    }
}

fn sum_points(series: &MetricSeries) -> Option<i64> {
    series
        .points
        .iter()
        .filter_map(|point| point.value)
        .map(to_count)
        .fold(None, |acc: Option<i64>, value| {
            Some(acc.unwrap_or(0).saturating_add(value))
        })
}

#[cfg(test)]
#[path = "fetcher_tests.rs"]
mod tests;

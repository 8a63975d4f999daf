pub mod aggregator;
pub mod error_mapping;
pub mod fetcher;
pub mod normalize;
pub mod retry;
pub mod types;
pub mod window;

pub use aggregator::{apply_totals, merge_series, pad_points, DailyPoint, DayBucket, DayBuckets};
pub use fetcher::{
    GraphInsightsSource, GraphRateLimiter, InsightsSource, MetricFetcher, SeriesFetch, TotalsFetch,
};
pub use types::{FetchError, FetchErrorKind, GraphSession, MetricFamily, RetryPolicy};
pub use window::DayWindow;

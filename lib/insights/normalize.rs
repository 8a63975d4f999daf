//! Defensive conversion of upstream JSON into finite numbers and UTC instants.
//!
//! Every numeric field read from a Graph response goes through [`to_finite_number_or_null`] or
//! [`to_finite_number_or_zero`]. Nothing downstream ever sees `NaN`, infinities or numeric strings.

use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value;
use tracing::debug;

use super::types::{MetricPoint, MetricSeries};
use super::window::DayWindow;
use crate::graph_client::{InsightsEnvelope, RawMetric};

/// Finite number or `None`. Numeric strings are accepted.
pub fn to_finite_number_or_null(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(number) => number.as_f64().filter(|n| n.is_finite()),
        Value::String(text) => text.trim().parse::<f64>().ok().filter(|n| n.is_finite()),
        _ => None,
    }
}

/// Finite number, or `0.0` when absent ("no activity").
pub fn to_finite_number_or_zero(value: Option<&Value>) -> f64 {
    to_finite_number_or_null(value).unwrap_or(0.0)
}

/// Rounds a finite value to an integer count. Saturates at the `i64` bounds.
pub fn to_count(value: f64) -> i64 {
    if !value.is_finite() {
        return 0;
    }
    value.round() as i64
}

/// Parses Graph `end_time` values (`2024-06-14T07:00:00+0000`) and RFC 3339 timestamps.
pub fn parse_end_time(raw: &str) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim();
    DateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S%z")
        .or_else(|_| DateTime::parse_from_rfc3339(trimmed))
        .ok()
        .map(|parsed| parsed.with_timezone(&Utc))
        .or_else(|| {
            NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
                .ok()
                .and_then(|day| day.and_hms_opt(0, 0, 0))
                .map(|start| start.and_utc())
        })
}

/// Converts one upstream envelope into normalized series.
///
/// Window-level totals (`total_value` on the metric itself) carry no `end_time`; they are
/// stamped with the start of `window.until` so they bucket onto the last day of the window.
pub fn series_from_envelope(envelope: &InsightsEnvelope, window: &DayWindow) -> Vec<MetricSeries> {
    envelope
        .data
        .iter()
        .map(|metric| MetricSeries {
            name: metric.name.clone(),
            points: points_for_metric(metric, window),
        })
        .collect()
}

fn points_for_metric(metric: &RawMetric, window: &DayWindow) -> Vec<MetricPoint> {
    let mut points = Vec::new();

    for raw in metric.values.iter().flatten() {
        let Some(end_time) = raw.end_time.as_deref().and_then(parse_end_time) else {
            debug!(
                event = "graph_value_without_end_time",
                metric = %metric.name,
                "dropping metric value without a parseable end_time"
            );
            continue;
        };

        let value = match (&raw.value, &raw.total_value) {
            (Some(value), _) => to_finite_number_or_null(Some(value)),
            (None, Some(total)) => to_finite_number_or_null(total.value.as_ref()),
            (None, None) => None,
        };
        points.push(MetricPoint { end_time, value });
    }

    if points.is_empty() {
        if let Some(total) = &metric.total_value {
            if let Some(end_time) = window.until.and_hms_opt(0, 0, 0).map(|t| t.and_utc()) {
                points.push(MetricPoint {
                    end_time,
                    value: to_finite_number_or_null(total.value.as_ref()),
                });
            }
        }
    }

    points
}

use chrono::{Days, NaiveDate};
use serde::Serialize;

/// Inclusive range of UTC calendar days.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct DayWindow {
    pub since: NaiveDate,
    pub until: NaiveDate,
}

impl DayWindow {
    /// Returns `None` when `since > until`.
    pub fn new(since: NaiveDate, until: NaiveDate) -> Option<Self> {
        (since <= until).then_some(Self { since, until })
    }

    pub fn single(day: NaiveDate) -> Self {
        Self {
            since: day,
            until: day,
        }
    }

    /// The `days` calendar days ending at `until`, inclusive. `days == 0` is treated as 1.
    pub fn ending_at(until: NaiveDate, days: u32) -> Self {
        let span = u64::from(days.max(1) - 1);
        Self {
            since: until.checked_sub_days(Days::new(span)).unwrap_or(NaiveDate::MIN),
            until,
        }
    }

    pub fn day_count(&self) -> i64 {
        (self.until - self.since).num_days() + 1
    }

    pub fn contains(&self, day: NaiveDate) -> bool {
        self.since <= day && day <= self.until
    }

    pub fn days(&self) -> impl Iterator<Item = NaiveDate> {
        let until = self.until;
        self.since.iter_days().take_while(move |day| *day <= until)
    }

    /// Unix seconds of `since` at 00:00 UTC.
    pub fn since_unix(&self) -> i64 {
        day_start_unix(self.since)
    }

    /// Unix seconds of the day after `until` at 00:00 UTC, so the last day is fully covered.
    pub fn until_unix(&self) -> i64 {
        day_start_unix(self.until) + 86_400
    }

    /// Splits the window into sequential windows of at most `max_days` days.
    ///
    /// Chunks are contiguous, never overlap and cover exactly this window.
    pub fn chunks(&self, max_days: i64) -> Vec<DayWindow> {
        let max_days = max_days.max(1);
        let mut chunks = Vec::new();
        let mut cursor = self.since;

        while cursor <= self.until {
            let tentative_end = cursor
                .checked_add_days(Days::new((max_days - 1) as u64))
                .unwrap_or(NaiveDate::MAX);
            let end = tentative_end.min(self.until);
            chunks.push(DayWindow {
                since: cursor,
                until: end,
            });

            match end.succ_opt() {
                Some(next) => cursor = next,
                None => break,
            }
        }

        chunks
    }
}

fn day_start_unix(day: NaiveDate) -> i64 {
    day.and_hms_opt(0, 0, 0)
        .map(|start| start.and_utc().timestamp())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::DayWindow;
    use chrono::NaiveDate;

    fn day(raw: &str) -> NaiveDate {
        NaiveDate::parse_from_str(raw, "%Y-%m-%d").expect("valid date")
    }

    #[test]
    fn ninety_five_days_split_into_thirty_thirty_thirty_five() {
        let window = DayWindow::ending_at(day("2024-06-14"), 95);
        let chunks = window.chunks(30);

        let sizes: Vec<i64> = chunks.iter().map(DayWindow::day_count).collect();
        assert_eq!(sizes, vec![30, 30, 30, 5]);
        assert_eq!(sizes.iter().sum::<i64>(), window.day_count());

        assert_eq!(chunks.first().map(|c| c.since), Some(window.since));
        assert_eq!(chunks.last().map(|c| c.until), Some(window.until));
        for pair in chunks.windows(2) {
            assert_eq!(pair[0].until.succ_opt(), Some(pair[1].since));
        }
    }

    #[test]
    fn small_window_is_a_single_chunk() {
        let window = DayWindow::new(day("2024-06-10"), day("2024-06-14")).expect("ordered");
        assert_eq!(window.chunks(30), vec![window]);
    }

    #[test]
    fn exact_multiple_has_no_trailing_empty_chunk() {
        let window = DayWindow::ending_at(day("2024-06-30"), 60);
        let chunks = window.chunks(30);
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|chunk| chunk.day_count() == 30));
    }

    #[test]
    fn unix_bounds_cover_whole_days() {
        let window = DayWindow::single(day("2024-06-15"));
        assert_eq!(window.since_unix(), 1_718_409_600);
        assert_eq!(window.until_unix() - window.since_unix(), 86_400);

        let widest = DayWindow::ending_at(day("2024-06-30"), 30);
        assert_eq!(widest.until_unix() - widest.since_unix(), 30 * 86_400);
    }

    #[test]
    fn reversed_bounds_are_rejected() {
        assert!(DayWindow::new(day("2024-06-15"), day("2024-06-14")).is_none());
    }

    #[test]
    fn days_iterates_inclusively() {
        let window = DayWindow::ending_at(day("2024-03-01"), 3);
        let days: Vec<NaiveDate> = window.days().collect();
        assert_eq!(days, vec![day("2024-02-28"), day("2024-02-29"), day("2024-03-01")]);
    }
}

use chrono::{Datelike, Duration, NaiveDate};

/// Monday of the ISO week containing `date`.
pub fn week_start(date: NaiveDate) -> NaiveDate {
    date - Duration::days(i64::from(date.weekday().num_days_from_monday()))
}

/// Monday–Sunday bounds of the ISO week containing `date`, both inclusive.
pub fn week_bounds(date: NaiveDate) -> (NaiveDate, NaiveDate) {
    let monday = week_start(date);
    (monday, monday + Duration::days(6))
}

pub fn in_range(date: NaiveDate, start: NaiveDate, end: NaiveDate) -> bool {
    start <= date && date <= end
}

/// Parse a calendar date in the one canonical format, `YYYY-MM-DD`.
/// Anything else is rejected — no format guessing.
pub fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()
}

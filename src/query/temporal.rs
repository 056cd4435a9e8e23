//! Relative-date resolution
//!
//! Turns the parser's temporal block into absolute timestamp bounds and
//! pass-through facet filters. Everything resolves in the host's local
//! zone, the same zone the enricher used to derive facets; weeks start
//! on Sunday.

use chrono::{DateTime, Datelike, Local, NaiveDate, NaiveDateTime, TimeZone};

use crate::types::{RelativePeriod, SearchFilters, TemporalExpr};

/// Resolve a temporal block against the current local time.
///
/// `None` input yields an empty filter set.
pub fn resolve_temporal_filter(expr: Option<&TemporalExpr>) -> SearchFilters {
    resolve_temporal_filter_at(expr, Local::now())
}

/// Resolution against an explicit clock (testable form)
pub fn resolve_temporal_filter_at(
    expr: Option<&TemporalExpr>,
    now: DateTime<Local>,
) -> SearchFilters {
    let mut filters = SearchFilters::default();
    let Some(expr) = expr else {
        return filters;
    };

    if let Some(relative) = expr.relative {
        let (gte, lte) = resolve_relative(relative, now);
        filters.timestamp_gte = Some(gte.timestamp());
        filters.timestamp_lte = lte.map(|dt| dt.timestamp());
    }

    // Explicit ISO bounds pass through unchanged
    if let Some(date) = &expr.date_gte {
        if let Some(ts) = parse_iso_local(date, false) {
            filters.timestamp_gte = Some(ts);
        }
    }
    if let Some(date) = &expr.date_lte {
        if let Some(ts) = parse_iso_local(date, true) {
            filters.timestamp_lte = Some(ts);
        }
    }

    filters.year = expr.year;
    filters.month = expr.month;
    filters.months = expr.months.clone();
    filters.day_of_week = expr.day_of_week.as_ref().map(|d| d.to_lowercase());
    // Wrap-around windows (gte > lte) pass through; the query builder
    // splits them into two range queries
    filters.hour_of_day_gte = expr.hour_gte;
    filters.hour_of_day_lte = expr.hour_lte;

    filters
}

fn resolve_relative(
    relative: RelativePeriod,
    now: DateTime<Local>,
) -> (DateTime<Local>, Option<DateTime<Local>>) {
    let today = start_of_day(now.date_naive());

    match relative {
        RelativePeriod::Today => (today, None),
        RelativePeriod::Yesterday => {
            let yesterday = start_of_day(now.date_naive().pred_opt().unwrap_or(now.date_naive()));
            (yesterday, Some(today))
        }
        RelativePeriod::ThisWeek => (week_start(now), None),
        RelativePeriod::LastWeek => {
            let this_week = week_start(now);
            (this_week - chrono::Duration::days(7), Some(this_week))
        }
        RelativePeriod::ThisMonth => (month_start(now.year(), now.month()), None),
        RelativePeriod::LastMonth => {
            let (year, month) = if now.month() == 1 {
                (now.year() - 1, 12)
            } else {
                (now.year(), now.month() - 1)
            };
            let start = month_start(year, month);
            // The last moment before the current month rolls over
            let end = month_start(now.year(), now.month()) - chrono::Duration::seconds(1);
            (start, Some(end))
        }
        RelativePeriod::ThisYear => (month_start(now.year(), 1), None),
        RelativePeriod::LastYear => {
            let start = month_start(now.year() - 1, 1);
            let end = month_start(now.year(), 1) - chrono::Duration::seconds(1);
            (start, Some(end))
        }
    }
}

/// Most recent Sunday at 00:00 local
fn week_start(now: DateTime<Local>) -> DateTime<Local> {
    let days_back = now.weekday().num_days_from_sunday() as i64;
    start_of_day(now.date_naive() - chrono::Duration::days(days_back))
}

fn month_start(year: i32, month: u32) -> DateTime<Local> {
    start_of_day(NaiveDate::from_ymd_opt(year, month, 1).expect("valid month start"))
}

fn start_of_day(date: NaiveDate) -> DateTime<Local> {
    let naive = date.and_hms_opt(0, 0, 0).expect("midnight");
    Local
        .from_local_datetime(&naive)
        .single()
        .unwrap_or_else(|| Local.from_utc_datetime(&naive))
}

/// Parse an ISO date or datetime. Bare dates resolve to local midnight
/// (`end` picks the last second of the day instead).
fn parse_iso_local(value: &str, end: bool) -> Option<i64> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.timestamp());
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S") {
        return Local
            .from_local_datetime(&naive)
            .single()
            .map(|dt| dt.timestamp());
    }
    let date = NaiveDate::parse_from_str(value, "%Y-%m-%d").ok()?;
    let naive = if end {
        date.and_hms_opt(23, 59, 59)?
    } else {
        date.and_hms_opt(0, 0, 0)?
    };
    Local
        .from_local_datetime(&naive)
        .single()
        .map(|dt| dt.timestamp())
}

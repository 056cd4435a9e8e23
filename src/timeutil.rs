//! Timestamp conversion and human-readable date formatting
//!
//! The platform stores message dates as nanoseconds since the Apple epoch
//! (2001-01-01 UTC); everything downstream of the reader works in Unix
//! seconds.

use chrono::{DateTime, Local, TimeZone, Utc};

/// Seconds between the Unix epoch (1970) and the Apple epoch (2001)
pub const APPLE_EPOCH_OFFSET: i64 = 978_307_200;

/// Convert an Apple-epoch nanosecond timestamp to Unix seconds
pub fn apple_ns_to_unix(ns: i64) -> i64 {
    ns.div_euclid(1_000_000_000) + APPLE_EPOCH_OFFSET
}

/// Inverse of [`apple_ns_to_unix`]
pub fn unix_to_apple_ns(unix: i64) -> i64 {
    (unix - APPLE_EPOCH_OFFSET) * 1_000_000_000
}

fn local(ts: i64) -> DateTime<Local> {
    Local
        .timestamp_opt(ts, 0)
        .single()
        .unwrap_or_else(|| Local.timestamp_opt(0, 0).unwrap())
}

/// `H:MM AM/PM` in the local time zone
pub fn format_time(ts: i64) -> String {
    local(ts).format("%-I:%M %p").to_string()
}

/// Zero-padded 24-hour `HH:MM`, the chunk-line form
pub fn format_time_short(ts: i64) -> String {
    local(ts).format("%H:%M").to_string()
}

/// `Mon D, YYYY` in the local time zone
pub fn format_date(ts: i64) -> String {
    local(ts).format("%b %-d, %Y").to_string()
}

/// Relative description of `ts` against `now`, both Unix seconds.
///
/// Thresholds: 60s, 1h, 1d, 1w, 30d, 365d.
pub fn relative_time(ts: i64, now: i64) -> String {
    let delta = now - ts;
    if delta < 60 {
        return "just now".to_string();
    }

    let (value, unit) = if delta < 3_600 {
        (delta / 60, "minute")
    } else if delta < 86_400 {
        (delta / 3_600, "hour")
    } else if delta < 604_800 {
        (delta / 86_400, "day")
    } else if delta < 2_592_000 {
        (delta / 604_800, "week")
    } else if delta < 31_536_000 {
        (delta / 2_592_000, "month")
    } else {
        (delta / 31_536_000, "year")
    };

    if value == 1 {
        format!("1 {} ago", unit)
    } else {
        format!("{} {}s ago", value, unit)
    }
}

/// Current Unix seconds
pub fn now_unix() -> i64 {
    Utc::now().timestamp()
}

//! Recency predicate over loosely formatted publication dates.

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// Window used by the topic picker's "new this month" view.
pub const SHORT_WINDOW_DAYS: u32 = 30;
/// Window used by the paper index when it pre-filters recent work.
pub const LONG_WINDOW_DAYS: u32 = 60;

/// Trailing window within which a published date counts as recent.
///
/// Callers always pick a window; see `LONG_WINDOW_DAYS` and `SHORT_WINDOW_DAYS`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreshnessPolicy {
    window_days: u32,
}

impl FreshnessPolicy {
    pub fn new(window_days: u32) -> Self {
        Self { window_days }
    }

    pub fn window_days(&self) -> u32 {
        self.window_days
    }

    /// Human label echoed back to consumers alongside batches, e.g. `"60 days"`.
    pub fn label(&self) -> String {
        format!("{} days", self.window_days)
    }

    pub fn is_recent_at(&self, published: &str, now: DateTime<Utc>) -> bool {
        is_recent(published, self.window_days, now)
    }
}

/// Unparseable or missing dates are never recent. Dates ahead of `now` are.
pub fn is_recent(published: &str, window_days: u32, now: DateTime<Utc>) -> bool {
    let Some(published_at) = parse_published(published) else {
        return false;
    };
    now.signed_duration_since(published_at) <= Duration::days(i64::from(window_days))
}

/// Parse the date shapes upstream sources hand us.
///
/// Partial dates (`2024`, `2024-05`) resolve to the start of the period.
pub fn parse_published(raw: &str) -> Option<DateTime<Utc>> {
    let text = raw.trim();
    if text.is_empty() || text.eq_ignore_ascii_case("unknown") || text.eq_ignore_ascii_case("unknown date") {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(text) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S") {
        return Some(naive.and_utc());
    }
    parse_date_parts(text)
}

fn parse_date_parts(text: &str) -> Option<DateTime<Utc>> {
    let parts = text.split('-').collect::<Vec<_>>();
    if parts.len() > 3 || parts[0].len() != 4 {
        return None;
    }
    let year: i32 = parts[0].parse().ok()?;
    let month = parts.get(1).map(|m| m.parse::<u32>()).transpose().ok()?.unwrap_or(1);
    let day = parts.get(2).map(|d| d.parse::<u32>()).transpose().ok()?.unwrap_or(1);
    Some(NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(0, 0, 0)?.and_utc())
}

//! Data models for event ingestion and rollups

use chrono::{DateTime, Datelike, Duration, FixedOffset, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Seconds per rollup window.
pub const BUCKET_SECONDS: i64 = 600;

/// A normalized, accepted event. Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub event_name: String,
    pub slug: Option<String>,
    /// ISO-8601, as supplied by the client and validated at intake.
    pub timestamp: String,
    pub session_id: Option<String>,
    pub payload: serde_json::Value,
}

impl EventRecord {
    pub fn occurred_at(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.timestamp)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    }

    /// Start of the 10-minute window this event falls into.
    pub fn bucket_start(&self) -> Option<i64> {
        self.occurred_at().map(|dt| align_bucket(dt.timestamp()))
    }
}

pub fn align_bucket(epoch: i64) -> i64 {
    epoch - epoch.rem_euclid(BUCKET_SECONDS)
}

/// Raw client-submitted event; untrusted until validated.
#[derive(Debug, Clone, Deserialize)]
pub struct IncomingEvent {
    #[serde(alias = "eventName", alias = "name")]
    pub event_name: Option<String>,
    pub slug: Option<String>,
    pub timestamp: Option<String>,
    #[serde(alias = "sessionId")]
    pub session_id: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Server-side request context merged into accepted payloads.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub ip: Option<String>,
    pub referrer: Option<String>,
    pub origin: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    TenMinutes,
    #[default]
    Day,
    Week,
    Month,
}

impl Granularity {
    pub fn parse(value: &str) -> Self {
        match value.to_lowercase().as_str() {
            "10m" | "ten_minutes" | "10min" => Self::TenMinutes,
            "week" => Self::Week,
            "month" => Self::Month,
            _ => Self::Day,
        }
    }
}

/// Timezone-aware series key for a rollup window at the requested
/// granularity. `utc_offset_minutes` shifts bucketing so that "day"
/// boundaries fall on the caller's local midnight.
pub fn bucket_key(epoch: i64, granularity: Granularity, utc_offset_minutes: i32) -> String {
    let offset = FixedOffset::east_opt(utc_offset_minutes.clamp(-14 * 60, 14 * 60) * 60)
        .unwrap_or_else(|| FixedOffset::east_opt(0).expect("zero offset is valid"));
    let local = DateTime::from_timestamp(epoch, 0)
        .unwrap_or_default()
        .with_timezone(&offset);

    match granularity {
        Granularity::TenMinutes => {
            let minute = local.minute() - local.minute() % 10;
            format!(
                "{:04}-{:02}-{:02}T{:02}:{:02}",
                local.year(),
                local.month(),
                local.day(),
                local.hour(),
                minute
            )
        }
        Granularity::Day => local.format("%Y-%m-%d").to_string(),
        Granularity::Week => {
            let monday =
                local.date_naive() - Duration::days(local.weekday().num_days_from_monday() as i64);
            monday.format("%Y-%m-%d").to_string()
        }
        Granularity::Month => local.format("%Y-%m").to_string(),
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SummaryQuery {
    pub event_name: Option<String>,
    pub slug: Option<String>,
    /// Inclusive range start; ISO datetime or `YYYY-MM-DD`.
    pub start: Option<String>,
    /// Inclusive range end.
    pub end: Option<String>,
    pub granularity: Option<String>,
    #[serde(default)]
    pub utc_offset_minutes: i32,
}

#[derive(Debug, Clone, Serialize)]
pub struct EventSummary {
    pub total_visits: i64,
    pub by_event: BTreeMap<String, EventTotals>,
    pub by_slug: BTreeMap<String, i64>,
    pub series: Vec<SeriesPoint>,
    pub catalog: EventCatalog,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EventTotals {
    pub visit_count: i64,
    pub unique_sessions: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SeriesPoint {
    pub bucket: String,
    pub visit_count: i64,
    pub unique_sessions: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EventCatalog {
    pub event_names: Vec<String>,
    pub slugs: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_bucket_truncates_to_ten_minutes() {
        let epoch = DateTime::parse_from_rfc3339("2026-08-07T12:34:56Z")
            .unwrap()
            .timestamp();
        let aligned = align_bucket(epoch);
        assert_eq!(aligned % 600, 0);
        assert!(epoch - aligned < 600);
        assert_eq!(align_bucket(aligned), aligned);
    }

    #[test]
    fn test_bucket_key_granularities() {
        // 2026-02-15T23:45:00Z (a Sunday)
        let epoch = DateTime::parse_from_rfc3339("2026-02-15T23:45:00Z")
            .unwrap()
            .timestamp();

        assert_eq!(
            bucket_key(epoch, Granularity::TenMinutes, 0),
            "2026-02-15T23:40"
        );
        assert_eq!(bucket_key(epoch, Granularity::Day, 0), "2026-02-15");
        // Week starts on the preceding Monday
        assert_eq!(bucket_key(epoch, Granularity::Week, 0), "2026-02-09");
        assert_eq!(bucket_key(epoch, Granularity::Month, 0), "2026-02");
    }

    #[test]
    fn test_bucket_key_honors_utc_offset() {
        let epoch = DateTime::parse_from_rfc3339("2026-02-15T23:45:00Z")
            .unwrap()
            .timestamp();

        // +60 minutes pushes the local time past midnight
        assert_eq!(bucket_key(epoch, Granularity::Day, 60), "2026-02-16");
        assert_eq!(bucket_key(epoch, Granularity::Month, 60), "2026-02");
        // A month boundary moves too
        let nye = DateTime::parse_from_rfc3339("2026-12-31T23:30:00Z")
            .unwrap()
            .timestamp();
        assert_eq!(bucket_key(nye, Granularity::Month, 60), "2027-01");
    }

    #[test]
    fn test_event_record_bucket_start() {
        let record = EventRecord {
            event_name: "page_view".to_string(),
            slug: None,
            timestamp: "2026-08-07T12:34:56Z".to_string(),
            session_id: None,
            payload: serde_json::json!({}),
        };
        assert_eq!(record.bucket_start().unwrap() % 600, 0);

        let bad = EventRecord {
            timestamp: "yesterday-ish".to_string(),
            ..record
        };
        assert_eq!(bad.bucket_start(), None);
    }
}

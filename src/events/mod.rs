//! Batched event ingestion and 10-minute rollups
//!
//! Intake validates against an allow-list and normalizes rows, then takes
//! the first available write path: durable FIFO queue in the shared tier
//! (rollup deferred to an explicit flush), direct persist-and-rollup into
//! the durable store, or a bounded in-process ring buffer. Flush unions
//! each window's session ids into a durable per-window set and folds the
//! *delta* into the rollup row, so repeated flushes never double count
//! unique sessions.

pub mod models;

pub use models::{
    align_bucket, bucket_key, EventCatalog, EventRecord, EventSummary, EventTotals, Granularity,
    IncomingEvent, RequestContext, SeriesPoint, SummaryQuery, BUCKET_SECONDS,
};

use crate::kv::KvTier;
use crate::storage::{bounded, DurableStore, RollupDelta, RollupRow};
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Event names accepted from clients; anything else is dropped silently.
pub const ALLOWED_EVENTS: &[&str] = &[
    "page_view",
    "article_view",
    "scroll_depth",
    "read_complete",
    "share_click",
    "outbound_click",
    "like_toggle",
    "comment_submit",
    "search",
    "newsletter_signup",
];

/// Rows accepted per ingest call.
pub const MAX_BATCH: usize = 200;

/// Hard cap on items drained per flush.
pub const MAX_FLUSH: usize = 500;

/// Ring buffer bound for the no-backend local path.
pub const RING_CAPACITY: usize = 100_000;

const QUEUE_KEY: &str = "events:queue";

const SLUG_MAX_LEN: usize = 200;
const SESSION_MAX_LEN: usize = 128;

#[derive(Debug, Clone, serde::Serialize)]
pub struct FlushReport {
    pub flushed: usize,
}

pub struct EventStore {
    kv: Option<Arc<dyn KvTier>>,
    durable: Option<Arc<dyn DurableStore>>,
    ring: Mutex<VecDeque<EventRecord>>,
}

impl EventStore {
    pub fn new(kv: Option<Arc<dyn KvTier>>, durable: Option<Arc<dyn DurableStore>>) -> Self {
        Self {
            kv,
            durable,
            ring: Mutex::new(VecDeque::new()),
        }
    }

    /// Validate, normalize and buffer a client batch. Returns how many
    /// rows were accepted; invalid rows are dropped, never an error.
    pub async fn ingest(
        &self,
        events: Vec<IncomingEvent>,
        context: &RequestContext,
    ) -> Result<usize> {
        let received_at = Utc::now().to_rfc3339();
        let accepted: Vec<EventRecord> = events
            .into_iter()
            .take(MAX_BATCH)
            .filter_map(|event| normalize(event, context, &received_at))
            .collect();

        if accepted.is_empty() {
            return Ok(0);
        }
        let ingested = accepted.len();

        // (a) queue in the shared tier; rollup happens on explicit flush.
        // Only worth queueing when a durable store exists to flush into.
        if let (Some(kv), Some(_)) = (&self.kv, &self.durable) {
            // Serialization failure counts as a tier failure: fall through
            match encode_batch(&accepted) {
                Ok(items) => match kv.queue_push(QUEUE_KEY, &items).await {
                    Ok(()) => return Ok(ingested),
                    Err(err) => {
                        warn!(error = %err, "event queue unavailable, falling through to durable store");
                    }
                },
                Err(err) => {
                    warn!(error = %err, "failed to encode event batch for queueing");
                }
            }
        }

        // (b) no queue: persist raw rows and fold the rollup immediately
        if let Some(durable) = &self.durable {
            match self.persist_and_rollup(durable, &accepted).await {
                Ok(()) => return Ok(ingested),
                Err(err) => {
                    warn!(error = %err, "durable event write failed, falling through to ring buffer");
                }
            }
        }

        // (c) bounded local ring buffer, oldest dropped
        let mut ring = self.ring.lock().await;
        for record in accepted {
            if ring.len() >= RING_CAPACITY {
                ring.pop_front();
            }
            ring.push_back(record);
        }

        Ok(ingested)
    }

    /// Drain up to `limit` queued items and fold them into the rollups.
    ///
    /// A batch that fails to persist after dequeue is not re-enqueued; the
    /// queue path is deliberately at-most-once.
    pub async fn flush(&self, limit: Option<usize>) -> Result<FlushReport> {
        let (Some(kv), Some(durable)) = (&self.kv, &self.durable) else {
            return Ok(FlushReport { flushed: 0 });
        };

        let limit = limit.unwrap_or(MAX_FLUSH).min(MAX_FLUSH);
        let items = match kv.queue_pop(QUEUE_KEY, limit).await {
            Ok(items) => items,
            Err(err) => {
                warn!(error = %err, "event queue pop failed");
                return Ok(FlushReport { flushed: 0 });
            }
        };

        if items.is_empty() {
            return Ok(FlushReport { flushed: 0 });
        }

        let records: Vec<EventRecord> = items
            .iter()
            .filter_map(|item| match serde_json::from_str(item) {
                Ok(record) => Some(record),
                Err(err) => {
                    warn!(error = %err, "dropping corrupt queued event");
                    None
                }
            })
            .collect();

        debug!(drained = items.len(), parsed = records.len(), "flushing event queue");

        match self.persist_and_rollup(durable, &records).await {
            Ok(()) => Ok(FlushReport {
                flushed: records.len(),
            }),
            Err(err) => {
                warn!(error = %err, dropped = records.len(), "flush persistence failed; batch not re-enqueued");
                Ok(FlushReport { flushed: 0 })
            }
        }
    }

    async fn persist_and_rollup(
        &self,
        durable: &Arc<dyn DurableStore>,
        records: &[EventRecord],
    ) -> Result<()> {
        bounded(durable.append_events(records)).await?;

        struct WindowAgg {
            count: i64,
            last_seen: i64,
            sessions: HashSet<String>,
        }

        let mut windows: HashMap<(i64, String, Option<String>), WindowAgg> = HashMap::new();
        for record in records {
            let Some(bucket_start) = record.bucket_start() else {
                continue;
            };
            let occurred = record
                .occurred_at()
                .map(|dt| dt.timestamp())
                .unwrap_or(bucket_start);

            let agg = windows
                .entry((
                    bucket_start,
                    record.event_name.clone(),
                    record.slug.clone(),
                ))
                .or_insert(WindowAgg {
                    count: 0,
                    last_seen: occurred,
                    sessions: HashSet::new(),
                });
            agg.count += 1;
            agg.last_seen = agg.last_seen.max(occurred);
            if let Some(session) = &record.session_id {
                agg.sessions.insert(session.clone());
            }
        }

        for ((bucket_start, event_name, slug), agg) in windows {
            let sessions: Vec<String> = agg.sessions.into_iter().collect();
            // The unique count moves by how many sessions this flush newly
            // added to the window's set, not by the raw set size.
            let unique_delta = if sessions.is_empty() {
                0
            } else {
                bounded(durable.merge_window_sessions(
                    bucket_start,
                    &event_name,
                    slug.as_deref(),
                    &sessions,
                ))
                .await? as i64
            };

            bounded(durable.upsert_rollup(&RollupDelta {
                bucket_start,
                event_name,
                slug,
                visit_delta: agg.count,
                unique_delta,
                last_seen_at: agg.last_seen,
            }))
            .await?;
        }

        Ok(())
    }

    /// Sum rollup rows into totals, a time series at the requested
    /// granularity, and the catalog. Falls back to summarizing the ring
    /// buffer when no durable store is configured.
    pub async fn summary(&self, query: &SummaryQuery) -> Result<EventSummary> {
        let (start, end) = parse_range(query);
        let granularity = query
            .granularity
            .as_deref()
            .map(Granularity::parse)
            .unwrap_or_default();

        let rows = match &self.durable {
            Some(durable) => {
                bounded(durable.query_rollups(start.timestamp(), end.timestamp())).await?
            }
            None => self.ring_rollups(start, end).await,
        };

        let rows: Vec<RollupRow> = rows
            .into_iter()
            .filter(|row| {
                query
                    .event_name
                    .as_deref()
                    .map(|name| row.event_name == name)
                    .unwrap_or(true)
                    && query
                        .slug
                        .as_deref()
                        .map(|slug| row.slug.as_deref() == Some(slug))
                        .unwrap_or(true)
            })
            .collect();

        let mut by_event: BTreeMap<String, EventTotals> = BTreeMap::new();
        let mut by_slug: BTreeMap<String, i64> = BTreeMap::new();
        let mut series: BTreeMap<String, (i64, i64)> = BTreeMap::new();
        let mut total_visits = 0i64;

        for row in &rows {
            total_visits += row.visit_count;

            let totals = by_event.entry(row.event_name.clone()).or_default();
            totals.visit_count += row.visit_count;
            totals.unique_sessions += row.unique_sessions;

            if let Some(slug) = &row.slug {
                *by_slug.entry(slug.clone()).or_insert(0) += row.visit_count;
            }

            let key = bucket_key(row.bucket_start, granularity, query.utc_offset_minutes);
            let point = series.entry(key).or_insert((0, 0));
            point.0 += row.visit_count;
            point.1 += row.unique_sessions;
        }

        let series = series
            .into_iter()
            .map(|(bucket, (visit_count, unique_sessions))| SeriesPoint {
                bucket,
                visit_count,
                unique_sessions,
            })
            .collect();

        Ok(EventSummary {
            total_visits,
            by_event,
            by_slug,
            series,
            catalog: self.catalog().await?,
        })
    }

    /// The allow-list plus every slug seen in the rollups (or the ring
    /// buffer when no durable store exists).
    pub async fn catalog(&self) -> Result<EventCatalog> {
        let slugs = match &self.durable {
            Some(durable) => bounded(durable.distinct_rollup_slugs()).await?,
            None => {
                let ring = self.ring.lock().await;
                let distinct: BTreeSet<String> =
                    ring.iter().filter_map(|r| r.slug.clone()).collect();
                distinct.into_iter().collect()
            }
        };

        Ok(EventCatalog {
            event_names: ALLOWED_EVENTS.iter().map(|name| name.to_string()).collect(),
            slugs,
        })
    }

    /// Aggregate the ring buffer into synthetic rollup rows so the summary
    /// path has one shape to work with.
    async fn ring_rollups(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<RollupRow> {
        let ring = self.ring.lock().await;

        let mut windows: HashMap<(i64, String, Option<String>), (i64, i64, HashSet<String>)> =
            HashMap::new();
        for record in ring.iter() {
            let Some(occurred) = record.occurred_at() else {
                continue;
            };
            if occurred < start || occurred >= end {
                continue;
            }
            let entry = windows
                .entry((
                    align_bucket(occurred.timestamp()),
                    record.event_name.clone(),
                    record.slug.clone(),
                ))
                .or_insert((0, 0, HashSet::new()));
            entry.0 += 1;
            entry.1 = entry.1.max(occurred.timestamp());
            if let Some(session) = &record.session_id {
                entry.2.insert(session.clone());
            }
        }

        windows
            .into_iter()
            .map(
                |((bucket_start, event_name, slug), (count, last_seen, sessions))| RollupRow {
                    bucket_start,
                    event_name,
                    slug,
                    visit_count: count,
                    unique_sessions: sessions.len() as i64,
                    last_seen_at: last_seen,
                },
            )
            .collect()
    }

    /// Queue depth, for operational visibility.
    pub async fn pending(&self) -> usize {
        if let Some(kv) = &self.kv {
            if let Ok(len) = kv.queue_len(QUEUE_KEY).await {
                return len;
            }
        }
        self.ring.lock().await.len()
    }
}

fn encode_batch(records: &[EventRecord]) -> serde_json::Result<Vec<String>> {
    records.iter().map(serde_json::to_string).collect()
}

/// Validate one client row and merge the server context into its payload
/// under the reserved `_server` key.
fn normalize(
    event: IncomingEvent,
    context: &RequestContext,
    received_at: &str,
) -> Option<EventRecord> {
    let name = event.event_name?;
    if !ALLOWED_EVENTS.contains(&name.as_str()) {
        return None;
    }

    let timestamp = event.timestamp?;
    DateTime::parse_from_rfc3339(&timestamp).ok()?;

    let slug = event
        .slug
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty() && s.len() <= SLUG_MAX_LEN);
    let session_id = event
        .session_id
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty() && s.len() <= SESSION_MAX_LEN);

    let mut payload = match event.payload {
        serde_json::Value::Object(map) => serde_json::Value::Object(map),
        serde_json::Value::Null => serde_json::json!({}),
        other => serde_json::json!({ "value": other }),
    };
    payload["_server"] = serde_json::json!({
        "ip": context.ip,
        "referrer": context.referrer,
        "origin": context.origin,
        "user_agent": context.user_agent,
        "received_at": received_at,
    });

    Some(EventRecord {
        event_name: name,
        slug,
        timestamp,
        session_id,
        payload,
    })
}

fn parse_range(query: &SummaryQuery) -> (DateTime<Utc>, DateTime<Utc>) {
    let end = query
        .end
        .as_deref()
        .and_then(parse_date_param)
        .map(|dt| dt + Duration::seconds(BUCKET_SECONDS))
        .unwrap_or_else(|| Utc::now() + Duration::seconds(BUCKET_SECONDS));
    let start = query
        .start
        .as_deref()
        .and_then(parse_date_param)
        .unwrap_or_else(|| end - Duration::days(7));
    (start, end)
}

fn parse_date_param(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    chrono::NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn incoming(name: &str, session: Option<&str>, timestamp: &str) -> IncomingEvent {
        IncomingEvent {
            event_name: Some(name.to_string()),
            slug: Some("hello-world".to_string()),
            timestamp: Some(timestamp.to_string()),
            session_id: session.map(|s| s.to_string()),
            payload: serde_json::json!({"depth": 1}),
        }
    }

    #[tokio::test]
    async fn test_unknown_event_names_are_dropped() {
        let store = EventStore::new(None, None);
        let ingested = store
            .ingest(
                vec![
                    incoming("page_view", None, "2026-08-07T10:00:00Z"),
                    incoming("totally_made_up", None, "2026-08-07T10:00:00Z"),
                ],
                &RequestContext::default(),
            )
            .await
            .unwrap();
        assert_eq!(ingested, 1);
    }

    #[tokio::test]
    async fn test_malformed_rows_are_dropped() {
        let store = EventStore::new(None, None);

        let missing_name = IncomingEvent {
            event_name: None,
            slug: None,
            timestamp: Some("2026-08-07T10:00:00Z".to_string()),
            session_id: None,
            payload: serde_json::Value::Null,
        };
        let bad_timestamp = incoming("page_view", None, "last tuesday");

        let ingested = store
            .ingest(vec![missing_name, bad_timestamp], &RequestContext::default())
            .await
            .unwrap();
        assert_eq!(ingested, 0);
    }

    #[tokio::test]
    async fn test_batch_cap() {
        let store = EventStore::new(None, None);
        let events: Vec<IncomingEvent> = (0..250)
            .map(|_| incoming("page_view", None, "2026-08-07T10:00:00Z"))
            .collect();
        let ingested = store
            .ingest(events, &RequestContext::default())
            .await
            .unwrap();
        assert_eq!(ingested, MAX_BATCH);
    }

    #[test]
    fn test_normalize_merges_server_context() {
        let context = RequestContext {
            ip: Some("203.0.113.9".to_string()),
            referrer: Some("https://news.example".to_string()),
            origin: None,
            user_agent: Some("test-agent".to_string()),
        };

        let record = normalize(
            incoming("scroll_depth", Some("sess-1"), "2026-08-07T10:00:00Z"),
            &context,
            "2026-08-07T10:00:01Z",
        )
        .unwrap();

        assert_eq!(record.payload["depth"], 1);
        assert_eq!(record.payload["_server"]["ip"], "203.0.113.9");
        assert_eq!(record.payload["_server"]["received_at"], "2026-08-07T10:00:01Z");
        assert_eq!(record.session_id.as_deref(), Some("sess-1"));
    }

    #[test]
    fn test_non_object_payload_is_wrapped() {
        let record = normalize(
            IncomingEvent {
                event_name: Some("search".to_string()),
                slug: None,
                timestamp: Some("2026-08-07T10:00:00Z".to_string()),
                session_id: None,
                payload: serde_json::json!("rust tutorials"),
            },
            &RequestContext::default(),
            "2026-08-07T10:00:01Z",
        )
        .unwrap();

        assert_eq!(record.payload["value"], "rust tutorials");
        assert!(record.payload["_server"].is_object());
    }

    #[tokio::test]
    async fn test_ring_buffer_summary_fallback() {
        let store = EventStore::new(None, None);
        store
            .ingest(
                vec![
                    incoming("page_view", Some("s1"), "2026-08-07T10:01:00Z"),
                    incoming("page_view", Some("s1"), "2026-08-07T10:04:00Z"),
                    incoming("page_view", Some("s2"), "2026-08-07T10:08:00Z"),
                ],
                &RequestContext::default(),
            )
            .await
            .unwrap();

        let summary = store
            .summary(&SummaryQuery {
                start: Some("2026-08-07".to_string()),
                end: Some("2026-08-08".to_string()),
                granularity: Some("10m".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(summary.total_visits, 3);
        assert_eq!(summary.by_event["page_view"].visit_count, 3);
        assert_eq!(summary.by_event["page_view"].unique_sessions, 2);
        assert_eq!(summary.by_slug["hello-world"], 3);
        assert_eq!(summary.series.len(), 1);
        assert_eq!(summary.series[0].bucket, "2026-08-07T10:00");
    }

    #[tokio::test]
    async fn test_catalog_lists_allow_list_and_slugs() {
        let store = EventStore::new(None, None);
        store
            .ingest(
                vec![incoming("page_view", None, "2026-08-07T10:00:00Z")],
                &RequestContext::default(),
            )
            .await
            .unwrap();

        let catalog = store.catalog().await.unwrap();
        assert!(catalog.event_names.contains(&"page_view".to_string()));
        assert_eq!(catalog.slugs, vec!["hello-world".to_string()]);
    }
}

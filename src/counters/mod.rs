//! Per-slug view/like counters with idempotent per-viewer dedup
//!
//! Three backends behind one capability trait, tried strictly in order per
//! call: shared key-value tier, durable write-through document store, pure
//! in-process memory. Only an I/O error from the current tier triggers
//! fall-through; logic outcomes (deduped, no-op toggle) never do.

pub mod backends;

pub use backends::{
    CounterBackend, DurableCounterBackend, KvCounterBackend, MemoryCounterBackend,
};

use anyhow::{anyhow, Result};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

/// A viewer's repeat views within this window count once.
pub const VIEW_DEDUP_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Active likes are remembered per viewer for this long.
pub const LIKE_MEMBERSHIP_TTL: Duration = Duration::from_secs(90 * 24 * 60 * 60);

/// Durable counter state for one slug: the JSON document persisted per slug.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CounterDoc {
    pub views: u64,
    pub likes: u64,
    #[serde(default)]
    pub history: Vec<DailyCount>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyCount {
    /// "YYYY-MM-DD"
    pub date: String,
    pub views: u64,
    pub likes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Metrics {
    pub views: u64,
    pub likes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub liked: Option<bool>,
    pub history: Vec<DailyCount>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub range_totals: Option<RangeTotals>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RangeTotals {
    pub views: u64,
    pub likes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BumpOutcome {
    pub views: u64,
    pub likes: u64,
    pub liked: bool,
    pub deduped: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct LikeOutcome {
    pub views: u64,
    pub likes: u64,
    pub liked: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetricsQuery {
    pub viewer_id: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
}

/// Absolute admin overwrite; fields left `None` keep their current value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OverwritePatch {
    pub views: Option<u64>,
    pub likes: Option<u64>,
    pub history: Option<Vec<DailyCount>>,
}

/// In-process viewer membership, shared by the durable and memory backends
/// (the durable document store tracks no membership of its own). Entries
/// expire lazily; a dedup hit does not refresh the window.
#[derive(Default)]
pub struct MembershipSets {
    viewed: DashMap<String, HashMap<String, Instant>>,
    liked: DashMap<String, HashMap<String, Instant>>,
}

impl MembershipSets {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a view for dedup. Returns true when the viewer was not
    /// already counted within the TTL.
    pub fn mark_viewed(&self, slug: &str, viewer_id: &str) -> bool {
        let mut members = self.viewed.entry(slug.to_string()).or_default();
        prune(&mut members);
        if members.contains_key(viewer_id) {
            return false;
        }
        members.insert(viewer_id.to_string(), Instant::now() + VIEW_DEDUP_TTL);
        true
    }

    /// Returns true when the like was newly added.
    pub fn mark_liked(&self, slug: &str, viewer_id: &str) -> bool {
        let mut members = self.liked.entry(slug.to_string()).or_default();
        prune(&mut members);
        members
            .insert(viewer_id.to_string(), Instant::now() + LIKE_MEMBERSHIP_TTL)
            .is_none()
    }

    /// Returns true when an active like was removed.
    pub fn unmark_liked(&self, slug: &str, viewer_id: &str) -> bool {
        let Some(mut members) = self.liked.get_mut(slug) else {
            return false;
        };
        prune(&mut members);
        members.remove(viewer_id).is_some()
    }

    pub fn is_liked(&self, slug: &str, viewer_id: &str) -> bool {
        let Some(mut members) = self.liked.get_mut(slug) else {
            return false;
        };
        prune(&mut members);
        members.contains_key(viewer_id)
    }

    /// Drop every membership record for a slug (admin overwrite).
    pub fn clear_slug(&self, slug: &str) {
        self.viewed.remove(slug);
        self.liked.remove(slug);
    }
}

fn prune(members: &mut HashMap<String, Instant>) {
    let now = Instant::now();
    members.retain(|_, expires_at| *expires_at > now);
}

/// Today's date key for the per-day history rows.
pub(crate) fn today() -> String {
    chrono::Utc::now().format("%Y-%m-%d").to_string()
}

/// Fold a view/like delta into the daily history, keeping it date-sorted.
pub(crate) fn bump_history(history: &mut Vec<DailyCount>, date: &str, views: i64, likes: i64) {
    if let Some(row) = history.iter_mut().find(|row| row.date == date) {
        row.views = add_clamped(row.views, views);
        row.likes = add_clamped(row.likes, likes);
        return;
    }
    history.push(DailyCount {
        date: date.to_string(),
        views: views.max(0) as u64,
        likes: likes.max(0) as u64,
    });
    history.sort_by(|a, b| a.date.cmp(&b.date));
}

pub(crate) fn add_clamped(value: u64, delta: i64) -> u64 {
    if delta >= 0 {
        value.saturating_add(delta as u64)
    } else {
        value.saturating_sub(delta.unsigned_abs())
    }
}

/// Ranked cascade over the configured counter backends.
pub struct CounterStore {
    backends: Vec<Arc<dyn CounterBackend>>,
}

impl CounterStore {
    /// `backends` in fall-through order; the last should be the memory
    /// backend, which cannot fail.
    pub fn new(backends: Vec<Arc<dyn CounterBackend>>) -> Self {
        Self { backends }
    }

    pub async fn get_metrics(&self, slug: &str, query: &MetricsQuery) -> Result<Metrics> {
        let viewer = query.viewer_id.as_deref();
        let mut last_err = None;

        for backend in &self.backends {
            match backend.get_metrics(slug, viewer).await {
                Ok(mut metrics) => {
                    metrics.range_totals =
                        range_totals(&metrics.history, &query.start_date, &query.end_date);
                    return Ok(metrics);
                }
                Err(err) => {
                    warn!(backend = backend.name(), error = %err, slug, "counter read failed, falling through");
                    last_err = Some(err);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow!("no counter backend configured")))
    }

    /// Count a view. With a viewer id, a repeat view inside the dedup
    /// window does not increment and reports `deduped`. Without one, every
    /// call increments (anonymous best-effort).
    pub async fn bump_view(&self, slug: &str, viewer_id: Option<&str>) -> Result<BumpOutcome> {
        let mut last_err = None;

        for backend in &self.backends {
            match backend.bump_view(slug, viewer_id).await {
                Ok(outcome) => return Ok(outcome),
                Err(err) => {
                    warn!(backend = backend.name(), error = %err, slug, "view bump failed, falling through");
                    last_err = Some(err);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow!("no counter backend configured")))
    }

    /// Idempotent like toggle. Explicit `liked` targets that state, `None`
    /// flips the current one. The counter only moves on a real transition.
    ///
    /// Without a viewer id there is no membership to consult, so the
    /// counter moves on every call; a deliberate, documented limitation of
    /// anonymous traffic rather than something we silently "fix".
    pub async fn set_like_state(
        &self,
        slug: &str,
        viewer_id: Option<&str>,
        liked: Option<bool>,
    ) -> Result<LikeOutcome> {
        let mut last_err = None;

        for backend in &self.backends {
            match backend.set_like_state(slug, viewer_id, liked).await {
                Ok(outcome) => return Ok(outcome),
                Err(err) => {
                    warn!(backend = backend.name(), error = %err, slug, "like toggle failed, falling through");
                    last_err = Some(err);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow!("no counter backend configured")))
    }

    /// Admin absolute set. Clears all per-viewer membership for the slug so
    /// stale `liked` states cannot survive an override.
    pub async fn overwrite_metrics(
        &self,
        slug: &str,
        patch: &OverwritePatch,
    ) -> Result<(u64, u64)> {
        let mut last_err = None;

        for backend in &self.backends {
            let existing = match backend.get_metrics(slug, None).await {
                Ok(metrics) => metrics,
                Err(err) => {
                    warn!(backend = backend.name(), error = %err, slug, "overwrite read failed, falling through");
                    last_err = Some(err);
                    continue;
                }
            };

            let doc = CounterDoc {
                views: patch.views.unwrap_or(existing.views),
                likes: patch.likes.unwrap_or(existing.likes),
                history: patch
                    .history
                    .clone()
                    .unwrap_or_else(|| existing.history.clone()),
            };

            match backend.overwrite(slug, &doc).await {
                Ok(()) => return Ok((doc.views, doc.likes)),
                Err(err) => {
                    warn!(backend = backend.name(), error = %err, slug, "overwrite failed, falling through");
                    last_err = Some(err);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow!("no counter backend configured")))
    }
}

fn range_totals(
    history: &[DailyCount],
    start_date: &Option<String>,
    end_date: &Option<String>,
) -> Option<RangeTotals> {
    if start_date.is_none() && end_date.is_none() {
        return None;
    }

    // ISO date strings compare correctly as strings
    let in_range = |date: &str| {
        start_date.as_deref().map(|s| date >= s).unwrap_or(true)
            && end_date.as_deref().map(|e| date <= e).unwrap_or(true)
    };

    let (views, likes) = history
        .iter()
        .filter(|row| in_range(&row.date))
        .fold((0u64, 0u64), |(v, l), row| (v + row.views, l + row.likes));

    Some(RangeTotals { views, likes })
}

/// Structured validation failure for admin writes; nothing is partially
/// applied when any field is bad.
#[derive(Debug, Clone, Serialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OverwriteRequest {
    pub views: Option<i64>,
    pub likes: Option<i64>,
    pub history: Option<Vec<DailyCountInput>>,
    pub changed_by: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DailyCountInput {
    pub date: String,
    pub views: i64,
    pub likes: i64,
}

pub fn validate_overwrite(request: &OverwriteRequest) -> Result<OverwritePatch, Vec<FieldError>> {
    let mut errors = Vec::new();

    let views = validate_count("views", request.views, &mut errors);
    let likes = validate_count("likes", request.likes, &mut errors);

    let history = request.history.as_ref().map(|rows| {
        rows.iter()
            .enumerate()
            .filter_map(|(i, row)| {
                let mut ok = true;
                if chrono::NaiveDate::parse_from_str(&row.date, "%Y-%m-%d").is_err() {
                    errors.push(FieldError {
                        field: format!("history[{i}].date"),
                        message: "must be a YYYY-MM-DD date".to_string(),
                    });
                    ok = false;
                }
                if row.views < 0 {
                    errors.push(FieldError {
                        field: format!("history[{i}].views"),
                        message: "must be a non-negative integer".to_string(),
                    });
                    ok = false;
                }
                if row.likes < 0 {
                    errors.push(FieldError {
                        field: format!("history[{i}].likes"),
                        message: "must be a non-negative integer".to_string(),
                    });
                    ok = false;
                }
                ok.then(|| DailyCount {
                    date: row.date.clone(),
                    views: row.views as u64,
                    likes: row.likes as u64,
                })
            })
            .collect::<Vec<_>>()
    });

    if !errors.is_empty() {
        return Err(errors);
    }

    Ok(OverwritePatch {
        views,
        likes,
        history,
    })
}

fn validate_count(field: &str, value: Option<i64>, errors: &mut Vec<FieldError>) -> Option<u64> {
    match value {
        Some(v) if v < 0 => {
            errors.push(FieldError {
                field: field.to_string(),
                message: "must be a non-negative integer".to_string(),
            });
            None
        }
        Some(v) => Some(v as u64),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn history_fixture() -> Vec<DailyCount> {
        vec![
            DailyCount {
                date: "2026-08-01".to_string(),
                views: 10,
                likes: 2,
            },
            DailyCount {
                date: "2026-08-02".to_string(),
                views: 5,
                likes: 1,
            },
            DailyCount {
                date: "2026-08-05".to_string(),
                views: 3,
                likes: 0,
            },
        ]
    }

    #[test]
    fn test_range_totals_filters_by_date() {
        let history = history_fixture();

        let totals = range_totals(
            &history,
            &Some("2026-08-02".to_string()),
            &Some("2026-08-05".to_string()),
        )
        .unwrap();
        assert_eq!(totals.views, 8);
        assert_eq!(totals.likes, 1);

        let open_start = range_totals(&history, &None, &Some("2026-08-01".to_string())).unwrap();
        assert_eq!(open_start.views, 10);

        assert!(range_totals(&history, &None, &None).is_none());
    }

    #[test]
    fn test_bump_history_merges_same_day() {
        let mut history = Vec::new();
        bump_history(&mut history, "2026-08-07", 1, 0);
        bump_history(&mut history, "2026-08-07", 1, 1);
        bump_history(&mut history, "2026-08-06", 1, 0);

        assert_eq!(history.len(), 2);
        assert_eq!(history[0].date, "2026-08-06");
        assert_eq!(history[1].views, 2);
        assert_eq!(history[1].likes, 1);

        // Negative deltas floor at zero
        bump_history(&mut history, "2026-08-07", 0, -5);
        assert_eq!(history[1].likes, 0);
    }

    #[test]
    fn test_membership_dedup_does_not_refresh() {
        let sets = MembershipSets::new();
        assert!(sets.mark_viewed("post", "v1"));
        assert!(!sets.mark_viewed("post", "v1"));
        assert!(sets.mark_viewed("post", "v2"));

        assert!(sets.mark_liked("post", "v1"));
        assert!(sets.is_liked("post", "v1"));
        assert!(!sets.mark_liked("post", "v1"));
        assert!(sets.unmark_liked("post", "v1"));
        assert!(!sets.unmark_liked("post", "v1"));

        sets.mark_liked("post", "v1");
        sets.clear_slug("post");
        assert!(!sets.is_liked("post", "v1"));
        assert!(sets.mark_viewed("post", "v1"));
    }

    #[test]
    fn test_validate_overwrite_collects_field_errors() {
        let request = OverwriteRequest {
            views: Some(-1),
            likes: Some(3),
            history: Some(vec![DailyCountInput {
                date: "not-a-date".to_string(),
                views: 1,
                likes: -2,
            }]),
            changed_by: None,
        };

        let errors = validate_overwrite(&request).unwrap_err();
        let fields: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();
        assert!(fields.contains(&"views"));
        assert!(fields.contains(&"history[0].date"));
        assert!(fields.contains(&"history[0].likes"));
    }

    #[test]
    fn test_validate_overwrite_accepts_partial_patch() {
        let request = OverwriteRequest {
            views: Some(10),
            likes: None,
            history: None,
            changed_by: Some("ops".to_string()),
        };

        let patch = validate_overwrite(&request).unwrap();
        assert_eq!(patch.views, Some(10));
        assert_eq!(patch.likes, None);
        assert!(patch.history.is_none());
    }
}

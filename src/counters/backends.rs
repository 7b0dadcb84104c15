//! Counter backend implementations
//!
//! `KvCounterBackend` keeps counters as hash fields and membership as
//! native TTL sets in the shared tier. `DurableCounterBackend` writes
//! through one JSON document per slug and borrows in-process membership
//! (the document store tracks none). `MemoryCounterBackend` is the tier of
//! last resort and never fails.

use super::{
    add_clamped, bump_history, today, BumpOutcome, CounterDoc, DailyCount, LikeOutcome,
    MembershipSets, Metrics, LIKE_MEMBERSHIP_TTL, VIEW_DEDUP_TTL,
};
use crate::kv::KvTier;
use crate::storage::{bounded, DurableStore};
use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;

#[async_trait]
pub trait CounterBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Current counters, history, and (when a viewer id is given) whether
    /// that viewer has an active like.
    async fn get_metrics(&self, slug: &str, viewer_id: Option<&str>) -> Result<Metrics>;

    async fn bump_view(&self, slug: &str, viewer_id: Option<&str>) -> Result<BumpOutcome>;

    async fn set_like_state(
        &self,
        slug: &str,
        viewer_id: Option<&str>,
        liked: Option<bool>,
    ) -> Result<LikeOutcome>;

    /// Absolute set; must also clear per-viewer membership for the slug.
    async fn overwrite(&self, slug: &str, doc: &CounterDoc) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Shared key-value tier
// ---------------------------------------------------------------------------

pub struct KvCounterBackend {
    kv: Arc<dyn KvTier>,
}

impl KvCounterBackend {
    pub fn new(kv: Arc<dyn KvTier>) -> Self {
        Self { kv }
    }

    fn counter_key(slug: &str) -> String {
        format!("counter:{slug}")
    }

    fn viewed_key(slug: &str) -> String {
        format!("viewed:{slug}")
    }

    fn liked_key(slug: &str) -> String {
        format!("liked:{slug}")
    }

    async fn load_doc(&self, slug: &str) -> Result<CounterDoc> {
        let fields = self.kv.hash_get_all(&Self::counter_key(slug)).await?;
        Ok(doc_from_fields(fields))
    }

    /// Decrement likes by one, floored at zero. The read-then-decrement is
    /// racy between two concurrent unlikes for the same viewer; accepted as
    /// expected-rare rather than lock-defended.
    async fn decrement_likes(&self, slug: &str) -> Result<()> {
        let doc = self.load_doc(slug).await?;
        if doc.likes > 0 {
            self.kv
                .hash_incr(
                    &Self::counter_key(slug),
                    &[
                        ("likes".to_string(), -1),
                        (format!("l:{}", today()), -1),
                    ],
                )
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl CounterBackend for KvCounterBackend {
    fn name(&self) -> &'static str {
        "kv"
    }

    async fn get_metrics(&self, slug: &str, viewer_id: Option<&str>) -> Result<Metrics> {
        let doc = self.load_doc(slug).await?;

        let liked = match viewer_id {
            Some(viewer) => Some(self.kv.set_contains(&Self::liked_key(slug), viewer).await?),
            None => None,
        };

        Ok(Metrics {
            views: doc.views,
            likes: doc.likes,
            liked,
            history: doc.history,
            range_totals: None,
        })
    }

    async fn bump_view(&self, slug: &str, viewer_id: Option<&str>) -> Result<BumpOutcome> {
        let mut deduped = false;

        if let Some(viewer) = viewer_id {
            let newly = self
                .kv
                .set_add(&Self::viewed_key(slug), viewer, Some(VIEW_DEDUP_TTL))
                .await?;
            deduped = !newly;
        }

        if !deduped {
            self.kv
                .hash_incr(
                    &Self::counter_key(slug),
                    &[("views".to_string(), 1), (format!("v:{}", today()), 1)],
                )
                .await?;
        }

        let doc = self.load_doc(slug).await?;
        let liked = match viewer_id {
            Some(viewer) => self.kv.set_contains(&Self::liked_key(slug), viewer).await?,
            None => false,
        };

        Ok(BumpOutcome {
            views: doc.views,
            likes: doc.likes,
            liked,
            deduped,
        })
    }

    async fn set_like_state(
        &self,
        slug: &str,
        viewer_id: Option<&str>,
        liked: Option<bool>,
    ) -> Result<LikeOutcome> {
        let target = match viewer_id {
            Some(viewer) => {
                let currently = self.kv.set_contains(&Self::liked_key(slug), viewer).await?;
                let target = liked.unwrap_or(!currently);

                if target {
                    let newly = self
                        .kv
                        .set_add(&Self::liked_key(slug), viewer, Some(LIKE_MEMBERSHIP_TTL))
                        .await?;
                    if newly {
                        self.kv
                            .hash_incr(
                                &Self::counter_key(slug),
                                &[("likes".to_string(), 1), (format!("l:{}", today()), 1)],
                            )
                            .await?;
                    }
                } else {
                    let removed = self.kv.set_remove(&Self::liked_key(slug), viewer).await?;
                    if removed {
                        self.decrement_likes(slug).await?;
                    }
                }
                target
            }
            None => {
                // No membership to flip: an unspecified toggle counts as a
                // like, and every call moves the counter.
                let target = liked.unwrap_or(true);
                if target {
                    self.kv
                        .hash_incr(
                            &Self::counter_key(slug),
                            &[("likes".to_string(), 1), (format!("l:{}", today()), 1)],
                        )
                        .await?;
                } else {
                    self.decrement_likes(slug).await?;
                }
                target
            }
        };

        let doc = self.load_doc(slug).await?;
        Ok(LikeOutcome {
            views: doc.views,
            likes: doc.likes,
            liked: target,
        })
    }

    async fn overwrite(&self, slug: &str, doc: &CounterDoc) -> Result<()> {
        self.kv.delete(&Self::counter_key(slug)).await?;
        self.kv.delete(&Self::viewed_key(slug)).await?;
        self.kv.delete(&Self::liked_key(slug)).await?;

        let mut fields = vec![
            ("views".to_string(), doc.views as i64),
            ("likes".to_string(), doc.likes as i64),
        ];
        for row in &doc.history {
            fields.push((format!("v:{}", row.date), row.views as i64));
            fields.push((format!("l:{}", row.date), row.likes as i64));
        }

        self.kv.hash_set(&Self::counter_key(slug), &fields).await
    }
}

fn doc_from_fields(fields: Vec<(String, i64)>) -> CounterDoc {
    let mut doc = CounterDoc::default();
    let mut daily: BTreeMap<String, (u64, u64)> = BTreeMap::new();

    for (field, value) in fields {
        match field.as_str() {
            "views" => doc.views = value.max(0) as u64,
            "likes" => doc.likes = value.max(0) as u64,
            _ => {
                if let Some(date) = field.strip_prefix("v:") {
                    daily.entry(date.to_string()).or_default().0 = value.max(0) as u64;
                } else if let Some(date) = field.strip_prefix("l:") {
                    daily.entry(date.to_string()).or_default().1 = value.max(0) as u64;
                }
            }
        }
    }

    doc.history = daily
        .into_iter()
        .map(|(date, (views, likes))| DailyCount { date, views, likes })
        .collect();
    doc
}

// ---------------------------------------------------------------------------
// Durable write-through document store
// ---------------------------------------------------------------------------

pub struct DurableCounterBackend {
    store: Arc<dyn DurableStore>,
    membership: Arc<MembershipSets>,
}

impl DurableCounterBackend {
    pub fn new(store: Arc<dyn DurableStore>, membership: Arc<MembershipSets>) -> Self {
        Self { store, membership }
    }
}

#[async_trait]
impl CounterBackend for DurableCounterBackend {
    fn name(&self) -> &'static str {
        "durable"
    }

    async fn get_metrics(&self, slug: &str, viewer_id: Option<&str>) -> Result<Metrics> {
        let doc = bounded(self.store.load_counter_doc(slug))
            .await?
            .unwrap_or_default();

        Ok(Metrics {
            views: doc.views,
            likes: doc.likes,
            liked: viewer_id.map(|viewer| self.membership.is_liked(slug, viewer)),
            history: doc.history,
            range_totals: None,
        })
    }

    async fn bump_view(&self, slug: &str, viewer_id: Option<&str>) -> Result<BumpOutcome> {
        let deduped = match viewer_id {
            Some(viewer) => !self.membership.mark_viewed(slug, viewer),
            None => false,
        };

        let mut doc = bounded(self.store.load_counter_doc(slug))
            .await?
            .unwrap_or_default();

        if !deduped {
            doc.views += 1;
            bump_history(&mut doc.history, &today(), 1, 0);
            bounded(self.store.store_counter_doc(slug, &doc)).await?;
        }

        Ok(BumpOutcome {
            views: doc.views,
            likes: doc.likes,
            liked: viewer_id
                .map(|viewer| self.membership.is_liked(slug, viewer))
                .unwrap_or(false),
            deduped,
        })
    }

    async fn set_like_state(
        &self,
        slug: &str,
        viewer_id: Option<&str>,
        liked: Option<bool>,
    ) -> Result<LikeOutcome> {
        let (target, delta) = match viewer_id {
            Some(viewer) => {
                let currently = self.membership.is_liked(slug, viewer);
                let target = liked.unwrap_or(!currently);
                let delta = if target {
                    if self.membership.mark_liked(slug, viewer) {
                        1
                    } else {
                        0
                    }
                } else if self.membership.unmark_liked(slug, viewer) {
                    -1
                } else {
                    0
                };
                (target, delta)
            }
            None => {
                let target = liked.unwrap_or(true);
                (target, if target { 1 } else { -1 })
            }
        };

        let mut doc = bounded(self.store.load_counter_doc(slug))
            .await?
            .unwrap_or_default();

        if delta != 0 {
            doc.likes = add_clamped(doc.likes, delta);
            bump_history(&mut doc.history, &today(), 0, delta);
            bounded(self.store.store_counter_doc(slug, &doc)).await?;
        }

        Ok(LikeOutcome {
            views: doc.views,
            likes: doc.likes,
            liked: target,
        })
    }

    async fn overwrite(&self, slug: &str, doc: &CounterDoc) -> Result<()> {
        bounded(self.store.store_counter_doc(slug, doc)).await?;
        self.membership.clear_slug(slug);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-process memory, tier of last resort
// ---------------------------------------------------------------------------

pub struct MemoryCounterBackend {
    docs: DashMap<String, CounterDoc>,
    membership: Arc<MembershipSets>,
}

impl MemoryCounterBackend {
    pub fn new(membership: Arc<MembershipSets>) -> Self {
        Self {
            docs: DashMap::new(),
            membership,
        }
    }
}

#[async_trait]
impl CounterBackend for MemoryCounterBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get_metrics(&self, slug: &str, viewer_id: Option<&str>) -> Result<Metrics> {
        let doc = self
            .docs
            .get(slug)
            .map(|entry| entry.clone())
            .unwrap_or_default();

        Ok(Metrics {
            views: doc.views,
            likes: doc.likes,
            liked: viewer_id.map(|viewer| self.membership.is_liked(slug, viewer)),
            history: doc.history,
            range_totals: None,
        })
    }

    async fn bump_view(&self, slug: &str, viewer_id: Option<&str>) -> Result<BumpOutcome> {
        let deduped = match viewer_id {
            Some(viewer) => !self.membership.mark_viewed(slug, viewer),
            None => false,
        };

        let mut entry = self.docs.entry(slug.to_string()).or_default();
        if !deduped {
            entry.views += 1;
            bump_history(&mut entry.history, &today(), 1, 0);
        }
        let doc = entry.clone();
        drop(entry);

        Ok(BumpOutcome {
            views: doc.views,
            likes: doc.likes,
            liked: viewer_id
                .map(|viewer| self.membership.is_liked(slug, viewer))
                .unwrap_or(false),
            deduped,
        })
    }

    async fn set_like_state(
        &self,
        slug: &str,
        viewer_id: Option<&str>,
        liked: Option<bool>,
    ) -> Result<LikeOutcome> {
        let (target, delta) = match viewer_id {
            Some(viewer) => {
                let currently = self.membership.is_liked(slug, viewer);
                let target = liked.unwrap_or(!currently);
                let delta = if target {
                    if self.membership.mark_liked(slug, viewer) {
                        1
                    } else {
                        0
                    }
                } else if self.membership.unmark_liked(slug, viewer) {
                    -1
                } else {
                    0
                };
                (target, delta)
            }
            None => {
                let target = liked.unwrap_or(true);
                (target, if target { 1 } else { -1 })
            }
        };

        let mut entry = self.docs.entry(slug.to_string()).or_default();
        if delta != 0 {
            entry.likes = add_clamped(entry.likes, delta);
            bump_history(&mut entry.history, &today(), 0, delta);
        }
        let doc = entry.clone();
        drop(entry);

        Ok(LikeOutcome {
            views: doc.views,
            likes: doc.likes,
            liked: target,
        })
    }

    async fn overwrite(&self, slug: &str, doc: &CounterDoc) -> Result<()> {
        self.docs.insert(slug.to_string(), doc.clone());
        self.membership.clear_slug(slug);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;

    fn kv_backend() -> KvCounterBackend {
        KvCounterBackend::new(Arc::new(MemoryKv::new()))
    }

    #[tokio::test]
    async fn test_kv_bump_view_dedups_within_window() {
        let backend = kv_backend();

        let first = backend.bump_view("post", Some("viewer-1")).await.unwrap();
        assert_eq!(first.views, 1);
        assert!(!first.deduped);

        let second = backend.bump_view("post", Some("viewer-1")).await.unwrap();
        assert_eq!(second.views, 1);
        assert!(second.deduped);

        let other = backend.bump_view("post", Some("viewer-2")).await.unwrap();
        assert_eq!(other.views, 2);
        assert!(!other.deduped);
    }

    #[tokio::test]
    async fn test_kv_anonymous_views_always_count() {
        let backend = kv_backend();
        backend.bump_view("post", None).await.unwrap();
        let second = backend.bump_view("post", None).await.unwrap();
        assert_eq!(second.views, 2);
        assert!(!second.deduped);
    }

    #[tokio::test]
    async fn test_kv_like_toggle_is_idempotent() {
        let backend = kv_backend();

        let liked = backend
            .set_like_state("post", Some("v1"), Some(true))
            .await
            .unwrap();
        assert_eq!(liked.likes, 1);
        assert!(liked.liked);

        let again = backend
            .set_like_state("post", Some("v1"), Some(true))
            .await
            .unwrap();
        assert_eq!(again.likes, 1);

        let unliked = backend
            .set_like_state("post", Some("v1"), Some(false))
            .await
            .unwrap();
        assert_eq!(unliked.likes, 0);
        assert!(!unliked.liked);

        // Unliking again stays floored at zero
        let floor = backend
            .set_like_state("post", Some("v1"), Some(false))
            .await
            .unwrap();
        assert_eq!(floor.likes, 0);
    }

    #[tokio::test]
    async fn test_kv_unspecified_toggle_flips() {
        let backend = kv_backend();

        let on = backend.set_like_state("post", Some("v1"), None).await.unwrap();
        assert!(on.liked);
        assert_eq!(on.likes, 1);

        let off = backend.set_like_state("post", Some("v1"), None).await.unwrap();
        assert!(!off.liked);
        assert_eq!(off.likes, 0);
    }

    #[tokio::test]
    async fn test_kv_overwrite_clears_membership() {
        let backend = kv_backend();

        backend.bump_view("post", Some("v1")).await.unwrap();
        backend
            .set_like_state("post", Some("v1"), Some(true))
            .await
            .unwrap();

        backend
            .overwrite(
                "post",
                &CounterDoc {
                    views: 10,
                    likes: 3,
                    history: vec![],
                },
            )
            .await
            .unwrap();

        let metrics = backend.get_metrics("post", Some("v1")).await.unwrap();
        assert_eq!(metrics.views, 10);
        assert_eq!(metrics.likes, 3);
        assert_eq!(metrics.liked, Some(false));

        // The viewer counts again after the membership reset
        let bumped = backend.bump_view("post", Some("v1")).await.unwrap();
        assert!(!bumped.deduped);
        assert_eq!(bumped.views, 11);
    }

    #[tokio::test]
    async fn test_memory_backend_matches_kv_semantics() {
        let backend = MemoryCounterBackend::new(Arc::new(MembershipSets::new()));

        let first = backend.bump_view("post", Some("v1")).await.unwrap();
        assert!(!first.deduped);
        let second = backend.bump_view("post", Some("v1")).await.unwrap();
        assert!(second.deduped);
        assert_eq!(second.views, 1);

        backend
            .set_like_state("post", Some("v1"), Some(true))
            .await
            .unwrap();
        let again = backend
            .set_like_state("post", Some("v1"), Some(true))
            .await
            .unwrap();
        assert_eq!(again.likes, 1);

        let metrics = backend.get_metrics("post", Some("v1")).await.unwrap();
        assert_eq!(metrics.liked, Some(true));
        assert_eq!(metrics.history.len(), 1);
        assert_eq!(metrics.history[0].views, 1);
        assert_eq!(metrics.history[0].likes, 1);
    }
}

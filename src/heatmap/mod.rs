//! Spatial interaction heatmaps
//!
//! Per-slug cell counters keyed by a composite `(bucket, section, type,
//! cell)` key. One recording call's increments apply through a single
//! atomic multi-field operation so no torn state is observable; the same
//! batch is independently forwarded, best-effort, to a durable daily
//! rollup sink whose failures never affect the primary counters.

use crate::kv::KvTier;
use crate::storage::{DurableStore, HeatmapRollupRow};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::warn;

pub const GRID_COLUMNS: u32 = 12;

/// Merged cells applied per recording call.
pub const MAX_CELLS_PER_BATCH: usize = 30;

/// Cell indexes above this are dropped; bounds the dense snapshot grid.
pub const MAX_CELL_INDEX: u32 = 4095;

const SEGMENT_MAX_LEN: usize = 32;

/// Composite heatmap key with a deterministic encode/parse pair.
///
/// Segments are sanitized to `[a-z0-9_-]` before a key is built, so the
/// `|` delimiter cannot occur inside a segment and the encoding is
/// injective.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct CellKey {
    pub bucket: String,
    pub section: String,
    pub kind: String,
    pub cell: u32,
}

impl CellKey {
    pub fn encode(&self) -> String {
        format!("{}|{}|{}|{}", self.bucket, self.section, self.kind, self.cell)
    }

    pub fn parse(field: &str) -> Option<Self> {
        let mut parts = field.split('|');
        let bucket = parts.next()?.to_string();
        let section = parts.next()?.to_string();
        let kind = parts.next()?.to_string();
        let cell = parts.next()?.parse::<u32>().ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self {
            bucket,
            section,
            kind,
            cell,
        })
    }
}

/// Lowercase, keep `[a-z0-9_-]`, cap the length; anything unusable falls
/// back to the given default.
pub fn sanitize_segment(value: Option<&str>, fallback: &str) -> String {
    let cleaned: String = value
        .unwrap_or_default()
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '_' || *c == '-')
        .take(SEGMENT_MAX_LEN)
        .collect();

    if cleaned.is_empty() {
        fallback.to_string()
    } else {
        cleaned
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HeatmapBatch {
    pub bucket: Option<String>,
    pub cells: Vec<CellSample>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CellSample {
    pub cell: u32,
    pub count: Option<u64>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub section: Option<String>,
}

#[async_trait]
pub trait HeatmapBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Apply all increments as one atomic operation.
    async fn record(&self, slug: &str, increments: &[(CellKey, u64)]) -> Result<()>;

    async fn load(&self, slug: &str) -> Result<Vec<(CellKey, u64)>>;

    /// Slugs that have recorded at least one sample.
    async fn slugs(&self) -> Result<Vec<String>>;
}

pub struct KvHeatmapBackend {
    kv: Arc<dyn KvTier>,
}

impl KvHeatmapBackend {
    pub fn new(kv: Arc<dyn KvTier>) -> Self {
        Self { kv }
    }

    fn hash_key(slug: &str) -> String {
        format!("heatmap:{slug}")
    }
}

#[async_trait]
impl HeatmapBackend for KvHeatmapBackend {
    fn name(&self) -> &'static str {
        "kv"
    }

    async fn record(&self, slug: &str, increments: &[(CellKey, u64)]) -> Result<()> {
        let fields: Vec<(String, i64)> = increments
            .iter()
            .map(|(key, count)| (key.encode(), *count as i64))
            .collect();

        self.kv.hash_incr(&Self::hash_key(slug), &fields).await?;
        self.kv.set_add("heatmap:slugs", slug, None).await?;
        Ok(())
    }

    async fn load(&self, slug: &str) -> Result<Vec<(CellKey, u64)>> {
        let fields = self.kv.hash_get_all(&Self::hash_key(slug)).await?;
        // Unparseable fields are skipped, not errors
        Ok(fields
            .into_iter()
            .filter_map(|(field, count)| {
                CellKey::parse(&field).map(|key| (key, count.max(0) as u64))
            })
            .collect())
    }

    async fn slugs(&self) -> Result<Vec<String>> {
        self.kv.set_members("heatmap:slugs").await
    }
}

pub struct MemoryHeatmapBackend {
    cells: DashMap<String, HashMap<CellKey, u64>>,
}

impl MemoryHeatmapBackend {
    pub fn new() -> Self {
        Self {
            cells: DashMap::new(),
        }
    }
}

impl Default for MemoryHeatmapBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HeatmapBackend for MemoryHeatmapBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn record(&self, slug: &str, increments: &[(CellKey, u64)]) -> Result<()> {
        // The entry lock makes the whole batch atomic
        let mut slug_cells = self.cells.entry(slug.to_string()).or_default();
        for (key, count) in increments {
            *slug_cells.entry(key.clone()).or_insert(0) += count;
        }
        Ok(())
    }

    async fn load(&self, slug: &str) -> Result<Vec<(CellKey, u64)>> {
        Ok(self
            .cells
            .get(slug)
            .map(|cells| cells.iter().map(|(k, v)| (k.clone(), *v)).collect())
            .unwrap_or_default())
    }

    async fn slugs(&self) -> Result<Vec<String>> {
        Ok(self.cells.iter().map(|entry| entry.key().clone()).collect())
    }
}

// ---------------------------------------------------------------------------
// Snapshot shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct HeatmapSnapshot {
    pub slug: String,
    pub total: u64,
    pub buckets: Vec<BucketGrid>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BucketGrid {
    pub bucket: String,
    pub columns: u32,
    pub rows: u32,
    pub total: u64,
    pub max: u64,
    pub grid: Vec<Vec<u64>>,
    pub ratio: Vec<Vec<f64>>,
    pub intensity: Vec<Vec<f64>>,
    pub section_totals: BTreeMap<String, u64>,
    pub type_totals: BTreeMap<String, u64>,
    pub top_cells: Vec<TopCell>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TopCell {
    pub section: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub cell: u32,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HeatmapSummary {
    pub slug: String,
    pub total: u64,
    pub distinct_cells: usize,
    pub bucket_totals: BTreeMap<String, u64>,
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

pub struct HeatmapStore {
    backends: Vec<Arc<dyn HeatmapBackend>>,
    durable: Option<Arc<dyn DurableStore>>,
}

impl HeatmapStore {
    pub fn new(
        backends: Vec<Arc<dyn HeatmapBackend>>,
        durable: Option<Arc<dyn DurableStore>>,
    ) -> Self {
        Self { backends, durable }
    }

    /// Merge, sanitize and record one batch of samples. Returns the number
    /// of merged cells applied.
    pub async fn record_samples(&self, slug: &str, batch: &HeatmapBatch) -> Result<usize> {
        let increments = merge_batch(batch);
        if increments.is_empty() {
            return Ok(0);
        }

        let mut last_err = None;
        let mut recorded = false;
        for backend in &self.backends {
            match backend.record(slug, &increments).await {
                Ok(()) => {
                    recorded = true;
                    break;
                }
                Err(err) => {
                    warn!(backend = backend.name(), error = %err, slug, "heatmap record failed, falling through");
                    last_err = Some(err);
                }
            }
        }

        if !recorded {
            return Err(last_err.unwrap_or_else(|| anyhow!("no heatmap backend configured")));
        }

        // Best-effort durable rollup: spawned, error-swallowed, and
        // irrelevant to the primary result.
        if let Some(durable) = self.durable.clone() {
            let date_key = chrono::Utc::now().format("%Y-%m-%d").to_string();
            let slug = slug.to_string();
            let rows: Vec<HeatmapRollupRow> = increments
                .iter()
                .map(|(key, count)| HeatmapRollupRow {
                    date_key: date_key.clone(),
                    slug: slug.clone(),
                    bucket: key.bucket.clone(),
                    section: key.section.clone(),
                    kind: key.kind.clone(),
                    cell: key.cell,
                    count: *count as i64,
                })
                .collect();

            tokio::spawn(async move {
                if let Err(err) = durable.upsert_heatmap_rollups(&rows).await {
                    warn!(error = %err, slug = %slug, "heatmap rollup sink write failed");
                }
            });
        }

        Ok(increments.len())
    }

    pub async fn snapshot(&self, slug: &str) -> Result<HeatmapSnapshot> {
        let cells = self.load_cells(slug).await?;
        Ok(build_snapshot(slug, cells))
    }

    pub async fn list_summaries(&self) -> Result<Vec<HeatmapSummary>> {
        let slugs = self.first_ok_slugs().await?;
        let mut summaries = Vec::with_capacity(slugs.len());

        for slug in slugs {
            let cells = self.load_cells(&slug).await?;
            let total: u64 = cells.iter().map(|(_, count)| *count).sum();
            let mut bucket_totals = BTreeMap::new();
            for (key, count) in &cells {
                *bucket_totals.entry(key.bucket.clone()).or_insert(0) += count;
            }
            summaries.push(HeatmapSummary {
                slug,
                total,
                distinct_cells: cells.len(),
                bucket_totals,
            });
        }

        summaries.sort_by(|a, b| b.total.cmp(&a.total).then_with(|| a.slug.cmp(&b.slug)));
        Ok(summaries)
    }

    async fn load_cells(&self, slug: &str) -> Result<Vec<(CellKey, u64)>> {
        let mut last_err = None;
        for backend in &self.backends {
            match backend.load(slug).await {
                Ok(cells) => return Ok(cells),
                Err(err) => {
                    warn!(backend = backend.name(), error = %err, slug, "heatmap load failed, falling through");
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow!("no heatmap backend configured")))
    }

    async fn first_ok_slugs(&self) -> Result<Vec<String>> {
        let mut last_err = None;
        for backend in &self.backends {
            match backend.slugs().await {
                Ok(slugs) => return Ok(slugs),
                Err(err) => {
                    warn!(backend = backend.name(), error = %err, "heatmap slug listing failed, falling through");
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow!("no heatmap backend configured")))
    }
}

/// Coalesce a client batch by `(section, type, cell)` under one sanitized
/// bucket, dropping out-of-range cells and capping the merged size.
fn merge_batch(batch: &HeatmapBatch) -> Vec<(CellKey, u64)> {
    let bucket = sanitize_segment(batch.bucket.as_deref(), "default");

    let mut merged: Vec<(CellKey, u64)> = Vec::new();
    for sample in &batch.cells {
        if sample.cell > MAX_CELL_INDEX {
            continue;
        }
        let key = CellKey {
            bucket: bucket.clone(),
            section: sanitize_segment(sample.section.as_deref(), "root"),
            kind: sanitize_segment(sample.kind.as_deref(), "generic"),
            cell: sample.cell,
        };
        let count = sample.count.unwrap_or(1).max(1);

        if let Some(existing) = merged.iter_mut().find(|(k, _)| *k == key) {
            existing.1 += count;
        } else {
            merged.push((key, count));
        }
    }

    merged.truncate(MAX_CELLS_PER_BATCH);
    merged
}

fn build_snapshot(slug: &str, cells: Vec<(CellKey, u64)>) -> HeatmapSnapshot {
    let total: u64 = cells.iter().map(|(_, count)| *count).sum();

    let mut by_bucket: BTreeMap<String, Vec<(CellKey, u64)>> = BTreeMap::new();
    for (key, count) in cells {
        by_bucket.entry(key.bucket.clone()).or_default().push((key, count));
    }

    // Empty input yields an explicit zero grid under the default bucket
    if by_bucket.is_empty() {
        by_bucket.insert("default".to_string(), Vec::new());
    }

    let buckets = by_bucket
        .into_iter()
        .map(|(bucket, cells)| build_bucket_grid(bucket, cells))
        .collect();

    HeatmapSnapshot {
        slug: slug.to_string(),
        total,
        buckets,
    }
}

fn build_bucket_grid(bucket: String, cells: Vec<(CellKey, u64)>) -> BucketGrid {
    let max_cell = cells.iter().map(|(key, _)| key.cell).max();
    let rows = max_cell
        .map(|max| (max + 1).div_ceil(GRID_COLUMNS))
        .unwrap_or(0);

    let mut grid = vec![vec![0u64; GRID_COLUMNS as usize]; rows as usize];
    let mut section_totals: BTreeMap<String, u64> = BTreeMap::new();
    let mut type_totals: BTreeMap<String, u64> = BTreeMap::new();

    for (key, count) in &cells {
        let row = (key.cell / GRID_COLUMNS) as usize;
        let col = (key.cell % GRID_COLUMNS) as usize;
        grid[row][col] += count;
        *section_totals.entry(key.section.clone()).or_insert(0) += count;
        *type_totals.entry(key.kind.clone()).or_insert(0) += count;
    }

    let total: u64 = cells.iter().map(|(_, count)| *count).sum();
    let max: u64 = grid
        .iter()
        .flat_map(|row| row.iter())
        .copied()
        .max()
        .unwrap_or(0);

    let ratio = derive_matrix(&grid, total);
    let intensity = derive_matrix(&grid, max);

    let mut top_cells: Vec<TopCell> = cells
        .iter()
        .map(|(key, count)| TopCell {
            section: key.section.clone(),
            kind: key.kind.clone(),
            cell: key.cell,
            count: *count,
        })
        .collect();
    top_cells.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.cell.cmp(&b.cell)));
    top_cells.truncate(20);

    BucketGrid {
        bucket,
        columns: GRID_COLUMNS,
        rows,
        total,
        max,
        grid,
        ratio,
        intensity,
        section_totals,
        type_totals,
        top_cells,
    }
}

fn derive_matrix(grid: &[Vec<u64>], denominator: u64) -> Vec<Vec<f64>> {
    grid.iter()
        .map(|row| {
            row.iter()
                .map(|count| {
                    if denominator == 0 {
                        0.0
                    } else {
                        *count as f64 / denominator as f64
                    }
                })
                .collect()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> HeatmapStore {
        HeatmapStore::new(vec![Arc::new(MemoryHeatmapBackend::new())], None)
    }

    fn sample(cell: u32, count: u64) -> CellSample {
        CellSample {
            cell,
            count: Some(count),
            kind: None,
            section: None,
        }
    }

    #[test]
    fn test_cell_key_round_trips() {
        let key = CellKey {
            bucket: "mobile".to_string(),
            section: "hero".to_string(),
            kind: "click".to_string(),
            cell: 23,
        };
        assert_eq!(key.encode(), "mobile|hero|click|23");
        assert_eq!(CellKey::parse(&key.encode()), Some(key));

        assert_eq!(CellKey::parse("too|few|parts"), None);
        assert_eq!(CellKey::parse("a|b|c|not-a-number"), None);
        assert_eq!(CellKey::parse("a|b|c|1|extra"), None);
    }

    #[test]
    fn test_sanitize_segment_fallbacks() {
        assert_eq!(sanitize_segment(Some("Mobile"), "default"), "mobile");
        assert_eq!(sanitize_segment(Some("<script>"), "default"), "script");
        assert_eq!(sanitize_segment(Some("|||"), "default"), "default");
        assert_eq!(sanitize_segment(None, "root"), "root");
        assert_eq!(sanitize_segment(Some(""), "generic"), "generic");

        let long = "x".repeat(100);
        assert_eq!(sanitize_segment(Some(&long), "default").len(), 32);
    }

    #[tokio::test]
    async fn test_duplicate_cells_merge_within_one_call() {
        let store = store();
        let recorded = store
            .record_samples(
                "post",
                &HeatmapBatch {
                    bucket: None,
                    cells: vec![sample(0, 2), sample(0, 3)],
                },
            )
            .await
            .unwrap();
        assert_eq!(recorded, 1);

        let snapshot = store.snapshot("post").await.unwrap();
        assert_eq!(snapshot.total, 5);
        assert_eq!(snapshot.buckets[0].grid[0][0], 5);
    }

    #[tokio::test]
    async fn test_grid_rows_from_max_cell() {
        let store = store();
        store
            .record_samples(
                "post",
                &HeatmapBatch {
                    bucket: None,
                    cells: vec![sample(23, 1)],
                },
            )
            .await
            .unwrap();

        let snapshot = store.snapshot("post").await.unwrap();
        let bucket = &snapshot.buckets[0];
        assert_eq!(bucket.rows, 2);
        assert_eq!(bucket.columns, 12);
        assert_eq!(bucket.grid[1][11], 1);
    }

    #[tokio::test]
    async fn test_empty_snapshot_is_a_zero_grid() {
        let store = store();
        let snapshot = store.snapshot("nothing-recorded").await.unwrap();
        assert_eq!(snapshot.total, 0);
        assert_eq!(snapshot.buckets.len(), 1);
        assert_eq!(snapshot.buckets[0].bucket, "default");
        assert_eq!(snapshot.buckets[0].rows, 0);
        assert!(snapshot.buckets[0].grid.is_empty());
    }

    #[tokio::test]
    async fn test_batch_cap_and_cell_bounds() {
        let store = store();
        let cells: Vec<CellSample> = (0..40).map(|i| sample(i, 1)).collect();
        let recorded = store
            .record_samples("post", &HeatmapBatch { bucket: None, cells })
            .await
            .unwrap();
        assert_eq!(recorded, MAX_CELLS_PER_BATCH);

        let dropped = store
            .record_samples(
                "post",
                &HeatmapBatch {
                    bucket: None,
                    cells: vec![sample(MAX_CELL_INDEX + 1, 1)],
                },
            )
            .await
            .unwrap();
        assert_eq!(dropped, 0);
    }

    #[tokio::test]
    async fn test_snapshot_rollups_and_ratios() {
        let store = store();
        store
            .record_samples(
                "post",
                &HeatmapBatch {
                    bucket: Some("Mobile".to_string()),
                    cells: vec![
                        CellSample {
                            cell: 0,
                            count: Some(3),
                            kind: Some("click".to_string()),
                            section: Some("hero".to_string()),
                        },
                        CellSample {
                            cell: 1,
                            count: Some(1),
                            kind: Some("hover".to_string()),
                            section: Some("footer".to_string()),
                        },
                    ],
                },
            )
            .await
            .unwrap();

        let snapshot = store.snapshot("post").await.unwrap();
        let bucket = &snapshot.buckets[0];
        assert_eq!(bucket.bucket, "mobile");
        assert_eq!(bucket.section_totals["hero"], 3);
        assert_eq!(bucket.type_totals["hover"], 1);
        assert_eq!(bucket.top_cells[0].cell, 0);
        assert!((bucket.ratio[0][0] - 0.75).abs() < f64::EPSILON);
        assert!((bucket.intensity[0][1] - 1.0 / 3.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_summaries_sorted_by_total() {
        let store = store();
        store
            .record_samples(
                "small",
                &HeatmapBatch {
                    bucket: None,
                    cells: vec![sample(0, 1)],
                },
            )
            .await
            .unwrap();
        store
            .record_samples(
                "big",
                &HeatmapBatch {
                    bucket: None,
                    cells: vec![sample(0, 9)],
                },
            )
            .await
            .unwrap();

        let summaries = store.list_summaries().await.unwrap();
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].slug, "big");
        assert_eq!(summaries[0].total, 9);
        assert_eq!(summaries[1].distinct_cells, 1);
    }
}

use crate::audit::AuditEntry;
use crate::counters::CounterDoc;
use crate::events::EventRecord;
use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("durable store call timed out")]
    Timeout,
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Additive delta folded into one 10-minute rollup row.
#[derive(Debug, Clone)]
pub struct RollupDelta {
    /// Epoch seconds, aligned to a 10-minute boundary.
    pub bucket_start: i64,
    pub event_name: String,
    pub slug: Option<String>,
    pub visit_delta: i64,
    /// Sessions newly added to the window's session set by this flush.
    pub unique_delta: i64,
    pub last_seen_at: i64,
}

/// One stored 10-minute rollup row.
#[derive(Debug, Clone)]
pub struct RollupRow {
    pub bucket_start: i64,
    pub event_name: String,
    pub slug: Option<String>,
    pub visit_count: i64,
    pub unique_sessions: i64,
    pub last_seen_at: i64,
}

/// Daily heatmap rollup row, written best-effort beside the live cells.
#[derive(Debug, Clone)]
pub struct HeatmapRollupRow {
    pub date_key: String,
    pub slug: String,
    pub bucket: String,
    pub section: String,
    pub kind: String,
    pub cell: u32,
    pub count: i64,
}

#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Initialize the storage (create tables, etc.)
    async fn init(&self) -> Result<()>;

    /// Load the counter document for a slug, if one exists.
    async fn load_counter_doc(&self, slug: &str) -> StorageResult<Option<CounterDoc>>;

    /// Write-through the whole counter document for a slug.
    async fn store_counter_doc(&self, slug: &str, doc: &CounterDoc) -> StorageResult<()>;

    /// Append raw event rows. Rows are immutable once written.
    async fn append_events(&self, events: &[EventRecord]) -> StorageResult<()>;

    /// Union session ids into one window's durable session set and return
    /// how many were newly added. The delta is what increments the
    /// cumulative unique count, so repeated flushes never double count.
    async fn merge_window_sessions(
        &self,
        bucket_start: i64,
        event_name: &str,
        slug: Option<&str>,
        sessions: &[String],
    ) -> StorageResult<u64>;

    /// Merge-accumulate a rollup row; never a blind overwrite.
    async fn upsert_rollup(&self, delta: &RollupDelta) -> StorageResult<()>;

    /// All rollup rows with `start <= bucket_start < end`, ascending.
    async fn query_rollups(&self, start: i64, end: i64) -> StorageResult<Vec<RollupRow>>;

    /// Distinct non-empty slugs seen in the rollups.
    async fn distinct_rollup_slugs(&self) -> StorageResult<Vec<String>>;

    /// Merge-accumulate daily heatmap rollup rows.
    async fn upsert_heatmap_rollups(&self, rows: &[HeatmapRollupRow]) -> StorageResult<()>;

    /// Load the audit document (newest first).
    async fn load_audit_doc(&self) -> StorageResult<Vec<AuditEntry>>;

    /// Store the audit document wholesale.
    async fn store_audit_doc(&self, entries: &[AuditEntry]) -> StorageResult<()>;
}

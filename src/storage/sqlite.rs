use crate::audit::AuditEntry;
use crate::counters::CounterDoc;
use crate::events::EventRecord;
use crate::storage::{DurableStore, HeatmapRollupRow, RollupDelta, RollupRow, StorageResult};
use anyhow::Result;
use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::sync::Arc;

pub struct SqliteStore {
    pool: Arc<SqlitePool>,
}

impl SqliteStore {
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self {
            pool: Arc::new(pool),
        })
    }
}

#[async_trait]
impl DurableStore for SqliteStore {
    async fn init(&self) -> Result<()> {
        // One JSON document per slug
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS counters (
                slug TEXT PRIMARY KEY,
                doc TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(self.pool.as_ref())
        .await?;

        // Raw events, append-only
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                event_name TEXT NOT NULL,
                slug TEXT,
                occurred_at TEXT NOT NULL,
                session_id TEXT,
                payload TEXT NOT NULL
            )
            "#,
        )
        .execute(self.pool.as_ref())
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_events_name ON events(event_name)")
            .execute(self.pool.as_ref())
            .await?;

        // 10-minute rollup rows; slug '' stands in for "no slug"
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS event_rollups (
                bucket_start INTEGER NOT NULL,
                event_name TEXT NOT NULL,
                slug TEXT NOT NULL DEFAULT '',
                visit_count INTEGER NOT NULL DEFAULT 0,
                unique_sessions INTEGER NOT NULL DEFAULT 0,
                last_seen_at INTEGER NOT NULL,
                PRIMARY KEY (bucket_start, event_name, slug)
            )
            "#,
        )
        .execute(self.pool.as_ref())
        .await?;

        // Per-window session sets backing the unique counts
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS event_window_sessions (
                bucket_start INTEGER NOT NULL,
                event_name TEXT NOT NULL,
                slug TEXT NOT NULL DEFAULT '',
                session_id TEXT NOT NULL,
                PRIMARY KEY (bucket_start, event_name, slug, session_id)
            )
            "#,
        )
        .execute(self.pool.as_ref())
        .await?;

        // Daily heatmap rollups
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS heatmap_rollups (
                date_key TEXT NOT NULL,
                slug TEXT NOT NULL,
                bucket TEXT NOT NULL,
                section TEXT NOT NULL,
                kind TEXT NOT NULL,
                cell INTEGER NOT NULL,
                count INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (date_key, slug, bucket, section, kind, cell)
            )
            "#,
        )
        .execute(self.pool.as_ref())
        .await?;

        // Single-row audit document
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS audit_log (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                doc TEXT NOT NULL
            )
            "#,
        )
        .execute(self.pool.as_ref())
        .await?;

        Ok(())
    }

    async fn load_counter_doc(&self, slug: &str) -> StorageResult<Option<CounterDoc>> {
        let row = sqlx::query_scalar::<_, String>("SELECT doc FROM counters WHERE slug = ?")
            .bind(slug)
            .fetch_optional(self.pool.as_ref())
            .await?;

        match row {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn store_counter_doc(&self, slug: &str, doc: &CounterDoc) -> StorageResult<()> {
        let json = serde_json::to_string(doc)?;
        let now = chrono::Utc::now().timestamp();

        sqlx::query(
            r#"
            INSERT INTO counters (slug, doc, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT (slug) DO UPDATE SET
                doc = excluded.doc,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(slug)
        .bind(json)
        .bind(now)
        .execute(self.pool.as_ref())
        .await?;

        Ok(())
    }

    async fn append_events(&self, events: &[EventRecord]) -> StorageResult<()> {
        for event in events {
            sqlx::query(
                r#"
                INSERT INTO events (event_name, slug, occurred_at, session_id, payload)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(&event.event_name)
            .bind(&event.slug)
            .bind(&event.timestamp)
            .bind(&event.session_id)
            .bind(serde_json::to_string(&event.payload)?)
            .execute(self.pool.as_ref())
            .await?;
        }

        Ok(())
    }

    async fn merge_window_sessions(
        &self,
        bucket_start: i64,
        event_name: &str,
        slug: Option<&str>,
        sessions: &[String],
    ) -> StorageResult<u64> {
        let mut newly_added = 0u64;

        for session_id in sessions {
            let result = sqlx::query(
                r#"
                INSERT INTO event_window_sessions (bucket_start, event_name, slug, session_id)
                VALUES (?, ?, ?, ?)
                ON CONFLICT (bucket_start, event_name, slug, session_id) DO NOTHING
                "#,
            )
            .bind(bucket_start)
            .bind(event_name)
            .bind(slug.unwrap_or(""))
            .bind(session_id)
            .execute(self.pool.as_ref())
            .await?;

            newly_added += result.rows_affected();
        }

        Ok(newly_added)
    }

    async fn upsert_rollup(&self, delta: &RollupDelta) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO event_rollups
                (bucket_start, event_name, slug, visit_count, unique_sessions, last_seen_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (bucket_start, event_name, slug) DO UPDATE SET
                visit_count = event_rollups.visit_count + excluded.visit_count,
                unique_sessions = event_rollups.unique_sessions + excluded.unique_sessions,
                last_seen_at = MAX(event_rollups.last_seen_at, excluded.last_seen_at)
            "#,
        )
        .bind(delta.bucket_start)
        .bind(&delta.event_name)
        .bind(delta.slug.as_deref().unwrap_or(""))
        .bind(delta.visit_delta)
        .bind(delta.unique_delta)
        .bind(delta.last_seen_at)
        .execute(self.pool.as_ref())
        .await?;

        Ok(())
    }

    async fn query_rollups(&self, start: i64, end: i64) -> StorageResult<Vec<RollupRow>> {
        let rows = sqlx::query_as::<_, (i64, String, String, i64, i64, i64)>(
            r#"
            SELECT bucket_start, event_name, slug, visit_count, unique_sessions, last_seen_at
            FROM event_rollups
            WHERE bucket_start >= ? AND bucket_start < ?
            ORDER BY bucket_start ASC
            "#,
        )
        .bind(start)
        .bind(end)
        .fetch_all(self.pool.as_ref())
        .await?;

        Ok(rows
            .into_iter()
            .map(
                |(bucket_start, event_name, slug, visit_count, unique_sessions, last_seen_at)| {
                    RollupRow {
                        bucket_start,
                        event_name,
                        slug: if slug.is_empty() { None } else { Some(slug) },
                        visit_count,
                        unique_sessions,
                        last_seen_at,
                    }
                },
            )
            .collect())
    }

    async fn distinct_rollup_slugs(&self) -> StorageResult<Vec<String>> {
        let slugs = sqlx::query_scalar::<_, String>(
            "SELECT DISTINCT slug FROM event_rollups WHERE slug != '' ORDER BY slug",
        )
        .fetch_all(self.pool.as_ref())
        .await?;

        Ok(slugs)
    }

    async fn upsert_heatmap_rollups(&self, rows: &[HeatmapRollupRow]) -> StorageResult<()> {
        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO heatmap_rollups (date_key, slug, bucket, section, kind, cell, count)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT (date_key, slug, bucket, section, kind, cell) DO UPDATE SET
                    count = heatmap_rollups.count + excluded.count
                "#,
            )
            .bind(&row.date_key)
            .bind(&row.slug)
            .bind(&row.bucket)
            .bind(&row.section)
            .bind(&row.kind)
            .bind(row.cell as i64)
            .bind(row.count)
            .execute(self.pool.as_ref())
            .await?;
        }

        Ok(())
    }

    async fn load_audit_doc(&self) -> StorageResult<Vec<AuditEntry>> {
        let row = sqlx::query_scalar::<_, String>("SELECT doc FROM audit_log WHERE id = 1")
            .fetch_optional(self.pool.as_ref())
            .await?;

        match row {
            Some(json) => {
                let doc: crate::audit::AuditDoc = serde_json::from_str(&json)?;
                Ok(doc.entries)
            }
            None => Ok(Vec::new()),
        }
    }

    async fn store_audit_doc(&self, entries: &[AuditEntry]) -> StorageResult<()> {
        let doc = crate::audit::AuditDoc {
            entries: entries.to_vec(),
        };
        let json = serde_json::to_string(&doc)?;

        sqlx::query(
            r#"
            INSERT INTO audit_log (id, doc)
            VALUES (1, ?)
            ON CONFLICT (id) DO UPDATE SET doc = excluded.doc
            "#,
        )
        .bind(json)
        .execute(self.pool.as_ref())
        .await?;

        Ok(())
    }
}

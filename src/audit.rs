//! Append-only audit log for manual metric overrides
//!
//! Entries are written newest-first to whichever backend is available
//! (shared-tier list, durable JSON document, or process memory) and capped
//! at 500. Entries are never mutated after the fact.

use crate::kv::KvTier;
use crate::storage::{bounded, DurableStore};
use anyhow::Result;
use base64::Engine;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::warn;

pub const MAX_ENTRIES: usize = 500;
pub const DEFAULT_LIST_LIMIT: usize = 50;
pub const MAX_LIST_LIMIT: usize = 500;

const LIST_KEY: &str = "audit:log";
const NAME_MAX_LEN: usize = 120;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: String,
    pub slug: String,
    pub changed_by: String,
    /// ISO-8601
    pub changed_at: String,
    pub before: MetricPair,
    pub after: MetricPair,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MetricPair {
    pub views: u64,
    pub likes: u64,
}

/// The single persisted audit document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditDoc {
    pub entries: Vec<AuditEntry>,
}

#[derive(Debug, Clone)]
pub struct NewAuditEntry {
    pub slug: String,
    pub changed_by: String,
    pub changed_at: Option<String>,
    pub before: MetricPair,
    pub after: MetricPair,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuditFilter {
    pub slugs: Option<Vec<String>>,
    pub limit: Option<usize>,
}

pub struct AuditStore {
    kv: Option<Arc<dyn KvTier>>,
    durable: Option<Arc<dyn DurableStore>>,
    memory: Mutex<Vec<AuditEntry>>,
}

impl AuditStore {
    pub fn new(kv: Option<Arc<dyn KvTier>>, durable: Option<Arc<dyn DurableStore>>) -> Self {
        Self {
            kv,
            durable,
            memory: Mutex::new(Vec::new()),
        }
    }

    /// Sanitize and append entries, newest first. Returns how many were
    /// recorded.
    pub async fn record(&self, entries: Vec<NewAuditEntry>) -> Result<usize> {
        let prepared: Vec<AuditEntry> = entries.into_iter().map(prepare_entry).collect();
        if prepared.is_empty() {
            return Ok(0);
        }
        let count = prepared.len();

        if let Some(kv) = &self.kv {
            let items: Result<Vec<String>, _> =
                prepared.iter().map(serde_json::to_string).collect();
            match items {
                Ok(items) => match kv.list_push_front(LIST_KEY, &items, MAX_ENTRIES).await {
                    Ok(()) => return Ok(count),
                    Err(err) => {
                        warn!(error = %err, "audit list write failed, falling through");
                    }
                },
                Err(err) => {
                    warn!(error = %err, "failed to encode audit entries, falling through");
                }
            }
        }

        if let Some(durable) = &self.durable {
            match self.record_durable(durable, &prepared).await {
                Ok(()) => return Ok(count),
                Err(err) => {
                    warn!(error = %err, "audit document write failed, falling through");
                }
            }
        }

        let mut memory = self.memory.lock().await;
        for entry in prepared.into_iter().rev() {
            memory.insert(0, entry);
        }
        memory.truncate(MAX_ENTRIES);
        Ok(count)
    }

    async fn record_durable(
        &self,
        durable: &Arc<dyn DurableStore>,
        prepared: &[AuditEntry],
    ) -> Result<()> {
        let mut entries = bounded(durable.load_audit_doc()).await?;
        for entry in prepared.iter().rev() {
            entries.insert(0, entry.clone());
        }
        entries.truncate(MAX_ENTRIES);
        bounded(durable.store_audit_doc(&entries)).await?;
        Ok(())
    }

    /// Newest entries, optionally filtered to a slug set.
    pub async fn list(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>> {
        let limit = filter
            .limit
            .unwrap_or(DEFAULT_LIST_LIMIT)
            .min(MAX_LIST_LIMIT);

        let entries = self.load_all().await?;
        Ok(entries
            .into_iter()
            .filter(|entry| {
                filter
                    .slugs
                    .as_ref()
                    .map(|slugs| slugs.iter().any(|slug| *slug == entry.slug))
                    .unwrap_or(true)
            })
            .take(limit)
            .collect())
    }

    async fn load_all(&self) -> Result<Vec<AuditEntry>> {
        if let Some(kv) = &self.kv {
            match kv.list_range(LIST_KEY, MAX_ENTRIES).await {
                Ok(items) => {
                    return Ok(items
                        .iter()
                        .filter_map(|item| serde_json::from_str(item).ok())
                        .collect());
                }
                Err(err) => {
                    warn!(error = %err, "audit list read failed, falling through");
                }
            }
        }

        if let Some(durable) = &self.durable {
            match bounded(durable.load_audit_doc()).await {
                Ok(entries) => return Ok(entries),
                Err(err) => {
                    warn!(error = %err, "audit document read failed, falling through");
                }
            }
        }

        Ok(self.memory.lock().await.clone())
    }
}

fn prepare_entry(entry: NewAuditEntry) -> AuditEntry {
    AuditEntry {
        id: mint_audit_id(),
        slug: sanitize_name(&entry.slug),
        changed_by: sanitize_name(&entry.changed_by),
        changed_at: entry
            .changed_at
            .unwrap_or_else(|| chrono::Utc::now().to_rfc3339()),
        before: entry.before,
        after: entry.after,
    }
}

fn sanitize_name(value: &str) -> String {
    let trimmed = value.trim();
    trimmed.chars().take(NAME_MAX_LEN).collect()
}

fn mint_audit_id() -> String {
    let mut bytes = [0u8; 12];
    rand::rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

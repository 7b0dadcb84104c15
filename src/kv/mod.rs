//! Shared low-latency key-value tier
//!
//! Capability seam for the first tier of the storage cascade: atomic
//! multi-field hash increments for counters and heatmap cells, TTL sets for
//! viewer membership, a FIFO queue for event batches, and a capped list for
//! the audit log. The shipped engine is in-process (`MemoryKv`); a networked
//! implementation can slot in behind the same trait, and tests inject a
//! failing tier to exercise every fall-through path.

pub mod memory;

pub use memory::MemoryKv;

use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;

#[async_trait]
pub trait KvTier: Send + Sync {
    /// Apply all field deltas to one hash as a single atomic operation.
    /// No reader may observe a subset of the deltas.
    async fn hash_incr(&self, key: &str, fields: &[(String, i64)]) -> Result<()>;

    /// Read every field of a hash. Missing key yields an empty vec.
    async fn hash_get_all(&self, key: &str) -> Result<Vec<(String, i64)>>;

    /// Set fields absolutely (existing fields not named are kept).
    async fn hash_set(&self, key: &str, fields: &[(String, i64)]) -> Result<()>;

    /// Add a member to a TTL set. Returns true when the member was newly
    /// added (an expired member counts as new).
    async fn set_add(&self, key: &str, member: &str, ttl: Option<Duration>) -> Result<bool>;

    /// Remove a member. Returns true when the member was present.
    async fn set_remove(&self, key: &str, member: &str) -> Result<bool>;

    async fn set_contains(&self, key: &str, member: &str) -> Result<bool>;

    /// All live members of a set.
    async fn set_members(&self, key: &str) -> Result<Vec<String>>;

    /// Drop a key entirely, whatever its type.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Append items to the tail of a FIFO queue.
    async fn queue_push(&self, key: &str, items: &[String]) -> Result<()>;

    /// Pop up to `max` items from the head of the queue.
    async fn queue_pop(&self, key: &str, max: usize) -> Result<Vec<String>>;

    async fn queue_len(&self, key: &str) -> Result<usize>;

    /// Prepend items to a list, trimming it to `cap` newest entries.
    async fn list_push_front(&self, key: &str, items: &[String], cap: usize) -> Result<()>;

    /// Read up to `limit` items from the front of a list.
    async fn list_range(&self, key: &str, limit: usize) -> Result<Vec<String>>;
}

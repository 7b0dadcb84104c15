//! In-process key-value engine
//!
//! Backs the shared tier when no networked store is configured. Per-key
//! atomicity comes from the DashMap entry lock: every operation on one key
//! holds that key's shard entry for its whole duration, so multi-field
//! increments are observed all-or-nothing. Set TTLs expire lazily on access.

use super::KvTier;
use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

#[derive(Default)]
pub struct MemoryKv {
    hashes: DashMap<String, HashMap<String, i64>>,
    sets: DashMap<String, HashMap<String, Option<Instant>>>,
    queues: DashMap<String, VecDeque<String>>,
    lists: DashMap<String, Vec<String>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    fn prune_expired(members: &mut HashMap<String, Option<Instant>>) {
        let now = Instant::now();
        members.retain(|_, expires_at| expires_at.map(|at| at > now).unwrap_or(true));
    }
}

#[async_trait]
impl KvTier for MemoryKv {
    async fn hash_incr(&self, key: &str, fields: &[(String, i64)]) -> Result<()> {
        let mut hash = self.hashes.entry(key.to_string()).or_default();
        for (field, delta) in fields {
            *hash.entry(field.clone()).or_insert(0) += delta;
        }
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> Result<Vec<(String, i64)>> {
        Ok(self
            .hashes
            .get(key)
            .map(|hash| hash.iter().map(|(f, v)| (f.clone(), *v)).collect())
            .unwrap_or_default())
    }

    async fn hash_set(&self, key: &str, fields: &[(String, i64)]) -> Result<()> {
        let mut hash = self.hashes.entry(key.to_string()).or_default();
        for (field, value) in fields {
            hash.insert(field.clone(), *value);
        }
        Ok(())
    }

    async fn set_add(&self, key: &str, member: &str, ttl: Option<Duration>) -> Result<bool> {
        let mut members = self.sets.entry(key.to_string()).or_default();
        Self::prune_expired(&mut members);

        let newly_added = !members.contains_key(member);
        members.insert(member.to_string(), ttl.map(|t| Instant::now() + t));
        Ok(newly_added)
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<bool> {
        let Some(mut members) = self.sets.get_mut(key) else {
            return Ok(false);
        };
        Self::prune_expired(&mut members);
        Ok(members.remove(member).is_some())
    }

    async fn set_contains(&self, key: &str, member: &str) -> Result<bool> {
        let Some(mut members) = self.sets.get_mut(key) else {
            return Ok(false);
        };
        Self::prune_expired(&mut members);
        Ok(members.contains_key(member))
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        let Some(mut members) = self.sets.get_mut(key) else {
            return Ok(Vec::new());
        };
        Self::prune_expired(&mut members);
        Ok(members.keys().cloned().collect())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.hashes.remove(key);
        self.sets.remove(key);
        self.queues.remove(key);
        self.lists.remove(key);
        Ok(())
    }

    async fn queue_push(&self, key: &str, items: &[String]) -> Result<()> {
        let mut queue = self.queues.entry(key.to_string()).or_default();
        queue.extend(items.iter().cloned());
        Ok(())
    }

    async fn queue_pop(&self, key: &str, max: usize) -> Result<Vec<String>> {
        let Some(mut queue) = self.queues.get_mut(key) else {
            return Ok(Vec::new());
        };
        let take = max.min(queue.len());
        Ok(queue.drain(..take).collect())
    }

    async fn queue_len(&self, key: &str) -> Result<usize> {
        Ok(self.queues.get(key).map(|q| q.len()).unwrap_or(0))
    }

    async fn list_push_front(&self, key: &str, items: &[String], cap: usize) -> Result<()> {
        let mut list = self.lists.entry(key.to_string()).or_default();
        for item in items.iter().rev() {
            list.insert(0, item.clone());
        }
        list.truncate(cap);
        Ok(())
    }

    async fn list_range(&self, key: &str, limit: usize) -> Result<Vec<String>> {
        Ok(self
            .lists
            .get(key)
            .map(|list| list.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_hash_incr_accumulates() {
        let kv = MemoryKv::new();
        kv.hash_incr("h", &[("a".to_string(), 2), ("b".to_string(), 1)])
            .await
            .unwrap();
        kv.hash_incr("h", &[("a".to_string(), 3)]).await.unwrap();

        let mut fields = kv.hash_get_all("h").await.unwrap();
        fields.sort();
        assert_eq!(fields, vec![("a".to_string(), 5), ("b".to_string(), 1)]);
    }

    #[tokio::test]
    async fn test_set_add_reports_new_members() {
        let kv = MemoryKv::new();
        assert!(kv.set_add("s", "v1", None).await.unwrap());
        assert!(!kv.set_add("s", "v1", None).await.unwrap());
        assert!(kv.set_contains("s", "v1").await.unwrap());
        assert!(kv.set_remove("s", "v1").await.unwrap());
        assert!(!kv.set_remove("s", "v1").await.unwrap());
    }

    #[tokio::test]
    async fn test_set_members_expire() {
        let kv = MemoryKv::new();
        kv.set_add("s", "v1", Some(Duration::from_millis(10)))
            .await
            .unwrap();
        assert!(kv.set_contains("s", "v1").await.unwrap());

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!kv.set_contains("s", "v1").await.unwrap());
        // Expired member counts as newly added again
        assert!(kv.set_add("s", "v1", None).await.unwrap());
    }

    #[tokio::test]
    async fn test_queue_is_fifo() {
        let kv = MemoryKv::new();
        kv.queue_push("q", &["a".to_string(), "b".to_string(), "c".to_string()])
            .await
            .unwrap();
        assert_eq!(kv.queue_len("q").await.unwrap(), 3);

        let popped = kv.queue_pop("q", 2).await.unwrap();
        assert_eq!(popped, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(kv.queue_len("q").await.unwrap(), 1);
        assert_eq!(kv.queue_pop("q", 10).await.unwrap(), vec!["c".to_string()]);
    }

    #[tokio::test]
    async fn test_list_push_front_trims_to_cap() {
        let kv = MemoryKv::new();
        kv.list_push_front("l", &["c".to_string(), "d".to_string()], 3)
            .await
            .unwrap();
        kv.list_push_front("l", &["a".to_string(), "b".to_string()], 3)
            .await
            .unwrap();

        let items = kv.list_range("l", 10).await.unwrap();
        assert_eq!(
            items,
            vec!["a".to_string(), "b".to_string(), "c".to_string()]
        );
    }
}

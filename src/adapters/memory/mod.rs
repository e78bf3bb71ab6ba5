//! In-memory mock backend.
//!
//! Selected explicitly via `adapter.type = mock`; never a silent fallback.
//! Keeps the same semantics as the SQLite backend (atomic batches,
//! lexicographic scans, indexed pattern queries) without durability.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::domain::errors::{MemoryError, MemoryResult};
use crate::domain::models::{AgentId, BackendKind, MemoryEntry, Partition, Pattern};
use crate::domain::ports::{MemoryBackend, WriteOp};

#[derive(Default)]
struct MockState {
    /// partition -> key -> entry, BTreeMap for lexicographic scans.
    entries: HashMap<Partition, BTreeMap<String, MemoryEntry>>,
    patterns: HashMap<Uuid, Pattern>,
    /// agent -> pattern ids, the "index".
    patterns_by_agent: HashMap<AgentId, HashSet<Uuid>>,
}

/// Volatile backend for tests and `adapter.type = mock` deployments.
#[derive(Default)]
pub struct MockMemoryBackend {
    state: RwLock<MockState>,
}

impl MockMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MemoryBackend for MockMemoryBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Mock
    }

    async fn put(&self, entry: MemoryEntry) -> MemoryResult<bool> {
        let mut state = self.state.write().await;
        let partition = state.entries.entry(entry.partition).or_default();
        Ok(partition.insert(entry.key.clone(), entry).is_none())
    }

    async fn get(&self, partition: Partition, key: &str) -> MemoryResult<Option<MemoryEntry>> {
        let state = self.state.read().await;
        Ok(state
            .entries
            .get(&partition)
            .and_then(|entries| entries.get(key))
            .cloned())
    }

    async fn delete(&self, partition: Partition, key: &str) -> MemoryResult<bool> {
        let mut state = self.state.write().await;
        Ok(state
            .entries
            .get_mut(&partition)
            .is_some_and(|entries| entries.remove(key).is_some()))
    }

    async fn scan(
        &self,
        partition: Partition,
        key_prefix: Option<&str>,
        limit: Option<usize>,
    ) -> MemoryResult<Vec<MemoryEntry>> {
        let state = self.state.read().await;
        let limit = limit.unwrap_or(usize::MAX);
        let Some(entries) = state.entries.get(&partition) else {
            return Ok(Vec::new());
        };
        let result = entries
            .values()
            .filter(|e| key_prefix.is_none_or(|p| e.key.starts_with(p)))
            .take(limit)
            .cloned()
            .collect();
        Ok(result)
    }

    async fn apply_batch(&self, ops: Vec<WriteOp>) -> MemoryResult<()> {
        // Single lock hold makes the batch atomic with respect to readers.
        let mut state = self.state.write().await;
        for op in ops {
            match op {
                WriteOp::Put(entry) => {
                    state
                        .entries
                        .entry(entry.partition)
                        .or_default()
                        .insert(entry.key.clone(), entry);
                }
                WriteOp::Delete { partition, key } => {
                    if let Some(entries) = state.entries.get_mut(&partition) {
                        entries.remove(&key);
                    }
                }
            }
        }
        Ok(())
    }

    async fn prune_expired(&self, now: DateTime<Utc>) -> MemoryResult<u64> {
        let mut state = self.state.write().await;
        let mut pruned = 0u64;
        for entries in state.entries.values_mut() {
            let before = entries.len();
            entries.retain(|_, e| !e.is_expired(now));
            pruned += (before - entries.len()) as u64;
        }
        Ok(pruned)
    }

    async fn store_pattern(&self, pattern: &Pattern) -> MemoryResult<()> {
        let mut state = self.state.write().await;
        state
            .patterns_by_agent
            .entry(pattern.agent_id)
            .or_default()
            .insert(pattern.id);
        state.patterns.insert(pattern.id, pattern.clone());
        Ok(())
    }

    async fn get_pattern(&self, id: Uuid) -> MemoryResult<Option<Pattern>> {
        let state = self.state.read().await;
        Ok(state.patterns.get(&id).cloned())
    }

    async fn patterns_by_agent(
        &self,
        agent_id: AgentId,
        min_confidence: f64,
        min_samples: u64,
    ) -> MemoryResult<Vec<Pattern>> {
        let state = self.state.read().await;
        let Some(ids) = state.patterns_by_agent.get(&agent_id) else {
            return Ok(Vec::new());
        };
        let mut result: Vec<Pattern> = ids
            .iter()
            .filter_map(|id| state.patterns.get(id))
            .filter(|p| p.confidence >= min_confidence && p.samples() >= min_samples)
            .cloned()
            .collect();
        result.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.last_used_at.cmp(&a.last_used_at))
        });
        Ok(result)
    }

    async fn find_pattern_by_type(
        &self,
        agent_id: AgentId,
        pattern_type: &str,
    ) -> MemoryResult<Option<Pattern>> {
        let state = self.state.read().await;
        let Some(ids) = state.patterns_by_agent.get(&agent_id) else {
            return Ok(None);
        };
        Ok(ids
            .iter()
            .filter_map(|id| state.patterns.get(id))
            .find(|p| p.pattern_type == pattern_type)
            .cloned())
    }

    async fn update_pattern(
        &self,
        id: Uuid,
        success: bool,
        now: DateTime<Utc>,
    ) -> MemoryResult<Pattern> {
        let mut state = self.state.write().await;
        let pattern = state
            .patterns
            .get_mut(&id)
            .ok_or(MemoryError::PatternNotFound(id))?;
        pattern.record_outcome(success, now);
        Ok(pattern.clone())
    }

    async fn count_patterns(&self) -> MemoryResult<u64> {
        let state = self.state.read().await;
        Ok(state.patterns.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_put_get_delete() {
        let backend = MockMemoryBackend::new();
        let entry = MemoryEntry::new(Partition::Shared, "k", b"v".to_vec());

        assert!(backend.put(entry).await.unwrap());
        assert!(!backend
            .put(MemoryEntry::new(Partition::Shared, "k", b"v2".to_vec()))
            .await
            .unwrap());

        let fetched = backend.get(Partition::Shared, "k").await.unwrap().unwrap();
        assert_eq!(fetched.value, b"v2".to_vec());

        assert!(backend.delete(Partition::Shared, "k").await.unwrap());
        assert!(backend.get(Partition::Shared, "k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_mock_scan_ordering() {
        let backend = MockMemoryBackend::new();
        for key in ["c", "a", "b"] {
            backend
                .put(MemoryEntry::new(Partition::Metrics, key, vec![]))
                .await
                .unwrap();
        }
        let keys: Vec<String> = backend
            .scan(Partition::Metrics, None, None)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.key)
            .collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_mock_pattern_index() {
        let backend = MockMemoryBackend::new();
        let agent = AgentId::new();
        let now = Utc::now();

        let mut pattern = Pattern::new(agent, "t", vec![]);
        for _ in 0..3 {
            pattern.record_outcome(true, now);
        }
        backend.store_pattern(&pattern).await.unwrap();

        let found = backend.patterns_by_agent(agent, 0.5, 3).await.unwrap();
        assert_eq!(found.len(), 1);

        let missing = backend
            .patterns_by_agent(AgentId::new(), 0.0, 0)
            .await
            .unwrap();
        assert!(missing.is_empty());
    }

    #[tokio::test]
    async fn test_mock_declares_kind() {
        assert_eq!(MockMemoryBackend::new().kind(), BackendKind::Mock);
    }
}

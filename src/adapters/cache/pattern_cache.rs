//! Moka-backed cache for agent pattern queries.
//!
//! Caches the full visible pattern list per agent (the store filters by
//! confidence on read), so invalidation on `store_pattern`/`update_pattern`
//! can drop exactly the affected agent's entry and nothing else.

use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;

use crate::domain::models::{AgentId, Pattern};

pub struct PatternCache {
    inner: Cache<AgentId, Arc<Vec<Pattern>>>,
}

impl PatternCache {
    pub fn new(capacity: u64, ttl: Duration) -> Self {
        let inner = Cache::builder()
            .max_capacity(capacity)
            .time_to_live(ttl)
            .build();
        Self { inner }
    }

    pub async fn get(&self, agent_id: AgentId) -> Option<Arc<Vec<Pattern>>> {
        self.inner.get(&agent_id).await
    }

    pub async fn insert(&self, agent_id: AgentId, patterns: Vec<Pattern>) {
        self.inner.insert(agent_id, Arc::new(patterns)).await;
    }

    /// Drop the cached list for one agent only.
    pub async fn invalidate(&self, agent_id: AgentId) {
        self.inner.invalidate(&agent_id).await;
    }

    pub fn entry_count(&self) -> u64 {
        self.inner.entry_count()
    }

    /// Synchronize pending cache maintenance; test helper.
    pub async fn sync(&self) {
        self.inner.run_pending_tasks().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample_pattern(agent: AgentId) -> Pattern {
        let mut p = Pattern::new(agent, "t", vec![]);
        p.record_outcome(true, Utc::now());
        p
    }

    #[tokio::test]
    async fn test_hit_after_insert() {
        let cache = PatternCache::new(10, Duration::from_secs(60));
        let agent = AgentId::new();
        cache.insert(agent, vec![sample_pattern(agent)]).await;

        let hit = cache.get(agent).await.unwrap();
        assert_eq!(hit.len(), 1);
    }

    #[tokio::test]
    async fn test_invalidation_is_per_agent() {
        let cache = PatternCache::new(10, Duration::from_secs(60));
        let a = AgentId::new();
        let b = AgentId::new();
        cache.insert(a, vec![sample_pattern(a)]).await;
        cache.insert(b, vec![sample_pattern(b)]).await;

        cache.invalidate(a).await;
        cache.sync().await;

        assert!(cache.get(a).await.is_none());
        assert!(cache.get(b).await.is_some());
    }

    #[tokio::test]
    async fn test_capacity_bound() {
        let cache = PatternCache::new(2, Duration::from_secs(60));
        for _ in 0..10 {
            let agent = AgentId::new();
            cache.insert(agent, vec![sample_pattern(agent)]).await;
        }
        cache.sync().await;
        assert!(cache.entry_count() <= 2);
    }
}

//! Memory backend port.
//!
//! The swarm memory store talks to persistence only through this trait so
//! an embedded SQLite file, an in-memory mock, or a networked backend can
//! be substituted without touching callers. The backend declares its kind
//! and the store fails fast when it disagrees with configuration.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::errors::MemoryResult;
use crate::domain::models::{AgentId, BackendKind, MemoryEntry, Partition, Pattern};

/// One staged mutation inside a transaction.
#[derive(Debug, Clone)]
pub enum WriteOp {
    Put(MemoryEntry),
    Delete { partition: Partition, key: String },
}

/// Storage backend for the swarm memory store.
#[async_trait]
pub trait MemoryBackend: Send + Sync {
    /// Declared backend kind; checked against configuration at init.
    fn kind(&self) -> BackendKind;

    /// Insert or replace an entry. Returns `true` when the entry was
    /// created (no previous value for the key).
    async fn put(&self, entry: MemoryEntry) -> MemoryResult<bool>;

    /// Fetch an entry. Expiry is the caller's concern; backends return
    /// whatever is stored.
    async fn get(&self, partition: Partition, key: &str) -> MemoryResult<Option<MemoryEntry>>;

    /// Delete an entry. Returns `true` when something existed.
    async fn delete(&self, partition: Partition, key: &str) -> MemoryResult<bool>;

    /// Scan a partition lexicographically by key.
    async fn scan(
        &self,
        partition: Partition,
        key_prefix: Option<&str>,
        limit: Option<usize>,
    ) -> MemoryResult<Vec<MemoryEntry>>;

    /// Apply a batch of writes atomically: all or none.
    async fn apply_batch(&self, ops: Vec<WriteOp>) -> MemoryResult<()>;

    /// Remove entries whose TTL elapsed before `now`. Returns the count.
    async fn prune_expired(&self, now: DateTime<Utc>) -> MemoryResult<u64>;

    /// Insert or replace a pattern by id.
    async fn store_pattern(&self, pattern: &Pattern) -> MemoryResult<()>;

    async fn get_pattern(&self, id: Uuid) -> MemoryResult<Option<Pattern>>;

    /// Index-backed query: patterns for one agent at or above the
    /// confidence floor, with at least `min_samples` observations, ordered
    /// by confidence descending then recency.
    async fn patterns_by_agent(
        &self,
        agent_id: AgentId,
        min_confidence: f64,
        min_samples: u64,
    ) -> MemoryResult<Vec<Pattern>>;

    /// Look up one agent's pattern by its type tag, regardless of sample
    /// count. Used by the mining job to upsert aggregates.
    async fn find_pattern_by_type(
        &self,
        agent_id: AgentId,
        pattern_type: &str,
    ) -> MemoryResult<Option<Pattern>>;

    /// Record a success/failure outcome and return the updated pattern.
    async fn update_pattern(
        &self,
        id: Uuid,
        success: bool,
        now: DateTime<Utc>,
    ) -> MemoryResult<Pattern>;

    async fn count_patterns(&self) -> MemoryResult<u64>;
}

/// Persistence hook for the event bus.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn append(&self, event: &crate::domain::models::BusEvent) -> MemoryResult<()>;

    /// Highest persisted sequence per topic, so a restarted bus resumes
    /// numbering without collisions.
    async fn latest_sequences(&self) -> MemoryResult<Vec<(String, u64)>>;
}

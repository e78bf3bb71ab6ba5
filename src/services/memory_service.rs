//! Swarm memory store: the only shared mutable substrate in the fleet.
//!
//! A thin coordination layer over the backend port: per-partition write
//! serialization, lazy TTL filtering on read, a background GC sweeper,
//! an atomic batch transaction primitive, and a per-agent LRU+TTL cache
//! in front of pattern queries.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::adapters::cache::PatternCache;
use crate::domain::errors::{MemoryError, MemoryResult};
use crate::domain::models::config::MemoryConfig;
use crate::domain::models::{
    topics, AgentId, BackendKind, MemoryEntry, Partition, Pattern, PutOptions,
};
use crate::domain::ports::{Clock, MemoryBackend, WriteOp};
use crate::services::event_bus::EventBus;
use crate::services::DaemonHandle;

/// Staged writes applied atomically by `with_transaction`.
pub struct MemoryTransaction {
    now: chrono::DateTime<chrono::Utc>,
    ops: Vec<WriteOp>,
    error: Option<MemoryError>,
}

impl MemoryTransaction {
    fn new(now: chrono::DateTime<chrono::Utc>) -> Self {
        Self {
            now,
            ops: Vec::new(),
            error: None,
        }
    }

    pub fn put(
        &mut self,
        partition: Partition,
        key: impl Into<String>,
        value: Vec<u8>,
        options: PutOptions,
    ) {
        let key = key.into();
        if key.is_empty() {
            self.error.get_or_insert(MemoryError::EmptyKey);
            return;
        }
        let mut entry = MemoryEntry::new(partition, key, value);
        entry.created_at = self.now;
        entry.updated_at = self.now;
        entry.ttl_ms = options.ttl_ms;
        entry.agent_id = options.agent_id;
        entry.metadata = options.metadata;
        self.ops.push(WriteOp::Put(entry));
    }

    pub fn delete(&mut self, partition: Partition, key: impl Into<String>) {
        self.ops.push(WriteOp::Delete {
            partition,
            key: key.into(),
        });
    }

    fn into_ops(self) -> MemoryResult<Vec<WriteOp>> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.ops),
        }
    }
}

pub struct SwarmMemoryStore {
    backend: Arc<dyn MemoryBackend>,
    clock: Arc<dyn Clock>,
    cache: PatternCache,
    config: MemoryConfig,
    bus: Option<Arc<EventBus>>,
    /// One mutex per partition; writes within a partition are serialized,
    /// reads never touch these.
    write_locks: Vec<(Partition, Arc<Mutex<()>>)>,
}

impl std::fmt::Debug for SwarmMemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwarmMemoryStore").finish_non_exhaustive()
    }
}

impl SwarmMemoryStore {
    /// Construct the store over an explicitly chosen backend.
    ///
    /// The backend's declared kind must match the configured kind; a
    /// mismatch fails fast instead of silently falling back.
    pub fn new(
        backend: Arc<dyn MemoryBackend>,
        configured_kind: BackendKind,
        config: MemoryConfig,
        clock: Arc<dyn Clock>,
    ) -> MemoryResult<Self> {
        if backend.kind() != configured_kind {
            return Err(MemoryError::BackendMismatch {
                configured: configured_kind.to_string(),
                constructed: backend.kind().to_string(),
            });
        }
        let cache = PatternCache::new(
            config.cache_size,
            Duration::from_millis(config.cache_ttl_ms),
        );
        let write_locks = Partition::all()
            .iter()
            .map(|p| (*p, Arc::new(Mutex::new(()))))
            .collect();
        Ok(Self {
            backend,
            clock,
            cache,
            config,
            bus: None,
            write_locks,
        })
    }

    /// Attach the bus used for `memory.*` diagnostics.
    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    fn partition_lock(&self, partition: Partition) -> Arc<Mutex<()>> {
        self.write_locks
            .iter()
            .find(|(p, _)| *p == partition)
            .map(|(_, lock)| lock.clone())
            .expect("every partition has a write lock")
    }

    /// Insert or replace a value. Returns `true` when the key was created.
    pub async fn put(
        &self,
        partition: Partition,
        key: &str,
        value: Vec<u8>,
        options: PutOptions,
    ) -> MemoryResult<bool> {
        if key.is_empty() {
            return Err(MemoryError::EmptyKey);
        }
        let now = self.clock.now();
        let mut entry = MemoryEntry::new(partition, key, value);
        entry.created_at = now;
        entry.updated_at = now;
        entry.ttl_ms = options.ttl_ms;
        entry.agent_id = options.agent_id;
        entry.metadata = options.metadata;

        let lock = self.partition_lock(partition);
        let _guard = lock.lock().await;
        self.backend.put(entry).await
    }

    /// Fetch a value. Expired entries are never returned.
    pub async fn get(&self, partition: Partition, key: &str) -> MemoryResult<Option<MemoryEntry>> {
        let entry = self.backend.get(partition, key).await?;
        let now = self.clock.now();
        Ok(entry.filter(|e| !e.is_expired(now)))
    }

    /// Delete a value. Returns `true` when something existed.
    pub async fn delete(&self, partition: Partition, key: &str) -> MemoryResult<bool> {
        let lock = self.partition_lock(partition);
        let _guard = lock.lock().await;
        self.backend.delete(partition, key).await
    }

    /// Scan a partition lexicographically by key; expired entries are
    /// filtered out.
    pub async fn scan(
        &self,
        partition: Partition,
        key_prefix: Option<&str>,
        limit: Option<usize>,
    ) -> MemoryResult<Vec<MemoryEntry>> {
        let entries = self.backend.scan(partition, key_prefix, limit).await?;
        let now = self.clock.now();
        Ok(entries.into_iter().filter(|e| !e.is_expired(now)).collect())
    }

    /// Stage writes in a closure and commit them atomically: either every
    /// operation applies or none do.
    pub async fn with_transaction<F>(&self, f: F) -> MemoryResult<()>
    where
        F: FnOnce(&mut MemoryTransaction),
    {
        let mut tx = MemoryTransaction::new(self.clock.now());
        f(&mut tx);
        let ops = tx.into_ops()?;
        if ops.is_empty() {
            return Ok(());
        }

        // Acquire the involved partition locks in Partition order so
        // concurrent transactions cannot deadlock.
        let partitions: BTreeSet<Partition> = ops
            .iter()
            .map(|op| match op {
                WriteOp::Put(entry) => entry.partition,
                WriteOp::Delete { partition, .. } => *partition,
            })
            .collect();
        let locks: Vec<_> = partitions.iter().map(|p| self.partition_lock(*p)).collect();
        let mut guards = Vec::with_capacity(locks.len());
        for lock in &locks {
            guards.push(lock.lock().await);
        }

        self.backend.apply_batch(ops).await
    }

    // ---- Pattern store ----

    pub async fn store_pattern(&self, pattern: &Pattern) -> MemoryResult<()> {
        let lock = self.partition_lock(Partition::Patterns);
        let _guard = lock.lock().await;
        self.backend.store_pattern(pattern).await?;
        drop(_guard);
        self.cache.invalidate(pattern.agent_id).await;
        Ok(())
    }

    pub async fn get_pattern(&self, id: Uuid) -> MemoryResult<Option<Pattern>> {
        self.backend.get_pattern(id).await
    }

    /// Lookup used by the mining job; bypasses the sample floor and the
    /// cache.
    pub async fn find_pattern_by_type(
        &self,
        agent_id: AgentId,
        pattern_type: &str,
    ) -> MemoryResult<Option<Pattern>> {
        self.backend.find_pattern_by_type(agent_id, pattern_type).await
    }

    /// Agent-scoped pattern lookup, ordered by confidence descending then
    /// recency. Served from the per-agent cache when warm.
    pub async fn query_patterns_by_agent(
        &self,
        agent_id: AgentId,
        min_confidence: f64,
    ) -> MemoryResult<Vec<Pattern>> {
        if let Some(cached) = self.cache.get(agent_id).await {
            return Ok(cached
                .iter()
                .filter(|p| p.confidence >= min_confidence)
                .cloned()
                .collect());
        }

        let patterns = self
            .backend
            .patterns_by_agent(agent_id, 0.0, self.config.min_pattern_samples)
            .await?;
        self.cache.insert(agent_id, patterns.clone()).await;
        Ok(patterns
            .into_iter()
            .filter(|p| p.confidence >= min_confidence)
            .collect())
    }

    /// Record a success/failure outcome for a pattern and invalidate the
    /// affected agent's cache entry only.
    pub async fn update_pattern(&self, id: Uuid, success: bool) -> MemoryResult<Pattern> {
        let now = self.clock.now();
        let lock = self.partition_lock(Partition::Patterns);
        let guard = lock.lock().await;
        let updated = self.backend.update_pattern(id, success, now).await?;
        drop(guard);
        self.cache.invalidate(updated.agent_id).await;
        Ok(updated)
    }

    pub async fn count_patterns(&self) -> MemoryResult<u64> {
        self.backend.count_patterns().await
    }

    /// Cache instrumentation for tests and metrics.
    pub fn pattern_cache(&self) -> &PatternCache {
        &self.cache
    }

    /// Surface an unrecoverable backend failure; the fleet reacts by
    /// shutting down.
    pub async fn report_fatal(&self, error: &MemoryError) {
        if let Some(ref bus) = self.bus {
            let _ = bus
                .publish(
                    topics::FLEET_MEMORY_FATAL,
                    json!({ "error": error.to_string() }),
                    None,
                )
                .await;
        }
    }

    /// Sweep expired entries once; returns how many were pruned.
    pub async fn sweep_expired(&self) -> MemoryResult<u64> {
        let pruned = self.backend.prune_expired(self.clock.now()).await?;
        if pruned > 0 {
            if let Some(ref bus) = self.bus {
                let _ = bus
                    .publish(topics::MEMORY_GC_SWEPT, json!({ "pruned": pruned }), None)
                    .await;
            }
            tracing::debug!(pruned, "memory GC sweep removed expired entries");
        }
        Ok(pruned)
    }

    /// Spawn the background TTL sweeper.
    pub fn start_gc(self: Arc<Self>) -> DaemonHandle {
        let interval = Duration::from_millis(self.config.gc_interval_ms.max(1));
        let store = self;
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; skip it.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = store.sweep_expired().await {
                            if e.is_fatal() {
                                tracing::error!("memory GC hit fatal backend error: {e}");
                                store.report_fatal(&e).await;
                                return;
                            }
                            tracing::warn!("memory GC sweep failed: {e}");
                        }
                    }
                    _ = shutdown_rx.recv() => return,
                }
            }
        });

        DaemonHandle::new("memory-gc", shutdown_tx, handle)
    }
}

//! Swarm memory store integration tests over the real SQLite backend:
//! round-trip laws, TTL, transactions, pattern queries at scale, and
//! crash-free recovery.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;

use aqe::adapters::sqlite::{initialize_database, SqliteMemoryBackend};
use aqe::domain::models::{
    AgentId, BackendKind, MemoryConfig, Partition, Pattern, PutOptions,
};
use aqe::domain::ports::{Clock, MemoryBackend, SystemClock};
use aqe::services::SwarmMemoryStore;

use common::temp_db_path;

async fn sqlite_store(db_path: &std::path::Path) -> Arc<SwarmMemoryStore> {
    let pool = initialize_database(db_path, 5).await.unwrap();
    let backend = Arc::new(SqliteMemoryBackend::new(pool));
    Arc::new(
        SwarmMemoryStore::new(
            backend,
            BackendKind::Real,
            MemoryConfig::default(),
            Arc::new(SystemClock::new()) as Arc<dyn Clock>,
        )
        .unwrap(),
    )
}

#[tokio::test]
async fn test_put_get_round_trip_law() {
    let (_dir, db_path) = temp_db_path();
    let store = sqlite_store(&db_path).await;

    store
        .put(
            Partition::Shared,
            "report:latest",
            b"all green".to_vec(),
            PutOptions::default(),
        )
        .await
        .unwrap();

    let entry = store
        .get(Partition::Shared, "report:latest")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.value, b"all green".to_vec());
}

#[tokio::test]
async fn test_overwrite_is_last_writer_wins() {
    let (_dir, db_path) = temp_db_path();
    let store = sqlite_store(&db_path).await;

    store
        .put(Partition::Shared, "k", b"v1".to_vec(), PutOptions::default())
        .await
        .unwrap();
    store
        .put(Partition::Shared, "k", b"v2".to_vec(), PutOptions::default())
        .await
        .unwrap();

    let entry = store.get(Partition::Shared, "k").await.unwrap().unwrap();
    // Never a stale previous value.
    assert_eq!(entry.value, b"v2".to_vec());
}

#[tokio::test]
async fn test_durable_state_survives_reopen() {
    let (_dir, db_path) = temp_db_path();

    let agent = AgentId::new();
    {
        let store = sqlite_store(&db_path).await;
        store
            .put(
                Partition::Coordination,
                "leader",
                b"agent-7".to_vec(),
                PutOptions::default(),
            )
            .await
            .unwrap();

        let mut pattern = Pattern::new(agent, "selector", b"payload".to_vec());
        for _ in 0..5 {
            pattern.record_outcome(true, Utc::now());
        }
        store.store_pattern(&pattern).await.unwrap();
    }

    // A fresh store over the same path recovers everything.
    let reopened = sqlite_store(&db_path).await;
    let entry = reopened
        .get(Partition::Coordination, "leader")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.value, b"agent-7".to_vec());

    let patterns = reopened.query_patterns_by_agent(agent, 0.5).await.unwrap();
    assert_eq!(patterns.len(), 1);
    assert_eq!(patterns[0].success_count, 5);
}

#[tokio::test]
async fn test_transaction_commits_atomically() {
    let (_dir, db_path) = temp_db_path();
    let store = sqlite_store(&db_path).await;

    store
        .put(Partition::Shared, "stale", b"x".to_vec(), PutOptions::default())
        .await
        .unwrap();

    store
        .with_transaction(|tx| {
            tx.put(Partition::Shared, "a", b"1".to_vec(), PutOptions::default());
            tx.put(Partition::Metrics, "b", b"2".to_vec(), PutOptions::default());
            tx.delete(Partition::Shared, "stale");
        })
        .await
        .unwrap();

    assert!(store.get(Partition::Shared, "a").await.unwrap().is_some());
    assert!(store.get(Partition::Metrics, "b").await.unwrap().is_some());
    assert!(store.get(Partition::Shared, "stale").await.unwrap().is_none());
}

#[tokio::test]
async fn test_ttl_expiry_and_sweeper() {
    let (_dir, db_path) = temp_db_path();
    let store = sqlite_store(&db_path).await;

    store
        .put(
            Partition::Quarantine,
            "flaky:test_login",
            b"quarantined".to_vec(),
            PutOptions {
                ttl_ms: Some(50),
                ..PutOptions::default()
            },
        )
        .await
        .unwrap();

    assert!(store
        .get(Partition::Quarantine, "flaky:test_login")
        .await
        .unwrap()
        .is_some());

    tokio::time::sleep(Duration::from_millis(80)).await;

    // Lazy expiry on read.
    assert!(store
        .get(Partition::Quarantine, "flaky:test_login")
        .await
        .unwrap()
        .is_none());

    // The sweeper physically removes it.
    let pruned = store.sweep_expired().await.unwrap();
    assert_eq!(pruned, 1);
}

#[tokio::test]
async fn test_pattern_lookup_at_scale() {
    let (_dir, db_path) = temp_db_path();
    let pool = initialize_database(&db_path, 5).await.unwrap();
    let backend = Arc::new(SqliteMemoryBackend::new(pool));

    // Seed 10,000 patterns across 100 agents.
    let agents: Vec<AgentId> = (0..100).map(|_| AgentId::new()).collect();
    let now = Utc::now();
    for (i, agent) in agents.iter().cycle().take(10_000).enumerate() {
        let mut pattern = Pattern::new(*agent, format!("type-{}", i % 7), vec![]);
        // Spread confidence across the full range.
        let successes = i % 11;
        let failures = 10 - successes;
        pattern.merge_counts(successes as u64, failures as u64, now);
        backend.store_pattern(&pattern).await.unwrap();
    }
    assert_eq!(backend.count_patterns().await.unwrap(), 10_000);

    let store = Arc::new(
        SwarmMemoryStore::new(
            backend,
            BackendKind::Real,
            MemoryConfig::default(),
            Arc::new(SystemClock::new()) as Arc<dyn Clock>,
        )
        .unwrap(),
    );

    let probe = agents[42];
    let cold_start = Instant::now();
    let cold = store.query_patterns_by_agent(probe, 0.5).await.unwrap();
    let cold_elapsed = cold_start.elapsed();
    assert!(!cold.is_empty());
    // Index-backed: each agent owns 100 of 10k patterns; this must not be
    // a table scan.
    assert!(
        cold_elapsed < Duration::from_millis(500),
        "cold agent-scoped query took {cold_elapsed:?}"
    );

    // Results are ordered by confidence descending.
    for window in cold.windows(2) {
        assert!(window[0].confidence >= window[1].confidence);
    }
    // Every result belongs to the probed agent and clears the floor.
    assert!(cold.iter().all(|p| p.agent_id == probe && p.confidence >= 0.5));

    // Primed cache answers fast.
    let warm_start = Instant::now();
    let warm = store.query_patterns_by_agent(probe, 0.5).await.unwrap();
    assert_eq!(warm.len(), cold.len());
    assert!(
        warm_start.elapsed() < Duration::from_millis(50),
        "cache hit should be near-instant"
    );
}

#[tokio::test]
async fn test_pattern_cache_invalidation_is_exact() {
    let (_dir, db_path) = temp_db_path();
    let store = sqlite_store(&db_path).await;

    let a = AgentId::new();
    let b = AgentId::new();
    let now = Utc::now();

    let mut pattern_a = Pattern::new(a, "t", vec![]);
    pattern_a.merge_counts(3, 0, now);
    let mut pattern_b = Pattern::new(b, "t", vec![]);
    pattern_b.merge_counts(3, 0, now);
    store.store_pattern(&pattern_a).await.unwrap();
    store.store_pattern(&pattern_b).await.unwrap();

    // Prime both agents' cache entries.
    store.query_patterns_by_agent(a, 0.0).await.unwrap();
    store.query_patterns_by_agent(b, 0.0).await.unwrap();
    store.pattern_cache().sync().await;
    assert!(store.pattern_cache().get(a).await.is_some());
    assert!(store.pattern_cache().get(b).await.is_some());

    // Updating one of A's patterns drops exactly A's entry.
    store.update_pattern(pattern_a.id, false).await.unwrap();
    store.pattern_cache().sync().await;
    assert!(store.pattern_cache().get(a).await.is_none());
    assert!(store.pattern_cache().get(b).await.is_some());

    // The next read observes the update.
    let refreshed = store.query_patterns_by_agent(a, 0.0).await.unwrap();
    assert_eq!(refreshed[0].failure_count, 1);
}

#[tokio::test]
async fn test_unknown_partition_rejected_at_write() {
    assert!(Partition::parse_str("scratchpad").is_err());
}

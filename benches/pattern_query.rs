//! Pattern lookup latency: cold backend queries vs primed cache hits.

use std::sync::Arc;

use chrono::Utc;
use criterion::{criterion_group, criterion_main, Criterion};

use aqe::adapters::memory::MockMemoryBackend;
use aqe::domain::models::{AgentId, BackendKind, MemoryConfig, Pattern};
use aqe::domain::ports::{Clock, SystemClock};
use aqe::services::SwarmMemoryStore;

fn bench_pattern_queries(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .expect("runtime");

    let (store, probe) = runtime.block_on(async {
        let store = SwarmMemoryStore::new(
            Arc::new(MockMemoryBackend::new()),
            BackendKind::Mock,
            MemoryConfig::default(),
            Arc::new(SystemClock::new()) as Arc<dyn Clock>,
        )
        .expect("store");

        let agents: Vec<AgentId> = (0..100).map(|_| AgentId::new()).collect();
        let now = Utc::now();
        for (i, agent) in agents.iter().cycle().take(10_000).enumerate() {
            let mut pattern = Pattern::new(*agent, format!("type-{}", i % 7), vec![]);
            pattern.merge_counts((i % 11) as u64, (10 - i % 11) as u64, now);
            store.store_pattern(&pattern).await.expect("store pattern");
        }
        (Arc::new(store), agents[42])
    });

    c.bench_function("pattern_query_cached", |b| {
        // Prime once; subsequent iterations hit the per-agent cache.
        runtime.block_on(store.query_patterns_by_agent(probe, 0.5)).unwrap();
        b.iter(|| {
            let hits = runtime
                .block_on(store.query_patterns_by_agent(probe, 0.5))
                .unwrap();
            assert!(!hits.is_empty());
        });
    });

    c.bench_function("pattern_query_cold", |b| {
        b.iter(|| {
            runtime.block_on(async {
                store.pattern_cache().invalidate(probe).await;
                let hits = store.query_patterns_by_agent(probe, 0.5).await.unwrap();
                assert!(!hits.is_empty());
            });
        });
    });
}

criterion_group!(benches, bench_pattern_queries);
criterion_main!(benches);

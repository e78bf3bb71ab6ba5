//! Event bus integration tests: ordering under concurrency, wildcard
//! fan-out, backpressure accounting, and history replay.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use aqe::domain::models::{EventBusConfig, Topic, TopicPattern};
use aqe::domain::ports::{Clock, SystemClock};
use aqe::services::EventBus;

fn bus_with(config: EventBusConfig) -> Arc<EventBus> {
    Arc::new(EventBus::new(
        config,
        Arc::new(SystemClock::new()) as Arc<dyn Clock>,
    ))
}

#[tokio::test]
async fn test_ordering_scenario_hundred_events() {
    let bus = bus_with(EventBusConfig::default());
    let (_id, mut rx) = bus
        .subscribe_channel("agent.test-generator.progress")
        .await
        .unwrap();

    for i in 1..=100u64 {
        let seq = bus
            .publish("agent.test-generator.progress", json!({ "i": i }), None)
            .await
            .unwrap();
        assert_eq!(seq, i);
    }

    let mut observed = Vec::with_capacity(100);
    for _ in 0..100 {
        observed.push(rx.recv().await.unwrap().sequence);
    }
    let expected: Vec<u64> = (1..=100).collect();
    assert_eq!(observed, expected, "no gaps, no reordering");
}

#[tokio::test]
async fn test_concurrent_publishers_keep_per_topic_fifo() {
    let bus = bus_with(EventBusConfig {
        mailbox_capacity: 1_024,
        ..EventBusConfig::default()
    });
    let (_id, mut rx) = bus.subscribe_channel("task.submitted").await.unwrap();

    let mut publishers = Vec::new();
    for p in 0..8 {
        let bus = bus.clone();
        publishers.push(tokio::spawn(async move {
            for i in 0..50 {
                bus.publish("task.submitted", json!({ "p": p, "i": i }), None)
                    .await
                    .unwrap();
            }
        }));
    }
    for handle in publishers {
        handle.await.unwrap();
    }

    // 400 events; the subscriber observes strictly increasing sequences.
    let mut last = 0;
    for _ in 0..400 {
        let event = rx.recv().await.unwrap();
        assert!(
            event.sequence > last,
            "sequence regressed: {} after {last}",
            event.sequence
        );
        last = event.sequence;
    }
    assert_eq!(last, 400);
}

#[tokio::test]
async fn test_wildcard_fanout_sees_union_of_topics() {
    let bus = bus_with(EventBusConfig::default());
    let (_id, mut rx) = bus.subscribe_channel("agent.**").await.unwrap();

    bus.publish("agent.test-generator.task.started", json!({}), None)
        .await
        .unwrap();
    bus.publish("agent.coverage-analyzer.task.completed", json!({}), None)
        .await
        .unwrap();
    bus.publish("task.completed", json!({}), None).await.unwrap();

    let first = rx.recv().await.unwrap();
    let second = rx.recv().await.unwrap();
    assert!(first.topic.as_str().starts_with("agent."));
    assert!(second.topic.as_str().starts_with("agent."));
    assert!(rx.try_recv().is_err(), "task.* must not match agent.**");
}

#[tokio::test]
async fn test_backpressure_drop_is_bounded_and_reported() {
    let bus = bus_with(EventBusConfig {
        mailbox_capacity: 1,
        publish_timeout_ms: 20,
        ..EventBusConfig::default()
    });

    // Never drained: every publish beyond the first must drop for this
    // subscriber after the publish timeout.
    let (_slow, _slow_rx) = bus.subscribe_channel("memory.pressure").await.unwrap();

    let publishes = 5u64;
    for _ in 0..publishes {
        bus.publish("memory.pressure", json!({}), None).await.unwrap();
    }

    // Exactly one event fit the mailbox; the rest dropped, one per publish.
    assert_eq!(bus.dropped_event_count(), publishes - 1);

    let drops = bus.history("bus.backpressure.drop", None).await.unwrap();
    assert_eq!(drops.len() as u64, publishes - 1);
    for event in &drops {
        assert_eq!(event.payload["topic"].as_str(), Some("memory.pressure"));
    }
}

#[tokio::test]
async fn test_history_replay_returns_published_event_at_head() {
    let bus = bus_with(EventBusConfig::default());

    for i in 0..10 {
        bus.publish("learning.progress", json!({ "i": i }), None)
            .await
            .unwrap();
    }
    let seq = bus
        .publish("learning.progress", json!({ "needle": true }), None)
        .await
        .unwrap();

    let replay = bus.history("learning.progress", Some(seq)).await.unwrap();
    assert_eq!(replay.len(), 1);
    assert_eq!(replay[0].sequence, seq);
    assert_eq!(replay[0].payload["needle"], json!(true));
}

#[tokio::test]
async fn test_slow_handler_does_not_block_publisher() {
    let bus = bus_with(EventBusConfig {
        mailbox_capacity: 2,
        publish_timeout_ms: 30,
        handler_timeout_ms: 10_000,
        ..EventBusConfig::default()
    });

    bus.subscribe("fleet.tick", |_event| async {
        tokio::time::sleep(Duration::from_secs(60)).await;
    })
    .await
    .unwrap();

    // Publishers stay bounded: worst case mailbox-full wait is the publish
    // timeout, never the handler's 60s.
    let start = std::time::Instant::now();
    for _ in 0..5 {
        bus.publish("fleet.tick", json!({}), None).await.unwrap();
    }
    assert!(start.elapsed() < Duration::from_secs(2));
}

#[test]
fn test_pattern_matching_table() {
    let cases = [
        ("task.*", "task.completed", true),
        ("task.*", "task.completed.extra", false),
        ("agent.*.task.*", "agent.flaky-hunter.task.failed", true),
        ("agent.**", "agent.flaky-hunter.progress.tick.deep", true),
        ("**", "memory.gc.swept", true),
        ("fleet.started", "fleet.stopped", false),
    ];
    for (pattern, topic, expected) in cases {
        let pattern = TopicPattern::parse(pattern).unwrap();
        let topic = Topic::parse(topic).unwrap();
        assert_eq!(
            pattern.matches(&topic),
            expected,
            "{pattern} vs {}",
            topic.as_str()
        );
    }
}

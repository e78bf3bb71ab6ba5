//! In-process publish/subscribe fabric.
//!
//! Topics are dot-separated hierarchies with per-topic sequence numbers
//! and a replayable history ring. Subscribers register a wildcard pattern
//! and drain a bounded mailbox on their own worker task, so a slow
//! handler exerts backpressure only on itself: when its mailbox stays
//! full past `publish_timeout_ms`, the event is dropped for that one
//! subscriber and a `bus.backpressure.drop` diagnostic is emitted. The
//! publisher itself still succeeds.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::{mpsc, Mutex, RwLock};
use uuid::Uuid;

use crate::domain::errors::BusError;
use crate::domain::models::config::EventBusConfig;
use crate::domain::models::{topics, AgentId, BusEvent, Topic, TopicPattern};
use crate::domain::ports::{Clock, EventSink};

/// Identifier handed back by `subscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct TopicState {
    next_sequence: u64,
    ring: VecDeque<BusEvent>,
}

impl TopicState {
    fn new() -> Self {
        Self {
            next_sequence: 1,
            ring: VecDeque::new(),
        }
    }
}

struct Subscription {
    pattern: TopicPattern,
    tx: mpsc::Sender<BusEvent>,
}

/// Central event bus.
pub struct EventBus {
    topics: RwLock<HashMap<String, Arc<Mutex<TopicState>>>>,
    subscriptions: RwLock<HashMap<u64, Subscription>>,
    next_subscription_id: AtomicU64,
    shut_down: AtomicBool,
    sink: Option<Arc<dyn EventSink>>,
    clock: Arc<dyn Clock>,
    config: EventBusConfig,
    dropped_events: AtomicU64,
    workers: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl EventBus {
    pub fn new(config: EventBusConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            subscriptions: RwLock::new(HashMap::new()),
            next_subscription_id: AtomicU64::new(1),
            shut_down: AtomicBool::new(false),
            sink: None,
            clock,
            config,
            dropped_events: AtomicU64::new(0),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Attach a persistence hook appended to on every publish.
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Resume per-topic sequence numbering from the sink after a restart,
    /// so persisted sequences never collide. Call before the first
    /// publish.
    pub async fn initialize_sequences_from_sink(&self) {
        let Some(ref sink) = self.sink else { return };
        match sink.latest_sequences().await {
            Ok(latest) => {
                for (topic, seq) in latest {
                    let state_arc = self.topic_state(&topic).await;
                    let mut state = state_arc.lock().await;
                    state.next_sequence = state.next_sequence.max(seq + 1);
                }
            }
            Err(e) => {
                tracing::warn!("failed to read persisted event sequences: {e}");
            }
        }
    }

    /// Publish an event. Returns the topic-scoped sequence number.
    ///
    /// Never blocks beyond `publish_timeout_ms` per congested subscriber;
    /// fails only when the bus is shut down or the topic is invalid.
    pub async fn publish(
        &self,
        topic: &str,
        payload: serde_json::Value,
        source_agent: Option<AgentId>,
    ) -> Result<u64, BusError> {
        self.publish_with_policy(topic, payload, source_agent, true)
            .await
    }

    async fn publish_with_policy(
        &self,
        topic: &str,
        payload: serde_json::Value,
        source_agent: Option<AgentId>,
        block_on_full: bool,
    ) -> Result<u64, BusError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(BusError::Shutdown);
        }
        let topic = Topic::parse(topic)?;

        let state_arc = self.topic_state(topic.as_str()).await;
        // The per-topic lock serializes sequence assignment and mailbox
        // enqueue, which is what gives per-topic FIFO to every subscriber.
        let mut state = state_arc.lock().await;

        let sequence = state.next_sequence;
        state.next_sequence += 1;

        let event = BusEvent {
            id: Uuid::new_v4(),
            topic: topic.clone(),
            sequence,
            payload,
            source_agent,
            published_at: self.clock.now(),
        };

        state.ring.push_back(event.clone());
        while state.ring.len() > self.config.topic_ring_capacity {
            state.ring.pop_front();
        }

        if let Some(ref sink) = self.sink {
            if let Err(e) = sink.append(&event).await {
                tracing::warn!(topic = %topic, sequence, "failed to persist event: {e}");
            }
        }

        // Snapshot matching senders so subscribe/unsubscribe are not
        // blocked while congested mailboxes are waited on.
        let targets: Vec<(u64, mpsc::Sender<BusEvent>)> = {
            let subs = self.subscriptions.read().await;
            subs.iter()
                .filter(|(_, s)| s.pattern.matches(&topic))
                .map(|(id, s)| (*id, s.tx.clone()))
                .collect()
        };

        for (sub_id, tx) in targets {
            match tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Closed(_)) => {}
                Err(mpsc::error::TrySendError::Full(ev)) => {
                    if !block_on_full {
                        self.dropped_events.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                    let wait = Duration::from_millis(self.config.publish_timeout_ms);
                    match tokio::time::timeout(wait, tx.send(ev)).await {
                        Ok(Ok(())) => {}
                        Ok(Err(_)) => {}
                        Err(_) => {
                            self.dropped_events.fetch_add(1, Ordering::Relaxed);
                            tracing::warn!(
                                topic = %topic,
                                sequence,
                                subscription = sub_id,
                                "mailbox full past publish timeout; event dropped for subscriber"
                            );
                            self.emit_backpressure_drop(sub_id, &topic, sequence).await;
                        }
                    }
                }
            }
        }

        Ok(sequence)
    }

    /// The diagnostic itself never blocks and is suppressed for `bus.*`
    /// topics, so drops cannot recurse.
    async fn emit_backpressure_drop(&self, sub_id: u64, topic: &Topic, sequence: u64) {
        if topic.as_str().starts_with("bus.") {
            return;
        }
        let payload = json!({
            "subscription": sub_id,
            "topic": topic.as_str(),
            "sequence": sequence,
        });
        // Boxed: this re-enters the publish path.
        let publish =
            Box::pin(self.publish_with_policy(topics::BUS_BACKPRESSURE_DROP, payload, None, false));
        if let Err(e) = publish.await {
            tracing::debug!("failed to emit backpressure drop event: {e}");
        }
    }

    async fn topic_state(&self, topic: &str) -> Arc<Mutex<TopicState>> {
        {
            let map = self.topics.read().await;
            if let Some(state) = map.get(topic) {
                return state.clone();
            }
        }
        let mut map = self.topics.write().await;
        map.entry(topic.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(TopicState::new())))
            .clone()
    }

    /// Subscribe a handler to every topic matching `pattern`.
    ///
    /// The handler runs on its own worker; a panic is contained and a
    /// handler exceeding `handler_timeout_ms` is abandoned on its own
    /// spawned task. Neither affects other subscribers or the bus.
    pub async fn subscribe<F, Fut>(
        &self,
        pattern: &str,
        handler: F,
    ) -> Result<SubscriptionId, BusError>
    where
        F: Fn(BusEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (id, mut rx) = self.subscribe_channel(pattern).await?;
        let handler_timeout = Duration::from_millis(self.config.handler_timeout_ms);

        let worker = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let topic = event.topic.clone();
                let sequence = event.sequence;
                let invocation = tokio::spawn(handler(event));
                match tokio::time::timeout(handler_timeout, invocation).await {
                    Ok(Ok(())) => {}
                    Ok(Err(join_err)) => {
                        tracing::warn!(
                            topic = %topic,
                            sequence,
                            "event handler panicked: {join_err}"
                        );
                    }
                    Err(_) => {
                        tracing::warn!(
                            topic = %topic,
                            sequence,
                            timeout_ms = handler_timeout.as_millis() as u64,
                            "event handler exceeded timeout; abandoned"
                        );
                    }
                }
            }
        });
        self.workers.lock().await.push(worker);

        Ok(id)
    }

    /// Subscribe without a handler: the caller drains the mailbox itself.
    pub async fn subscribe_channel(
        &self,
        pattern: &str,
    ) -> Result<(SubscriptionId, mpsc::Receiver<BusEvent>), BusError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(BusError::Shutdown);
        }
        let pattern = TopicPattern::parse(pattern)?;
        let (tx, rx) = mpsc::channel(self.config.mailbox_capacity);
        let id = self.next_subscription_id.fetch_add(1, Ordering::SeqCst);
        self.subscriptions
            .write()
            .await
            .insert(id, Subscription { pattern, tx });
        Ok((SubscriptionId(id), rx))
    }

    pub async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), BusError> {
        self.subscriptions
            .write()
            .await
            .remove(&id.0)
            .map(|_| ())
            .ok_or(BusError::UnknownSubscription(id.0))
    }

    /// Replay the retained tail of a topic, oldest first.
    ///
    /// With `since_seq`, only events with `sequence >= since_seq` are
    /// returned.
    pub async fn history(
        &self,
        topic: &str,
        since_seq: Option<u64>,
    ) -> Result<Vec<BusEvent>, BusError> {
        let topic = Topic::parse(topic)?;
        let map = self.topics.read().await;
        let Some(state_arc) = map.get(topic.as_str()).cloned() else {
            return Ok(Vec::new());
        };
        drop(map);
        let state = state_arc.lock().await;
        let since = since_seq.unwrap_or(0);
        Ok(state
            .ring
            .iter()
            .filter(|e| e.sequence >= since)
            .cloned()
            .collect())
    }

    /// Highest sequence assigned on a topic so far (0 when unused).
    pub async fn current_sequence(&self, topic: &str) -> u64 {
        let map = self.topics.read().await;
        match map.get(topic) {
            Some(state_arc) => {
                let state = state_arc.lock().await;
                state.next_sequence - 1
            }
            None => 0,
        }
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscriptions.read().await.len()
    }

    /// Total events dropped to backpressure since construction.
    pub fn dropped_event_count(&self) -> u64 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Reject new publishes and drain in-flight handlers.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        // Dropping the senders lets each worker drain its mailbox and exit.
        self.subscriptions.write().await.clear();
        let workers = std::mem::take(&mut *self.workers.lock().await);
        for worker in workers {
            if tokio::time::timeout(Duration::from_secs(5), worker)
                .await
                .is_err()
            {
                tracing::warn!("event bus worker did not drain within 5s");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::SystemClock;
    use std::sync::atomic::AtomicUsize;

    fn test_bus() -> EventBus {
        EventBus::new(EventBusConfig::default(), Arc::new(SystemClock::new()))
    }

    fn small_bus(mailbox: usize, publish_timeout_ms: u64) -> EventBus {
        let config = EventBusConfig {
            mailbox_capacity: mailbox,
            publish_timeout_ms,
            ..EventBusConfig::default()
        };
        EventBus::new(config, Arc::new(SystemClock::new()))
    }

    #[tokio::test]
    async fn test_sequences_are_per_topic_and_increasing() {
        let bus = test_bus();
        assert_eq!(bus.publish("task.submitted", json!({}), None).await.unwrap(), 1);
        assert_eq!(bus.publish("task.submitted", json!({}), None).await.unwrap(), 2);
        assert_eq!(bus.publish("task.completed", json!({}), None).await.unwrap(), 1);
        assert_eq!(bus.current_sequence("task.submitted").await, 2);
        assert_eq!(bus.current_sequence("task.completed").await, 1);
        assert_eq!(bus.current_sequence("task.unused").await, 0);
    }

    #[tokio::test]
    async fn test_subscriber_sees_fifo_without_gaps() {
        let bus = test_bus();
        let (_id, mut rx) = bus
            .subscribe_channel("agent.test-generator.progress")
            .await
            .unwrap();

        for i in 0..100 {
            bus.publish("agent.test-generator.progress", json!({ "i": i }), None)
                .await
                .unwrap();
        }

        let mut sequences = Vec::new();
        for _ in 0..100 {
            sequences.push(rx.recv().await.unwrap().sequence);
        }
        let expected: Vec<u64> = (1..=100).collect();
        assert_eq!(sequences, expected);
    }

    #[tokio::test]
    async fn test_wildcard_subscription() {
        let bus = test_bus();
        let (_id, mut rx) = bus.subscribe_channel("agent.*.task.completed").await.unwrap();

        bus.publish("agent.test-generator.task.completed", json!({}), None)
            .await
            .unwrap();
        bus.publish("agent.coverage-analyzer.task.completed", json!({}), None)
            .await
            .unwrap();
        bus.publish("agent.coverage-analyzer.task.started", json!({}), None)
            .await
            .unwrap();

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(first.topic.as_str(), "agent.test-generator.task.completed");
        assert_eq!(second.topic.as_str(), "agent.coverage-analyzer.task.completed");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_invalid_topic_rejected() {
        let bus = test_bus();
        assert!(bus.publish("bogus.topic", json!({}), None).await.is_err());
        assert!(bus.publish("task..bad", json!({}), None).await.is_err());
    }

    #[tokio::test]
    async fn test_history_replay_from_sequence() {
        let bus = test_bus();
        for i in 0..5 {
            bus.publish("task.submitted", json!({ "i": i }), None)
                .await
                .unwrap();
        }

        let all = bus.history("task.submitted", None).await.unwrap();
        assert_eq!(all.len(), 5);

        let tail = bus.history("task.submitted", Some(3)).await.unwrap();
        assert_eq!(tail.len(), 3);
        assert_eq!(tail[0].sequence, 3);

        // Publishing then replaying from that sequence returns the event at
        // the head.
        let seq = bus.publish("task.submitted", json!({}), None).await.unwrap();
        let replay = bus.history("task.submitted", Some(seq)).await.unwrap();
        assert_eq!(replay[0].sequence, seq);
    }

    #[tokio::test]
    async fn test_ring_capacity_evicts_oldest() {
        let config = EventBusConfig {
            topic_ring_capacity: 3,
            ..EventBusConfig::default()
        };
        let bus = EventBus::new(config, Arc::new(SystemClock::new()));
        for _ in 0..5 {
            bus.publish("task.submitted", json!({}), None).await.unwrap();
        }
        let history = bus.history("task.submitted", None).await.unwrap();
        let sequences: Vec<u64> = history.iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn test_backpressure_drops_for_slow_subscriber_only() {
        let bus = Arc::new(small_bus(1, 20));

        // Slow subscriber: never drains.
        let (_slow_id, slow_rx) = bus.subscribe_channel("task.submitted").await.unwrap();
        // Fast subscriber drains everything.
        let (_fast_id, mut fast_rx) = bus.subscribe_channel("task.submitted").await.unwrap();

        for _ in 0..4 {
            bus.publish("task.submitted", json!({}), None).await.unwrap();
        }

        // All four publishes succeeded and the fast subscriber saw them all.
        for expected in 1..=4u64 {
            assert_eq!(fast_rx.recv().await.unwrap().sequence, expected);
        }

        // The slow subscriber's mailbox held one event; the rest dropped.
        assert!(bus.dropped_event_count() >= 1);
        let drops = bus.history(topics::BUS_BACKPRESSURE_DROP, None).await.unwrap();
        assert!(!drops.is_empty());
        drop(slow_rx);
    }

    #[tokio::test]
    async fn test_panicking_handler_does_not_affect_others() {
        let bus = test_bus();
        let seen = Arc::new(AtomicUsize::new(0));

        bus.subscribe("task.submitted", |_event| async {
            panic!("handler exploded");
        })
        .await
        .unwrap();

        let seen_clone = seen.clone();
        bus.subscribe("task.submitted", move |_event| {
            let seen = seen_clone.clone();
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
            }
        })
        .await
        .unwrap();

        for _ in 0..3 {
            bus.publish("task.submitted", json!({}), None).await.unwrap();
        }

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let bus = test_bus();
        let (id, mut rx) = bus.subscribe_channel("task.submitted").await.unwrap();

        bus.publish("task.submitted", json!({}), None).await.unwrap();
        assert!(rx.recv().await.is_some());

        bus.unsubscribe(id).await.unwrap();
        bus.publish("task.submitted", json!({}), None).await.unwrap();
        assert!(rx.recv().await.is_none());

        assert!(bus.unsubscribe(id).await.is_err());
    }

    #[tokio::test]
    async fn test_shutdown_rejects_publishes() {
        let bus = test_bus();
        bus.publish("task.submitted", json!({}), None).await.unwrap();
        bus.shutdown().await;

        let err = bus.publish("task.submitted", json!({}), None).await.unwrap_err();
        assert!(matches!(err, BusError::Shutdown));
        assert!(bus.is_shut_down());

        // Idempotent.
        bus.shutdown().await;
    }
}

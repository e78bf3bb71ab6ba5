//! Routing policy: capability matching, learned selection, and failure
//! blacklisting.
//!
//! For a ready task the router collects agent types whose capabilities
//! cover the requirement, asks the learning engine to pick among them,
//! and falls back to lowest current load (then round-robin) while the
//! engine is cold. Repeated failures of one `(fingerprint, type)` pair
//! blacklist that pair for a cooldown.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::domain::errors::{FleetError, FleetResult};
use crate::domain::models::config::RouterConfig;
use crate::domain::models::{Task, Topology};
use crate::domain::ports::Clock;
use crate::services::agent_registry::AgentRegistry;
use crate::services::learning_engine::LearningEngine;

type PairKey = (String, String);

#[derive(Default)]
struct RouterState {
    consecutive_failures: HashMap<PairKey, u32>,
    blacklist_until: HashMap<PairKey, DateTime<Utc>>,
    inflight: HashMap<String, u32>,
    rr_cursor: usize,
}

pub struct Router {
    registry: Arc<AgentRegistry>,
    learning: Arc<LearningEngine>,
    clock: Arc<dyn Clock>,
    config: RouterConfig,
    topology: Topology,
    state: std::sync::Mutex<RouterState>,
}

impl Router {
    pub fn new(
        registry: Arc<AgentRegistry>,
        learning: Arc<LearningEngine>,
        clock: Arc<dyn Clock>,
        config: RouterConfig,
        topology: Topology,
    ) -> Self {
        Self {
            registry,
            learning,
            clock,
            config,
            topology,
            state: std::sync::Mutex::new(RouterState::default()),
        }
    }

    /// Pick an agent type for the task.
    pub async fn route(&self, task: &Task) -> FleetResult<String> {
        let candidates = self
            .registry
            .types_with_capabilities(&task.required_capabilities);
        if candidates.is_empty() {
            return Err(FleetError::CapabilityUnmet {
                task_id: task.id.0,
                missing: task.required_capabilities.iter().cloned().collect(),
            });
        }

        let fingerprint = task.fingerprint();
        let available = {
            let mut state = self.state.lock().expect("router lock poisoned");
            let now = self.clock.now();
            state.blacklist_until.retain(|_, until| *until > now);
            let filtered: Vec<String> = candidates
                .iter()
                .filter(|c| {
                    !state
                        .blacklist_until
                        .contains_key(&(fingerprint.clone(), (*c).clone()))
                })
                .cloned()
                .collect();
            // A fully blacklisted candidate set falls back to all of them
            // rather than starving the task.
            if filtered.is_empty() {
                candidates.clone()
            } else {
                filtered
            }
        };

        if let Some(learned) = self.learning.select_action(&fingerprint, &available).await {
            if available.contains(&learned) {
                return Ok(learned);
            }
        }

        // Cold path: lowest in-flight load, round-robin among ties. Ring
        // topologies rotate regardless of load.
        let mut state = self.state.lock().expect("router lock poisoned");
        if self.topology.prefers_round_robin() {
            let choice = available[state.rr_cursor % available.len()].clone();
            state.rr_cursor = state.rr_cursor.wrapping_add(1);
            return Ok(choice);
        }

        let min_load = available
            .iter()
            .map(|c| state.inflight.get(c).copied().unwrap_or(0))
            .min()
            .unwrap_or(0);
        let least_loaded: Vec<&String> = available
            .iter()
            .filter(|c| state.inflight.get(*c).copied().unwrap_or(0) == min_load)
            .collect();
        let choice = least_loaded[state.rr_cursor % least_loaded.len()].clone();
        state.rr_cursor = state.rr_cursor.wrapping_add(1);
        Ok(choice)
    }

    /// Track per-type in-flight load for the tie-break.
    pub fn note_dispatch(&self, agent_type: &str) {
        let mut state = self.state.lock().expect("router lock poisoned");
        *state.inflight.entry(agent_type.to_string()).or_default() += 1;
    }

    pub fn note_done(&self, agent_type: &str) {
        let mut state = self.state.lock().expect("router lock poisoned");
        if let Some(count) = state.inflight.get_mut(agent_type) {
            *count = count.saturating_sub(1);
        }
    }

    /// Record a routing outcome; enough consecutive failures blacklist
    /// the `(fingerprint, type)` pair for the configured cooldown.
    pub fn record_outcome(&self, fingerprint: &str, agent_type: &str, success: bool) {
        let key = (fingerprint.to_string(), agent_type.to_string());
        let mut state = self.state.lock().expect("router lock poisoned");
        if success {
            state.consecutive_failures.remove(&key);
            return;
        }
        let failures = state.consecutive_failures.entry(key.clone()).or_default();
        *failures += 1;
        if *failures >= self.config.blacklist_threshold {
            let until = self.clock.now()
                + chrono::Duration::milliseconds(
                    i64::try_from(self.config.blacklist_cooldown_ms).unwrap_or(i64::MAX),
                );
            tracing::info!(
                fingerprint,
                agent_type,
                cooldown_ms = self.config.blacklist_cooldown_ms,
                "blacklisting routing pair after repeated failures"
            );
            state.blacklist_until.insert(key.clone(), until);
            state.consecutive_failures.remove(&key);
        }
    }

    pub fn is_blacklisted(&self, fingerprint: &str, agent_type: &str) -> bool {
        let state = self.state.lock().expect("router lock poisoned");
        let key = (fingerprint.to_string(), agent_type.to_string());
        state
            .blacklist_until
            .get(&key)
            .is_some_and(|until| *until > self.clock.now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::MockMemoryBackend;
    use crate::domain::models::config::{
        EventBusConfig, LearningConfig, MemoryConfig,
    };
    use crate::domain::models::BackendKind;
    use crate::domain::ports::{ManualClock, SystemClock};
    use crate::services::agent_registry::register_builtin_agents;
    use crate::services::event_bus::EventBus;
    use crate::services::memory_service::SwarmMemoryStore;
    use serde_json::json;

    fn learning_over(clock: Arc<dyn Clock>) -> Arc<LearningEngine> {
        let bus = Arc::new(EventBus::new(EventBusConfig::default(), clock.clone()));
        let store = Arc::new(
            SwarmMemoryStore::new(
                Arc::new(MockMemoryBackend::new()),
                BackendKind::Mock,
                MemoryConfig::default(),
                clock.clone(),
            )
            .unwrap(),
        );
        Arc::new(LearningEngine::new(
            store,
            bus,
            clock,
            LearningConfig {
                epsilon: 0.0,
                ..LearningConfig::default()
            },
        ))
    }

    fn router_with(clock: Arc<dyn Clock>, topology: Topology) -> (Router, Arc<LearningEngine>) {
        let registry = Arc::new(AgentRegistry::new());
        register_builtin_agents(&registry);
        let learning = learning_over(clock.clone());
        let router = Router::new(
            registry,
            learning.clone(),
            clock,
            RouterConfig {
                blacklist_threshold: 2,
                blacklist_cooldown_ms: 60_000,
            },
            topology,
        );
        (router, learning)
    }

    #[tokio::test]
    async fn test_capability_unmet() {
        let (router, _) = router_with(Arc::new(SystemClock::new()), Topology::Mesh);
        let task = Task::new("t", json!({})).with_capability("teleportation");
        let err = router.route(&task).await.unwrap_err();
        assert!(matches!(err, FleetError::CapabilityUnmet { .. }));
    }

    #[tokio::test]
    async fn test_cold_fallback_prefers_least_loaded() {
        let (router, _) = router_with(Arc::new(SystemClock::new()), Topology::Mesh);
        // Both test-executor and test-generator advertise jest.
        let task = Task::new("t", json!({})).with_capability("jest");

        router.note_dispatch("test-executor");
        router.note_dispatch("test-executor");
        let choice = router.route(&task).await.unwrap();
        assert_eq!(choice, "test-generator");
    }

    #[tokio::test]
    async fn test_ring_topology_round_robins() {
        let (router, _) = router_with(Arc::new(SystemClock::new()), Topology::Ring);
        let task = Task::new("t", json!({})).with_capability("jest");
        let first = router.route(&task).await.unwrap();
        let second = router.route(&task).await.unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_learned_selection_wins() {
        let (router, learning) = router_with(Arc::new(SystemClock::new()), Topology::Mesh);
        let task = Task::new("t", json!({})).with_capability("jest");
        let fingerprint = task.fingerprint();

        for _ in 0..10 {
            learning
                .update_q_value(&fingerprint, "test-executor", 1.0, None)
                .await;
        }
        // Load says test-generator, learning says test-executor.
        router.note_dispatch("test-executor");
        let choice = router.route(&task).await.unwrap();
        assert_eq!(choice, "test-executor");
    }

    #[tokio::test]
    async fn test_blacklist_after_threshold_and_expiry() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let (router, _) = router_with(clock.clone(), Topology::Mesh);
        let task = Task::new("t", json!({})).with_capability("jest");
        let fingerprint = task.fingerprint();

        router.record_outcome(&fingerprint, "test-executor", false);
        assert!(!router.is_blacklisted(&fingerprint, "test-executor"));
        router.record_outcome(&fingerprint, "test-executor", false);
        assert!(router.is_blacklisted(&fingerprint, "test-executor"));

        // Routing avoids the blacklisted pair.
        for _ in 0..5 {
            let choice = router.route(&task).await.unwrap();
            assert_eq!(choice, "test-generator");
        }

        // Cooldown elapses and the pair becomes eligible again.
        clock.advance_ms(60_001);
        assert!(!router.is_blacklisted(&fingerprint, "test-executor"));
    }

    #[tokio::test]
    async fn test_success_resets_failure_streak() {
        let (router, _) = router_with(Arc::new(SystemClock::new()), Topology::Mesh);
        router.record_outcome("fp", "test-executor", false);
        router.record_outcome("fp", "test-executor", true);
        router.record_outcome("fp", "test-executor", false);
        assert!(!router.is_blacklisted("fp", "test-executor"));
    }

    #[tokio::test]
    async fn test_all_blacklisted_falls_back_to_candidates() {
        let (router, _) = router_with(Arc::new(SystemClock::new()), Topology::Mesh);
        let task = Task::new("t", json!({})).with_capability("jest");
        let fingerprint = task.fingerprint();

        for agent_type in ["test-executor", "test-generator"] {
            router.record_outcome(&fingerprint, agent_type, false);
            router.record_outcome(&fingerprint, agent_type, false);
        }
        // Both pairs are blacklisted; the router still routes.
        assert!(router.route(&task).await.is_ok());
    }
}

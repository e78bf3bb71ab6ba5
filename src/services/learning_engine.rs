//! Learning engine: experience capture, Q-value bookkeeping, and pattern
//! mining.
//!
//! Q-values are held in an in-process map (loaded from the
//! `learning/qvalues` partition at startup so restarts recover) and
//! updated immediately by the TD(0) rule; persistence is batched and
//! flushed in insertion order inside one store transaction. Failed
//! persistence retries with exponential backoff and finally surfaces a
//! `learning.persist.failed` event instead of crashing the fleet.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use rand::Rng;
use serde_json::json;
use tokio::sync::{mpsc, Mutex, RwLock};

use crate::domain::errors::{MemoryError, MemoryResult};
use crate::domain::models::config::LearningConfig;
use crate::domain::models::{
    topics, AgentId, Experience, Partition, Pattern, PatternHint, PutOptions, QValue,
};
use crate::domain::ports::Clock;
use crate::services::event_bus::EventBus;
use crate::services::memory_service::SwarmMemoryStore;
use crate::services::DaemonHandle;

type QKey = (String, String);

pub struct LearningEngine {
    store: Arc<SwarmMemoryStore>,
    bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    config: LearningConfig,
    qvalues: RwLock<HashMap<QKey, QValue>>,
    /// Dirty keys awaiting persistence, in update order.
    pending: Mutex<Vec<QKey>>,
    epsilon: std::sync::Mutex<f64>,
}

impl LearningEngine {
    pub fn new(
        store: Arc<SwarmMemoryStore>,
        bus: Arc<EventBus>,
        clock: Arc<dyn Clock>,
        config: LearningConfig,
    ) -> Self {
        let epsilon = config.epsilon;
        Self {
            store,
            bus,
            clock,
            config,
            qvalues: RwLock::new(HashMap::new()),
            pending: Mutex::new(Vec::new()),
            epsilon: std::sync::Mutex::new(epsilon),
        }
    }

    /// Recover Q-values persisted by a previous run.
    pub async fn load(&self) -> MemoryResult<usize> {
        let entries = self
            .store
            .scan(Partition::LearningQvalues, None, None)
            .await?;
        let mut map = self.qvalues.write().await;
        let mut loaded = 0;
        for entry in entries {
            match serde_json::from_slice::<QValue>(&entry.value) {
                Ok(q) => {
                    map.insert((q.state_key.clone(), q.action_key.clone()), q);
                    loaded += 1;
                }
                Err(e) => {
                    tracing::warn!(key = %entry.key, "skipping malformed persisted q-value: {e}");
                }
            }
        }
        tracing::info!(loaded, "learning engine recovered q-values");
        Ok(loaded)
    }

    /// Persist one experience into `learning/experiences`.
    ///
    /// Retries transient failures; after `max_persist_retries` the error
    /// is surfaced on `learning.persist.failed` and returned, but callers
    /// treat it as non-fatal.
    pub async fn record_experience(&self, experience: &Experience) -> MemoryResult<()> {
        let value = serde_json::to_vec(experience)?;
        let key = experience.storage_key();
        let options = PutOptions {
            agent_id: Some(experience.agent_id),
            ..PutOptions::default()
        };

        let mut attempt = 0u32;
        loop {
            match self
                .store
                .put(Partition::LearningExperiences, &key, value.clone(), options.clone())
                .await
            {
                Ok(_) => return Ok(()),
                Err(e) if e.is_transient() && attempt < self.config.max_persist_retries => {
                    attempt += 1;
                    let delay = Duration::from_millis(50u64 * (1u64 << attempt.min(6)));
                    tracing::warn!(attempt, "experience persist failed, retrying: {e}");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    self.emit_persist_failed("experience", &key, &e).await;
                    return Err(e);
                }
            }
        }
    }

    /// Apply the TD(0) update rule and queue the value for persistence.
    ///
    /// `Q(s,a) ← Q(s,a) + α · (r + γ · max_a' Q(s',a') − Q(s,a))`
    pub async fn update_q_value(
        &self,
        state_key: &str,
        action_key: &str,
        reward: f64,
        next_state_key: Option<&str>,
    ) -> f64 {
        let new_value;
        {
            let mut map = self.qvalues.write().await;
            let max_next = next_state_key.map_or(0.0, |next| {
                map.iter()
                    .filter(|((s, _), _)| s == next)
                    .map(|(_, q)| q.value)
                    .fold(f64::NEG_INFINITY, f64::max)
                    .max(0.0)
            });
            let q = map
                .entry((state_key.to_string(), action_key.to_string()))
                .or_insert_with(|| QValue::new(state_key, action_key));
            q.apply_td0(reward, max_next, self.config.alpha, self.config.gamma);
            new_value = q.value;
        }

        let should_flush = {
            let mut pending = self.pending.lock().await;
            pending.push((state_key.to_string(), action_key.to_string()));
            pending.len() >= self.config.batch_size
        };
        if should_flush {
            if let Err(e) = self.flush().await {
                tracing::warn!("q-value batch flush failed: {e}");
            }
        }
        new_value
    }

    /// Current Q-value, if any.
    pub async fn q_value(&self, state_key: &str, action_key: &str) -> Option<f64> {
        let map = self.qvalues.read().await;
        map.get(&(state_key.to_string(), action_key.to_string()))
            .map(|q| q.value)
    }

    /// ε-greedy action selection over the candidate set.
    ///
    /// Returns `None` when the engine is cold for this state (no recorded
    /// value for any candidate) so the router can fall back to its
    /// load-based tie-break.
    pub async fn select_action(&self, state_key: &str, candidates: &[String]) -> Option<String> {
        if candidates.is_empty() {
            return None;
        }
        let map = self.qvalues.read().await;
        let known: Vec<(&String, f64)> = candidates
            .iter()
            .filter_map(|c| {
                map.get(&(state_key.to_string(), c.clone()))
                    .map(|q| (c, q.value))
            })
            .collect();
        if known.is_empty() {
            return None;
        }

        let epsilon = {
            let mut eps = self.epsilon.lock().expect("epsilon lock poisoned");
            let current = *eps;
            *eps *= self.config.epsilon_decay;
            current
        };

        let mut rng = rand::thread_rng();
        if rng.gen::<f64>() < epsilon {
            return candidates.choose(&mut rng).cloned();
        }

        // Exploit: argmax over candidates; unknown candidates count as 0.
        let best = candidates
            .iter()
            .map(|c| {
                let value = map
                    .get(&(state_key.to_string(), c.clone()))
                    .map_or(0.0, |q| q.value);
                (c, value)
            })
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(c, _)| c.clone());
        best
    }

    /// Flush queued Q-value updates in insertion order under one store
    /// transaction. Returns the number of persisted values.
    pub async fn flush(&self) -> MemoryResult<usize> {
        let keys: Vec<QKey> = {
            let mut pending = self.pending.lock().await;
            std::mem::take(&mut *pending)
        };
        if keys.is_empty() {
            return Ok(0);
        }

        let snapshots: Vec<QValue> = {
            let map = self.qvalues.read().await;
            keys.iter().filter_map(|k| map.get(k).cloned()).collect()
        };
        let count = snapshots.len();

        let mut attempt = 0u32;
        loop {
            let batch = snapshots.clone();
            let result = self
                .store
                .with_transaction(move |tx| {
                    for q in &batch {
                        match serde_json::to_vec(q) {
                            Ok(value) => tx.put(
                                Partition::LearningQvalues,
                                q.storage_key(),
                                value,
                                PutOptions::default(),
                            ),
                            Err(e) => tracing::warn!("failed to serialize q-value: {e}"),
                        }
                    }
                })
                .await;

            match result {
                Ok(()) => return Ok(count),
                Err(e) if e.is_transient() && attempt < self.config.max_persist_retries => {
                    attempt += 1;
                    let delay = Duration::from_millis(50u64 * (1u64 << attempt.min(6)));
                    tracing::warn!(attempt, "q-value flush failed, retrying: {e}");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    // Put the keys back so a later flush retries them.
                    let mut pending = self.pending.lock().await;
                    let mut restored = keys;
                    restored.extend(std::mem::take(&mut *pending));
                    *pending = restored;
                    drop(pending);
                    self.emit_persist_failed("qvalues", "batch", &e).await;
                    return Err(e);
                }
            }
        }
    }

    async fn emit_persist_failed(&self, kind: &str, key: &str, error: &MemoryError) {
        let _ = self
            .bus
            .publish(
                topics::LEARNING_PERSIST_FAILED,
                json!({ "kind": kind, "key": key, "error": error.to_string() }),
                None,
            )
            .await;
        if error.is_fatal() {
            self.store.report_fatal(error).await;
        }
    }

    /// Spawn the periodic flush daemon.
    pub fn start_flusher(self: Arc<Self>) -> DaemonHandle {
        let interval = Duration::from_millis(self.config.flush_interval_ms.max(1));
        let engine = self;
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = engine.flush().await {
                            tracing::warn!("periodic q-value flush failed: {e}");
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        // Final drain on shutdown.
                        if let Err(e) = engine.flush().await {
                            tracing::warn!("final q-value flush failed: {e}");
                        }
                        return;
                    }
                }
            }
        });

        DaemonHandle::new("learning-flusher", shutdown_tx, handle)
    }

    /// Aggregate the recent experience log into patterns.
    ///
    /// Groups experiences inside `window` by `(agent, task_type)`; groups
    /// reaching `min_support` samples are folded into a stored pattern
    /// (success = positive reward). Returns the number of patterns
    /// written.
    pub async fn mine_patterns(&self, window: Duration, min_support: u64) -> MemoryResult<usize> {
        let now = self.clock.now();
        let cutoff = now
            - chrono::Duration::milliseconds(i64::try_from(window.as_millis()).unwrap_or(i64::MAX));

        let entries = self
            .store
            .scan(Partition::LearningExperiences, None, None)
            .await?;

        let mut groups: HashMap<(AgentId, String), (u64, u64)> = HashMap::new();
        for entry in entries {
            let Ok(exp) = serde_json::from_slice::<Experience>(&entry.value) else {
                continue;
            };
            if exp.timestamp < cutoff {
                continue;
            }
            let counts = groups.entry((exp.agent_id, exp.task_type.clone())).or_default();
            if exp.reward > 0.0 {
                counts.0 += 1;
            } else {
                counts.1 += 1;
            }
        }

        let mut written = 0;
        for ((agent_id, task_type), (successes, failures)) in groups {
            if successes + failures < min_support {
                continue;
            }
            let mut pattern = match self.store.find_pattern_by_type(agent_id, &task_type).await? {
                Some(existing) => existing,
                None => Pattern::new(
                    agent_id,
                    task_type.clone(),
                    serde_json::to_vec(&json!({ "task_type": task_type }))?,
                ),
            };
            pattern.merge_counts(successes, failures, now);
            self.store.store_pattern(&pattern).await?;
            written += 1;
        }
        Ok(written)
    }

    /// Top-K patterns above the confidence threshold for one agent and
    /// task type.
    pub async fn query_hints(
        &self,
        agent_id: AgentId,
        task_type: &str,
    ) -> MemoryResult<Vec<PatternHint>> {
        let patterns = self
            .store
            .query_patterns_by_agent(agent_id, self.config.hint_confidence_threshold)
            .await?;
        Ok(patterns
            .into_iter()
            .filter(|p| p.pattern_type == task_type)
            .take(self.config.hint_limit)
            .map(|p| PatternHint {
                pattern_id: p.id,
                pattern_type: p.pattern_type.clone(),
                confidence: p.confidence,
                payload: serde_json::from_slice(&p.payload).unwrap_or(serde_json::Value::Null),
            })
            .collect())
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}

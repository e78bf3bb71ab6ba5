//! Agent runtime: the uniform worker wrapped around a handler.
//!
//! Owns the lifecycle state machine, enforces one-task-at-a-time, stamps
//! heartbeats, records one experience per invocation, and emits the
//! agent's `agent.<type>.*` events. Handler panics are contained here; a
//! panic fails the agent, a timeout only fails the task.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::domain::errors::{FleetError, FleetResult};
use crate::domain::models::{
    AgentId, AgentMetrics, AgentStatus, AgentType, Experience, FailureKind, HealthReport,
    Partition, Task, TaskOutcome,
};
use crate::domain::ports::Clock;
use crate::services::agent_registry::{AgentContext, AgentHandler};
use crate::services::event_bus::{EventBus, SubscriptionId};
use crate::services::learning_engine::LearningEngine;
use crate::services::memory_service::SwarmMemoryStore;

/// How one `execute` invocation ended, from the fleet's point of view.
#[derive(Debug, Clone)]
pub enum ExecutionOutcome {
    Completed {
        value: serde_json::Value,
        duration_ms: u64,
    },
    Failed {
        kind: FailureKind,
        message: String,
        duration_ms: u64,
    },
    TimedOut {
        duration_ms: u64,
    },
    Canceled {
        duration_ms: u64,
    },
    /// The handler panicked; the agent itself is failed.
    Panicked {
        message: String,
        duration_ms: u64,
    },
}

pub struct AgentRuntime {
    id: AgentId,
    agent_type: AgentType,
    capabilities: BTreeSet<String>,
    handler: Arc<dyn AgentHandler>,
    status: RwLock<AgentStatus>,
    /// Shared with the per-execution heartbeat ticker.
    metrics: Arc<std::sync::Mutex<AgentMetrics>>,
    bus: Arc<EventBus>,
    memory: Arc<SwarmMemoryStore>,
    learning: Arc<LearningEngine>,
    clock: Arc<dyn Clock>,
    inflight: AtomicU32,
    terminated_event_emitted: AtomicBool,
    subscriptions: tokio::sync::Mutex<Vec<SubscriptionId>>,
    idle_since: std::sync::Mutex<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl std::fmt::Debug for AgentRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRuntime")
            .field("id", &self.id)
            .field("agent_type", &self.agent_type)
            .finish_non_exhaustive()
    }
}

impl AgentRuntime {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        agent_type: AgentType,
        capabilities: BTreeSet<String>,
        handler: Arc<dyn AgentHandler>,
        bus: Arc<EventBus>,
        memory: Arc<SwarmMemoryStore>,
        learning: Arc<LearningEngine>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let now = clock.now();
        Self {
            id: AgentId::new(),
            agent_type,
            capabilities,
            handler,
            status: RwLock::new(AgentStatus::Created),
            metrics: Arc::new(std::sync::Mutex::new(AgentMetrics::default())),
            bus,
            memory,
            learning,
            clock,
            inflight: AtomicU32::new(0),
            terminated_event_emitted: AtomicBool::new(false),
            subscriptions: tokio::sync::Mutex::new(Vec::new()),
            idle_since: std::sync::Mutex::new(now),
            created_at: now,
        }
    }

    pub fn id(&self) -> AgentId {
        self.id
    }

    pub fn agent_type(&self) -> &AgentType {
        &self.agent_type
    }

    pub fn capabilities(&self) -> &BTreeSet<String> {
        &self.capabilities
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub async fn status(&self) -> AgentStatus {
        *self.status.read().await
    }

    /// When the agent last became idle; drives the pool reaper.
    pub fn idle_since(&self) -> DateTime<Utc> {
        *self.idle_since.lock().expect("idle_since lock poisoned")
    }

    async fn transition(&self, to: AgentStatus) -> FleetResult<()> {
        let mut status = self.status.write().await;
        if !status.can_transition_to(to) {
            return Err(FleetError::IllegalStateTransition {
                from: status.as_str().to_string(),
                to: to.as_str().to_string(),
            });
        }
        tracing::debug!(agent = %self.id, from = status.as_str(), to = to.as_str(), "agent transition");
        *status = to;
        Ok(())
    }

    fn heartbeat(&self) {
        self.metrics
            .lock()
            .expect("metrics lock poisoned")
            .heartbeat(self.clock.now());
    }

    fn agent_topic(&self, suffix: &str) -> String {
        format!("agent.{}.{}", self.agent_type, suffix)
    }

    /// `created → initializing → idle`: subscribe to the handler's topics
    /// and load per-agent config overrides from memory if present.
    pub async fn initialize(&self) -> FleetResult<()> {
        self.transition(AgentStatus::Initializing).await?;

        let config_key = format!("agent-config:{}", self.agent_type);
        match self.memory.get(Partition::Coordination, &config_key).await {
            Ok(Some(entry)) => {
                tracing::debug!(agent = %self.id, bytes = entry.value.len(), "loaded per-agent config");
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(agent = %self.id, "per-agent config load failed: {e}"),
        }

        let mut sub_ids = self.subscriptions.lock().await;
        for pattern in self.handler.subscriptions() {
            let handler = self.handler.clone();
            let id = self
                .bus
                .subscribe(&pattern, move |event| {
                    let handler = handler.clone();
                    async move { handler.on_event(event).await }
                })
                .await?;
            sub_ids.push(id);
        }
        drop(sub_ids);

        self.transition(AgentStatus::Idle).await?;
        self.heartbeat();
        Ok(())
    }

    /// Execute one task. Allowed only in `idle`.
    pub async fn execute(
        &self,
        task: &Task,
        cancel: CancellationToken,
    ) -> FleetResult<ExecutionOutcome> {
        self.transition(AgentStatus::Busy).await?;
        self.inflight.store(1, Ordering::SeqCst);
        self.heartbeat();

        let _ = self
            .bus
            .publish(
                &self.agent_topic("task.started"),
                json!({ "task_id": task.id.to_string(), "task_type": task.task_type }),
                Some(self.id),
            )
            .await;

        let started = self.clock.monotonic_ms();
        let ctx = AgentContext {
            agent_id: self.id,
            agent_type: self.agent_type.clone(),
            memory: self.memory.clone(),
            bus: self.bus.clone(),
            cancel: cancel.clone(),
        };

        // The handler runs on its own spawned task so a panic surfaces as
        // a JoinError instead of tearing down the executor, and so an
        // abandoned handler cannot block the bus worker threads.
        let handler = self.handler.clone();
        let owned_task = task.clone();
        let mut invocation = tokio::spawn(async move { handler.handle(owned_task, ctx).await });

        // Progress heartbeats while the handler runs.
        let beat_metrics = self.metrics.clone();
        let beat_clock = self.clock.clone();
        let beat_cancel = CancellationToken::new();
        let beat_guard = beat_cancel.clone();
        let beater = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(5));
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        beat_metrics
                            .lock()
                            .expect("metrics lock poisoned")
                            .heartbeat(beat_clock.now());
                    }
                    () = beat_guard.cancelled() => return,
                }
            }
        });

        let timeout = Duration::from_millis(task.timeout_ms);
        let raw_outcome = tokio::select! {
            // Once the token fires, cancellation wins even if the handler
            // races to a result.
            biased;
            () = cancel.cancelled() => {
                // Backstop: cooperative handlers return on their own; this
                // reclaims the agent from uncooperative ones.
                invocation.abort();
                RawOutcome::Canceled
            }
            result = tokio::time::timeout(timeout, &mut invocation) => match result {
                Ok(Ok(outcome)) => RawOutcome::Handled(outcome),
                Ok(Err(join_err)) if join_err.is_panic() => {
                    RawOutcome::Panicked(format!("{join_err}"))
                }
                Ok(Err(_)) => RawOutcome::Canceled,
                Err(_) => {
                    invocation.abort();
                    RawOutcome::TimedOut
                }
            },
        };
        beat_cancel.cancel();
        let _ = beater.await;

        let duration_ms = self.clock.monotonic_ms().saturating_sub(started);
        let outcome = self
            .settle(task, raw_outcome, duration_ms)
            .await;
        self.inflight.store(0, Ordering::SeqCst);
        self.heartbeat();
        *self.idle_since.lock().expect("idle_since lock poisoned") = self.clock.now();
        Ok(outcome)
    }

    async fn settle(
        &self,
        task: &Task,
        raw: RawOutcome,
        duration_ms: u64,
    ) -> ExecutionOutcome {
        let (outcome, success, status_event) = match raw {
            RawOutcome::Handled(TaskOutcome::Success(value)) => (
                ExecutionOutcome::Completed { value, duration_ms },
                true,
                Some(("task.completed", "completed".to_string())),
            ),
            RawOutcome::Handled(TaskOutcome::Failure { kind, message }) => (
                ExecutionOutcome::Failed {
                    kind,
                    message: message.clone(),
                    duration_ms,
                },
                false,
                Some(("task.failed", message)),
            ),
            RawOutcome::TimedOut => (
                ExecutionOutcome::TimedOut { duration_ms },
                false,
                Some(("task.failed", format!("attempt exceeded {}ms", task.timeout_ms))),
            ),
            RawOutcome::Canceled => (ExecutionOutcome::Canceled { duration_ms }, false, None),
            RawOutcome::Panicked(message) => (
                ExecutionOutcome::Panicked {
                    message: message.clone(),
                    duration_ms,
                },
                false,
                Some(("task.failed", message)),
            ),
        };

        {
            let mut metrics = self.metrics.lock().expect("metrics lock poisoned");
            if success {
                metrics.record_success(duration_ms);
            } else {
                metrics.record_failure(duration_ms);
            }
        }

        if let Some((suffix, detail)) = status_event {
            let _ = self
                .bus
                .publish(
                    &self.agent_topic(suffix),
                    json!({
                        "task_id": task.id.to_string(),
                        "detail": detail,
                        "duration_ms": duration_ms,
                    }),
                    Some(self.id),
                )
                .await;
        }

        // One experience per invocation; cancellation is not an outcome
        // the learner should weigh.
        if !matches!(outcome, ExecutionOutcome::Canceled { .. }) {
            let reward = if success { 1.0 } else { -1.0 };
            let experience = Experience::new(
                self.id,
                task.task_type.clone(),
                task.fingerprint(),
                self.agent_type.as_str(),
                reward,
                json!({ "task_id": task.id.to_string(), "success": success }),
            );
            if let Err(e) = self.learning.record_experience(&experience).await {
                tracing::warn!(agent = %self.id, "experience not persisted: {e}");
            }
        }

        // A panic fails the agent itself; anything else returns it to idle.
        let next = if matches!(outcome, ExecutionOutcome::Panicked { .. }) {
            AgentStatus::Failed
        } else {
            AgentStatus::Idle
        };
        if let Err(e) = self.transition(next).await {
            tracing::warn!(agent = %self.id, "post-task transition failed: {e}");
        }

        outcome
    }

    /// `idle → paused`: reject new tasks but keep subscriptions.
    pub async fn pause(&self) -> FleetResult<()> {
        self.transition(AgentStatus::Paused).await
    }

    /// `paused → idle`.
    pub async fn resume(&self) -> FleetResult<()> {
        let status = self.status().await;
        if status != AgentStatus::Paused {
            return Err(FleetError::IllegalStateTransition {
                from: status.as_str().to_string(),
                to: AgentStatus::Idle.as_str().to_string(),
            });
        }
        self.transition(AgentStatus::Idle).await
    }

    /// Mark the agent failed (watchdog path). No-op once terminated.
    pub async fn force_fail(&self) {
        let mut status = self.status.write().await;
        if !status.is_terminal() {
            *status = AgentStatus::Failed;
        }
    }

    /// Terminate from any state. Idempotent; `agent.<type>.terminated` is
    /// emitted exactly once.
    pub async fn terminate(&self) -> FleetResult<()> {
        {
            let mut status = self.status.write().await;
            match *status {
                AgentStatus::Terminated => return Ok(()),
                AgentStatus::Terminating => {}
                _ => *status = AgentStatus::Terminating,
            }
        }

        let subs = std::mem::take(&mut *self.subscriptions.lock().await);
        for id in subs {
            let _ = self.bus.unsubscribe(id).await;
        }

        {
            let mut status = self.status.write().await;
            *status = AgentStatus::Terminated;
        }

        if !self.terminated_event_emitted.swap(true, Ordering::SeqCst) {
            let _ = self
                .bus
                .publish(
                    &self.agent_topic("terminated"),
                    json!({ "agent_id": self.id.to_string() }),
                    Some(self.id),
                )
                .await;
        }
        Ok(())
    }

    pub async fn health_check(&self) -> HealthReport {
        self.heartbeat();
        HealthReport {
            agent_id: self.id,
            agent_type: self.agent_type.clone(),
            status: self.status().await,
            last_heartbeat_at: self
                .metrics
                .lock()
                .expect("metrics lock poisoned")
                .last_heartbeat_at,
            inflight_tasks: self.inflight.load(Ordering::SeqCst),
        }
    }

    /// Heartbeat age check without refreshing it; watchdog path.
    pub fn last_heartbeat_at(&self) -> Option<DateTime<Utc>> {
        self.metrics
            .lock()
            .expect("metrics lock poisoned")
            .last_heartbeat_at
    }

    pub fn metrics_snapshot(&self) -> AgentMetrics {
        self.metrics.lock().expect("metrics lock poisoned").clone()
    }
}

enum RawOutcome {
    Handled(TaskOutcome),
    TimedOut,
    Canceled,
    Panicked(String),
}

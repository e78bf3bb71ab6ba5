//! Fleet manager: process-wide composition root and supervisor.
//!
//! Owns every shared component, spawns and terminates agents, routes
//! submitted tasks through the queue/router/pool pipeline bounded by
//! `max_concurrent_agents`, watches agent heartbeats, and shuts the
//! whole fleet down in a deterministic order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::{Mutex, Notify, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::adapters::memory::MockMemoryBackend;
use crate::adapters::sqlite::{initialize_database, SqliteEventSink, SqliteMemoryBackend};
use crate::domain::errors::{FleetError, FleetResult};
use crate::domain::errors::MemoryError;
use crate::domain::models::{
    topics, AgentId, AgentSpec, BackendKind, FleetConfig, HealthReport, Partition, PutOptions,
    Task, TaskId, TaskResult, TaskStatus,
};
use crate::domain::ports::{Clock, MemoryBackend, SystemClock};
use crate::services::agent_factory::{AgentDirectory, AgentFactory};
use crate::services::agent_pool::AgentPool;
use crate::services::agent_registry::{register_builtin_agents, AgentRegistry};
use crate::services::agent_runtime::ExecutionOutcome;
use crate::services::event_bus::EventBus;
use crate::services::learning_engine::LearningEngine;
use crate::services::memory_service::SwarmMemoryStore;
use crate::services::metrics::MetricsRegistry;
use crate::services::router::Router;
use crate::services::task_queue::{CancelOutcome, RetryDisposition, TaskQueue, TaskStatusView};
use crate::services::DaemonHandle;

/// Lifecycle of the fleet process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FleetStatus {
    Created,
    Running,
    ShuttingDown,
    Stopped,
}

/// Returned by `shutdown`: the final state of every known task.
#[derive(Debug, Clone)]
pub struct ShutdownSummary {
    pub graceful: bool,
    pub drained: bool,
    pub tasks: Vec<(TaskId, TaskStatus)>,
}

pub struct FleetManager {
    config: FleetConfig,
    clock: Arc<dyn Clock>,
    bus: Arc<EventBus>,
    memory: Arc<SwarmMemoryStore>,
    learning: Arc<LearningEngine>,
    registry: Arc<AgentRegistry>,
    pool: Arc<AgentPool>,
    queue: Arc<TaskQueue>,
    router: Arc<Router>,
    metrics: Arc<MetricsRegistry>,
    directory: AgentDirectory,
    status: RwLock<FleetStatus>,
    daemons: Mutex<Vec<DaemonHandle>>,
    dispatch_semaphore: Arc<Semaphore>,
    work_notify: Arc<Notify>,
    shutdown_token: CancellationToken,
    inflight_executions: Arc<AtomicUsize>,
    /// task -> executing agent, for the watchdog and cancel grace path.
    running: Mutex<HashMap<TaskId, AgentId>>,
    db_pool: Option<sqlx::SqlitePool>,
    /// Self-handle for tasks spawned off `&self` methods.
    me: std::sync::Weak<FleetManager>,
}

impl std::fmt::Debug for FleetManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FleetManager").finish_non_exhaustive()
    }
}

impl FleetManager {
    /// Construct and wire every component from validated configuration.
    pub async fn init(config: FleetConfig) -> FleetResult<Arc<Self>> {
        Self::init_with_clock(config, Arc::new(SystemClock::new())).await
    }

    /// Init with an injected clock; the deterministic-test entry point.
    pub async fn init_with_clock(
        config: FleetConfig,
        clock: Arc<dyn Clock>,
    ) -> FleetResult<Arc<Self>> {
        Self::validate_adapter_config(&config)?;

        let (backend, db_pool): (Arc<dyn MemoryBackend>, Option<sqlx::SqlitePool>) =
            match config.adapter.kind {
                BackendKind::Real => {
                    let path = config
                        .adapter
                        .db_path
                        .as_deref()
                        .expect("validated: db_path present");
                    let pool = initialize_database(
                        std::path::Path::new(path),
                        config.adapter.max_connections,
                    )
                    .await
                    .map_err(|e| FleetError::Configuration {
                        field: "adapter.db_path".to_string(),
                        expected: format!("an openable SQLite database ({e})"),
                    })?;
                    (Arc::new(SqliteMemoryBackend::new(pool.clone())), Some(pool))
                }
                BackendKind::Mock => (Arc::new(MockMemoryBackend::new()), None),
            };

        let mut bus = EventBus::new(config.event_bus.clone(), clock.clone());
        if config.event_bus.persist_events {
            let pool = db_pool.as_ref().expect("validated: persistence needs real");
            bus = bus.with_sink(Arc::new(SqliteEventSink::new(pool.clone())));
        }
        let bus = Arc::new(bus);
        bus.initialize_sequences_from_sink().await;

        let memory = Arc::new(
            SwarmMemoryStore::new(
                backend,
                config.adapter.kind,
                config.memory.clone(),
                clock.clone(),
            )?
            .with_event_bus(bus.clone()),
        );

        let learning = Arc::new(LearningEngine::new(
            memory.clone(),
            bus.clone(),
            clock.clone(),
            config.learning.clone(),
        ));
        if let Err(e) = learning.load().await {
            if config.adapter.fail_fast {
                return Err(e.into());
            }
            tracing::warn!("q-value recovery failed, starting cold: {e}");
        }

        let registry = Arc::new(AgentRegistry::new());
        register_builtin_agents(&registry);

        let factory = Arc::new(AgentFactory::new(
            registry.clone(),
            bus.clone(),
            memory.clone(),
            learning.clone(),
            clock.clone(),
        ));
        let directory = factory.directory();
        let pool = Arc::new(AgentPool::new(
            factory,
            config.pool.clone(),
            clock.clone(),
        ));
        let queue = Arc::new(TaskQueue::new(clock.clone()));
        let router = Arc::new(Router::new(
            registry.clone(),
            learning.clone(),
            clock.clone(),
            config.router.clone(),
            config.fleet.topology,
        ));

        let max_concurrent = config.fleet.max_concurrent_agents.max(1);
        Ok(Arc::new_cyclic(|me| Self {
            config,
            clock,
            bus,
            memory,
            learning,
            registry,
            pool,
            queue,
            router,
            metrics: Arc::new(MetricsRegistry::new()),
            directory,
            status: RwLock::new(FleetStatus::Created),
            daemons: Mutex::new(Vec::new()),
            dispatch_semaphore: Arc::new(Semaphore::new(max_concurrent)),
            work_notify: Arc::new(Notify::new()),
            shutdown_token: CancellationToken::new(),
            inflight_executions: Arc::new(AtomicUsize::new(0)),
            running: Mutex::new(HashMap::new()),
            db_pool,
            me: me.clone(),
        }))
    }

    fn arc(&self) -> Arc<Self> {
        self.me.upgrade().expect("fleet manager is alive")
    }

    fn validate_adapter_config(config: &FleetConfig) -> FleetResult<()> {
        if config.adapter.kind == BackendKind::Real
            && config.adapter.db_path.as_deref().unwrap_or("").is_empty()
        {
            return Err(FleetError::Configuration {
                field: "adapter.db_path".to_string(),
                expected: "a database file path when adapter.type = real".to_string(),
            });
        }
        if config.event_bus.persist_events && config.adapter.kind != BackendKind::Real {
            return Err(FleetError::Configuration {
                field: "event_bus.persist_events".to_string(),
                expected: "adapter.type = real (mock backends cannot persist events)".to_string(),
            });
        }
        Ok(())
    }

    /// Warm up pools and spawn the background daemons.
    pub async fn start(&self) -> FleetResult<()> {
        {
            let mut status = self.status.write().await;
            if *status != FleetStatus::Created {
                return Err(FleetError::IllegalStateTransition {
                    from: format!("{:?}", *status).to_lowercase(),
                    to: "running".to_string(),
                });
            }
            *status = FleetStatus::Running;
        }

        let warmups: Vec<(String, usize)> = self
            .config
            .pool
            .per_type
            .iter()
            .filter(|(_, p)| p.warmup_count > 0)
            .map(|(tag, p)| (tag.clone(), p.warmup_count))
            .collect();
        for (agent_type, count) in warmups {
            let created = self.pool.warmup(&agent_type, count).await?;
            tracing::info!(agent_type, created, "warmed up agent pool");
        }

        let mut daemons = self.daemons.lock().await;
        daemons.push(self.memory.clone().start_gc());
        daemons.push(self.learning.clone().start_flusher());
        daemons.push(self.pool.clone().start_reaper());
        daemons.push(self.start_watchdog());
        daemons.push(self.start_dispatcher());
        drop(daemons);

        // A persistent storage failure is unrecoverable: stop everything.
        let fatal_fleet = self.arc();
        self.bus
            .subscribe(topics::FLEET_MEMORY_FATAL, move |event| {
                let fleet = fatal_fleet.clone();
                async move {
                    tracing::error!(payload = %event.payload, "fatal memory backend failure");
                    // Detached so the bus worker is not blocked on its own
                    // shutdown.
                    tokio::spawn(async move {
                        let _ = fleet.shutdown(false, Duration::ZERO).await;
                    });
                }
            })
            .await?;

        let _ = self.bus.publish(topics::FLEET_STARTED, json!({}), None).await;
        tracing::info!("fleet started");
        Ok(())
    }

    /// Access the registry to add agent types before `start`.
    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn memory(&self) -> &Arc<SwarmMemoryStore> {
        &self.memory
    }

    pub fn learning(&self) -> &Arc<LearningEngine> {
        &self.learning
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    pub fn pool(&self) -> &Arc<AgentPool> {
        &self.pool
    }

    pub async fn status(&self) -> FleetStatus {
        *self.status.read().await
    }

    /// Spawn a standalone agent. Config overrides in the spec are staged
    /// in the coordination partition, where agent initialization picks
    /// them up.
    pub async fn spawn(&self, spec: impl Into<AgentSpec>) -> FleetResult<AgentId> {
        let spec = spec.into();
        if self.status().await != FleetStatus::Running {
            return Err(FleetError::Shutdown);
        }

        if !spec.config.is_null() {
            let key = format!("agent-config:{}", spec.agent_type);
            let value = serde_json::to_vec(&spec.config).map_err(MemoryError::from)?;
            self.memory
                .put(Partition::Coordination, &key, value, PutOptions::default())
                .await?;
        }

        // Spawns go through the pool's factory so the agent lands in the
        // shared directory.
        let agent_type = spec.agent_type.as_str();
        let created = self.pool.warmup(agent_type, 1).await?;
        if created == 0 {
            return Err(FleetError::PoolExhausted {
                agent_type: agent_type.to_string(),
            });
        }
        // Newest directory entry of that type is the one just created.
        let directory = self.directory.read().await;
        directory
            .values()
            .filter(|a| a.agent_type() == &spec.agent_type)
            .max_by_key(|a| a.created_at())
            .map(|a| a.id())
            .ok_or_else(|| FleetError::AgentNotFound(agent_type.to_string()))
    }

    /// Enqueue a task; returns immediately.
    pub async fn submit(&self, task: Task) -> FleetResult<TaskId> {
        if self.status().await != FleetStatus::Running {
            return Err(FleetError::Shutdown);
        }
        let task_id = self.queue.submit(task).await?;
        self.metrics.counter("tasks.submitted").inc();
        let _ = self
            .bus
            .publish(
                topics::TASK_SUBMITTED,
                json!({ "task_id": task_id.to_string() }),
                None,
            )
            .await;
        self.work_notify.notify_one();
        Ok(task_id)
    }

    /// Wait for a task to reach a terminal state and return its result.
    pub async fn await_task(
        &self,
        task_id: TaskId,
        timeout: Option<Duration>,
    ) -> FleetResult<TaskResult> {
        let mut rx = self
            .queue
            .subscribe(task_id)
            .await
            .ok_or(FleetError::TaskNotFound(task_id.0))?;

        let wait = rx.wait_for(TaskStatus::is_terminal);
        let status = match timeout {
            Some(limit) => match tokio::time::timeout(limit, wait).await {
                Ok(result) => result,
                Err(_) => {
                    return Err(FleetError::TaskTimeout {
                        task_id: task_id.0,
                        timeout_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                    })
                }
            },
            None => wait.await,
        }
        .map(|s| *s)
        .map_err(|_| FleetError::TaskNotFound(task_id.0))?;

        self.queue
            .result_of(task_id)
            .await
            .ok_or(FleetError::TaskNotFound(task_id.0))
            .map(|mut result| {
                result.status = status;
                result
            })
    }

    pub async fn task_status(&self, task_id: TaskId) -> Option<TaskStatusView> {
        self.queue.status_view(task_id).await
    }

    /// Cancel a task. Running tasks get their token signaled and a grace
    /// window before the agent is declared failed.
    pub async fn cancel(&self, task_id: TaskId) -> FleetResult<()> {
        match self.queue.cancel(task_id).await? {
            CancelOutcome::AlreadyTerminal => Ok(()),
            CancelOutcome::Canceled => {
                self.emit_task_canceled(task_id).await;
                Ok(())
            }
            CancelOutcome::Signaled => {
                let fleet = self.arc();
                let grace =
                    Duration::from_millis(self.config.watchdog.cancellation_grace_ms.max(1));
                tokio::spawn(async move {
                    tokio::time::sleep(grace).await;
                    let still_running = fleet
                        .queue
                        .status_view(task_id)
                        .await
                        .is_some_and(|v| !v.status.is_terminal());
                    if still_running {
                        tracing::warn!(
                            task = %task_id,
                            "cancellation grace elapsed; failing unresponsive agent"
                        );
                        if let Some(agent_id) = fleet.running.lock().await.remove(&task_id) {
                            fleet.fail_agent(agent_id, "unresponsive to cancellation").await;
                        }
                        let _ = fleet.queue.finish_canceled(task_id).await;
                        fleet.emit_task_canceled(task_id).await;
                    }
                });
                Ok(())
            }
        }
    }

    async fn emit_task_canceled(&self, task_id: TaskId) {
        self.metrics.counter("tasks.canceled").inc();
        let _ = self
            .bus
            .publish(
                topics::TASK_CANCELED,
                json!({ "task_id": task_id.to_string() }),
                None,
            )
            .await;
    }

    /// Aggregate health across every known agent.
    pub async fn health_report(&self) -> HashMap<AgentId, HealthReport> {
        let agents: Vec<_> = self.directory.read().await.values().cloned().collect();
        let mut report = HashMap::with_capacity(agents.len());
        for agent in agents {
            report.insert(agent.id(), agent.health_check().await);
        }
        report
    }

    // ---- dispatch pipeline ----

    fn start_dispatcher(&self) -> DaemonHandle {
        let fleet = self.arc();
        let (shutdown_tx, mut shutdown_rx) = tokio::sync::mpsc::channel::<()>(1);

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = fleet.shutdown_token.cancelled() => return,
                    _ = shutdown_rx.recv() => return,
                    () = fleet.work_notify.notified() => {}
                    // Retry backoffs expire on wall time; poll for them.
                    () = tokio::time::sleep(Duration::from_millis(50)) => {}
                }
                fleet.drain_ready().await;
            }
        });

        DaemonHandle::new("dispatcher", shutdown_tx, handle)
    }

    async fn drain_ready(&self) {
        loop {
            let Ok(permit) = self.dispatch_semaphore.clone().try_acquire_owned() else {
                return;
            };
            let Some(task) = self.queue.pop_ready().await else {
                drop(permit);
                return;
            };
            let fleet = self.arc();
            self.inflight_executions.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                fleet.execute_task(task).await;
                drop(permit);
                fleet.inflight_executions.fetch_sub(1, Ordering::SeqCst);
                fleet.work_notify.notify_one();
            });
        }
    }

    async fn execute_task(&self, task: Task) {
        let task_id = task.id;
        let fingerprint = task.fingerprint();

        let agent_type = match self.router.route(&task).await {
            Ok(agent_type) => agent_type,
            Err(FleetError::CapabilityUnmet { missing, .. }) => {
                let reason = format!("no agent type satisfies capabilities {missing:?}");
                let _ = self
                    .queue
                    .finish_failure(task_id, TaskStatus::Failed, &reason)
                    .await;
                self.emit_task_failed(task_id, &reason).await;
                return;
            }
            Err(e) => {
                let _ = self
                    .queue
                    .finish_failure(task_id, TaskStatus::Failed, e.to_string())
                    .await;
                self.emit_task_failed(task_id, &e.to_string()).await;
                return;
            }
        };

        let Some(cancel) = self.queue.cancel_token(task_id).await else {
            return;
        };
        if cancel.is_cancelled() {
            let _ = self.queue.finish_canceled(task_id).await;
            self.emit_task_canceled(task_id).await;
            return;
        }

        let agent = match self.pool.acquire(&agent_type).await {
            Ok(agent) => agent,
            Err(FleetError::PoolExhausted { .. }) => {
                self.metrics.counter("pool.exhausted").inc();
                let _ = self
                    .queue
                    .requeue_assigned(task_id, Duration::from_millis(50))
                    .await;
                return;
            }
            Err(e) => {
                let _ = self
                    .queue
                    .finish_failure(task_id, TaskStatus::Failed, e.to_string())
                    .await;
                self.emit_task_failed(task_id, &e.to_string()).await;
                return;
            }
        };

        if self.queue.mark_running(task_id).await.is_err() {
            // Canceled between assignment and execution.
            self.pool.release(agent).await;
            return;
        }
        self.router.note_dispatch(&agent_type);
        self.running.lock().await.insert(task_id, agent.id());
        self.metrics.gauge("tasks.running").add(1);
        let _ = self
            .bus
            .publish(
                topics::TASK_STARTED,
                json!({ "task_id": task_id.to_string(), "agent_type": agent_type }),
                None,
            )
            .await;

        let execution = agent.execute(&task, cancel).await;

        self.running.lock().await.remove(&task_id);
        self.metrics.gauge("tasks.running").add(-1);
        self.router.note_done(&agent_type);

        match execution {
            Ok(outcome) => {
                self.settle_outcome(&task, &fingerprint, &agent_type, outcome)
                    .await;
            }
            Err(e) => {
                // The agent refused the task (illegal state); try again on
                // another agent without consuming a retry.
                tracing::warn!(task = %task_id, "agent rejected execution: {e}");
                let _ = self
                    .queue
                    .requeue_assigned(task_id, Duration::from_millis(10))
                    .await;
            }
        }
        self.pool.release(agent).await;
    }

    async fn settle_outcome(
        &self,
        task: &Task,
        fingerprint: &str,
        agent_type: &str,
        outcome: ExecutionOutcome,
    ) {
        let task_id = task.id;
        match outcome {
            ExecutionOutcome::Completed { value, duration_ms } => {
                let _ = self.queue.finish_success(task_id, value).await;
                self.router.record_outcome(fingerprint, agent_type, true);
                self.learning
                    .update_q_value(fingerprint, agent_type, 1.0, None)
                    .await;
                self.metrics.counter("tasks.completed").inc();
                self.metrics
                    .histogram("task.duration_ms")
                    .observe(duration_ms);
                let _ = self
                    .bus
                    .publish(
                        topics::TASK_COMPLETED,
                        json!({ "task_id": task_id.to_string(), "duration_ms": duration_ms }),
                        None,
                    )
                    .await;
            }
            ExecutionOutcome::Failed { kind, message, .. } => {
                self.router.record_outcome(fingerprint, agent_type, false);
                self.learning
                    .update_q_value(fingerprint, agent_type, -1.0, None)
                    .await;
                self.retry_or_fail(task_id, kind.is_transient(), TaskStatus::Failed, &message)
                    .await;
            }
            ExecutionOutcome::TimedOut { .. } => {
                self.router.record_outcome(fingerprint, agent_type, false);
                self.learning
                    .update_q_value(fingerprint, agent_type, -1.0, None)
                    .await;
                let message = format!("attempt exceeded {}ms", task.timeout_ms);
                self.retry_or_fail(task_id, true, TaskStatus::TimedOut, &message)
                    .await;
            }
            ExecutionOutcome::Canceled { .. } => {
                let _ = self.queue.finish_canceled(task_id).await;
                self.emit_task_canceled(task_id).await;
            }
            ExecutionOutcome::Panicked { message, .. } => {
                self.router.record_outcome(fingerprint, agent_type, false);
                self.learning
                    .update_q_value(fingerprint, agent_type, -1.0, None)
                    .await;
                let _ = self
                    .bus
                    .publish(
                        topics::FLEET_AGENT_FAILED,
                        json!({ "agent_type": agent_type, "cause": message }),
                        None,
                    )
                    .await;
                // One replacement attempt keeps the reservoir warm.
                let pool = self.pool.clone();
                let replacement_type = agent_type.to_string();
                tokio::spawn(async move {
                    let _ = pool.warmup(&replacement_type, 1).await;
                });
                self.retry_or_fail(task_id, true, TaskStatus::Failed, &message)
                    .await;
            }
        }
    }

    async fn retry_or_fail(
        &self,
        task_id: TaskId,
        retryable: bool,
        terminal_status: TaskStatus,
        message: &str,
    ) {
        match self.queue.fail_attempt(task_id, retryable).await {
            Ok(RetryDisposition::Retry { attempt, delay_ms }) => {
                self.metrics.counter("tasks.retried").inc();
                let _ = self
                    .bus
                    .publish(
                        topics::TASK_RETRYING,
                        json!({
                            "task_id": task_id.to_string(),
                            "attempt": attempt,
                            "delay_ms": delay_ms,
                        }),
                        None,
                    )
                    .await;
            }
            Ok(RetryDisposition::Exhausted { .. }) => {
                let _ = self
                    .queue
                    .finish_failure(task_id, terminal_status, message)
                    .await;
                self.emit_task_failed(task_id, message).await;
            }
            Err(e) => {
                tracing::warn!(task = %task_id, "retry bookkeeping failed: {e}");
            }
        }
    }

    async fn emit_task_failed(&self, task_id: TaskId, reason: &str) {
        self.metrics.counter("tasks.failed").inc();
        let _ = self
            .bus
            .publish(
                topics::TASK_FAILED,
                json!({ "task_id": task_id.to_string(), "reason": reason }),
                None,
            )
            .await;
    }

    async fn fail_agent(&self, agent_id: AgentId, cause: &str) {
        let agent = self.directory.read().await.get(&agent_id).cloned();
        if let Some(agent) = agent {
            agent.force_fail().await;
            let _ = self
                .bus
                .publish(
                    topics::FLEET_AGENT_FAILED,
                    json!({ "agent_id": agent_id.to_string(), "cause": cause }),
                    None,
                )
                .await;
        }
    }

    // ---- watchdog ----

    fn start_watchdog(&self) -> DaemonHandle {
        let fleet = self.arc();
        let interval = Duration::from_millis(self.config.watchdog.heartbeat_interval_ms.max(1));
        let (shutdown_tx, mut shutdown_rx) = tokio::sync::mpsc::channel::<()>(1);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => fleet.watchdog_pass().await,
                    _ = shutdown_rx.recv() => return,
                }
            }
        });

        DaemonHandle::new("watchdog", shutdown_tx, handle)
    }

    async fn watchdog_pass(&self) {
        let now = self.clock.now();
        let allowed = self.config.watchdog.heartbeat_interval_ms
            * u64::from(self.config.watchdog.misses_allowed.max(1));
        let cutoff =
            now - chrono::Duration::milliseconds(i64::try_from(allowed).unwrap_or(i64::MAX));

        let agents: Vec<_> = self.directory.read().await.values().cloned().collect();
        for agent in agents {
            let busy = agent.status().await == crate::domain::models::AgentStatus::Busy;
            if !busy {
                continue;
            }
            let stale = agent.last_heartbeat_at().is_none_or(|t| t < cutoff);
            if !stale {
                continue;
            }

            tracing::warn!(agent = %agent.id(), "missed heartbeats; failing agent");
            self.fail_agent(agent.id(), "missed heartbeats").await;

            // Re-enqueue the in-flight task if it still has retry budget.
            let task_id = {
                let running = self.running.lock().await;
                running
                    .iter()
                    .find(|(_, aid)| **aid == agent.id())
                    .map(|(tid, _)| *tid)
            };
            if let Some(task_id) = task_id {
                self.running.lock().await.remove(&task_id);
                self.retry_or_fail(task_id, true, TaskStatus::Failed, "agent missed heartbeats")
                    .await;
            }

            // One replacement spawn attempt.
            let pool = self.pool.clone();
            let agent_type = agent.agent_type().as_str().to_string();
            tokio::spawn(async move {
                let _ = pool.warmup(&agent_type, 1).await;
            });
        }
    }

    // ---- shutdown ----

    /// Stop the fleet. Graceful shutdown drains in-flight work within
    /// `timeout`; forced shutdown cancels everything immediately.
    /// Idempotent.
    pub async fn shutdown(
        &self,
        graceful: bool,
        timeout: Duration,
    ) -> FleetResult<ShutdownSummary> {
        {
            let mut status = self.status.write().await;
            match *status {
                FleetStatus::Stopped | FleetStatus::ShuttingDown => {
                    return Ok(ShutdownSummary {
                        graceful,
                        drained: true,
                        tasks: self.queue.snapshot().await,
                    });
                }
                _ => *status = FleetStatus::ShuttingDown,
            }
        }
        tracing::info!(graceful, "fleet shutting down");

        let mut drained = true;
        if graceful {
            let deadline = tokio::time::Instant::now() + timeout;
            loop {
                let idle = self.queue.inflight_count().await == 0
                    && self.inflight_executions.load(Ordering::SeqCst) == 0;
                if idle {
                    break;
                }
                if tokio::time::Instant::now() >= deadline {
                    drained = false;
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        } else {
            drained = false;
        }

        if !drained {
            self.queue.cancel_all().await;
        }
        self.shutdown_token.cancel();

        let daemons = std::mem::take(&mut *self.daemons.lock().await);
        for daemon in daemons {
            daemon.stop().await;
        }

        if let Err(e) = self.learning.flush().await {
            tracing::warn!("final learning flush failed: {e}");
        }

        self.pool.shutdown().await;
        let agents: Vec<_> = self.directory.read().await.values().cloned().collect();
        for agent in agents {
            let _ = agent.terminate().await;
        }

        let _ = self.bus.publish(topics::FLEET_STOPPED, json!({}), None).await;
        self.bus.shutdown().await;

        if let Some(pool) = &self.db_pool {
            pool.close().await;
        }

        *self.status.write().await = FleetStatus::Stopped;
        tracing::info!("fleet stopped");
        Ok(ShutdownSummary {
            graceful,
            drained,
            tasks: self.queue.snapshot().await,
        })
    }
}

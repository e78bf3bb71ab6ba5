//! Agent pool: a pre-initialized reservoir per agent type.
//!
//! Warm acquisition pops an idle agent; the cold path constructs through
//! the factory while respecting `max_size`. A background reaper
//! terminates agents idle beyond their TTL down to `min_size`.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex, Notify};

use crate::domain::errors::{FleetError, FleetResult};
use crate::domain::models::config::PoolConfig;
use crate::domain::models::AgentStatus;
use crate::domain::ports::Clock;
use crate::services::agent_factory::AgentFactory;
use crate::services::agent_runtime::AgentRuntime;
use crate::services::DaemonHandle;

#[derive(Default)]
struct TypePool {
    idle: VecDeque<Arc<AgentRuntime>>,
    /// Idle + checked-out agents of this type.
    total: usize,
}

/// Point-in-time pool occupancy for one agent type.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct PoolStats {
    pub idle: usize,
    pub total: usize,
}

pub struct AgentPool {
    factory: Arc<AgentFactory>,
    config: PoolConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<HashMap<String, TypePool>>,
    released: Notify,
}

enum AcquireStep {
    Warm(Arc<AgentRuntime>),
    Cold,
    Wait,
}

impl AgentPool {
    pub fn new(factory: Arc<AgentFactory>, config: PoolConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            factory,
            config,
            clock,
            state: Mutex::new(HashMap::new()),
            released: Notify::new(),
        }
    }

    /// Acquire an agent, warm if possible.
    ///
    /// Blocks for at most `acquire_timeout_ms` when the pool is saturated,
    /// then fails with `PoolExhausted`. Never busy-spins: waiting parks on
    /// a release notification.
    pub async fn acquire(&self, agent_type: &str) -> FleetResult<Arc<AgentRuntime>> {
        let policy = self.config.policy_for(agent_type);
        let deadline = tokio::time::Instant::now()
            + Duration::from_millis(self.config.acquire_timeout_ms);

        loop {
            let step = {
                let mut state = self.state.lock().await;
                let pool = state.entry(agent_type.to_string()).or_default();
                let mut step = None;
                while step.is_none() {
                    match pool.idle.pop_front() {
                        Some(agent) => {
                            if agent.status().await == AgentStatus::Idle {
                                step = Some(AcquireStep::Warm(agent));
                            } else {
                                // Reaped out-of-band or failed while idle.
                                pool.total = pool.total.saturating_sub(1);
                            }
                        }
                        None => {
                            step = Some(if pool.total < policy.max_size {
                                pool.total += 1;
                                AcquireStep::Cold
                            } else {
                                AcquireStep::Wait
                            });
                        }
                    }
                }
                step.expect("acquire step decided")
            };

            match step {
                AcquireStep::Warm(agent) => return Ok(agent),
                AcquireStep::Cold => match self.factory.create(agent_type).await {
                    Ok(agent) => {
                        // A cold miss grows the reservoir by the configured
                        // increment, not just the one agent handed out.
                        if policy.growth_increment > 1 {
                            let _ = self
                                .warmup(agent_type, policy.growth_increment - 1)
                                .await;
                        }
                        return Ok(agent);
                    }
                    Err(e) => {
                        let mut state = self.state.lock().await;
                        if let Some(pool) = state.get_mut(agent_type) {
                            pool.total = pool.total.saturating_sub(1);
                        }
                        drop(state);
                        self.released.notify_waiters();
                        return Err(e);
                    }
                },
                AcquireStep::Wait => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(FleetError::PoolExhausted {
                            agent_type: agent_type.to_string(),
                        });
                    }
                    tokio::select! {
                        () = self.released.notified() => {}
                        () = tokio::time::sleep_until(deadline) => {
                            return Err(FleetError::PoolExhausted {
                                agent_type: agent_type.to_string(),
                            });
                        }
                    }
                }
            }
        }
    }

    /// Return an agent after use. Healthy agents go back on the idle
    /// deque; dead ones are terminated and their slot freed.
    pub async fn release(&self, agent: Arc<AgentRuntime>) {
        let agent_type = agent.agent_type().as_str().to_string();
        let status = agent.status().await;

        {
            let mut state = self.state.lock().await;
            let pool = state.entry(agent_type).or_default();
            if status == AgentStatus::Idle {
                pool.idle.push_back(agent.clone());
            } else {
                pool.total = pool.total.saturating_sub(1);
            }
        }

        if status != AgentStatus::Idle {
            let factory = self.factory.clone();
            tokio::spawn(async move {
                let _ = agent.terminate().await;
                factory.forget(agent.id()).await;
            });
        }
        self.released.notify_waiters();
    }

    /// Eagerly construct and park `count` agents.
    pub async fn warmup(&self, agent_type: &str, count: usize) -> FleetResult<usize> {
        let policy = self.config.policy_for(agent_type);
        let mut created = 0;
        for _ in 0..count {
            {
                let mut state = self.state.lock().await;
                let pool = state.entry(agent_type.to_string()).or_default();
                if pool.total >= policy.max_size {
                    break;
                }
                pool.total += 1;
            }
            match self.factory.create(agent_type).await {
                Ok(agent) => {
                    let mut state = self.state.lock().await;
                    state
                        .entry(agent_type.to_string())
                        .or_default()
                        .idle
                        .push_back(agent);
                    created += 1;
                }
                Err(e) => {
                    let mut state = self.state.lock().await;
                    if let Some(pool) = state.get_mut(agent_type) {
                        pool.total = pool.total.saturating_sub(1);
                    }
                    return Err(e);
                }
            }
        }
        self.released.notify_waiters();
        Ok(created)
    }

    /// One reaper pass: terminate agents idle beyond their TTL, down to
    /// `min_size` per type. Returns how many were reaped.
    pub async fn reap_idle(&self) -> usize {
        let now = self.clock.now();
        let mut doomed = Vec::new();

        {
            let mut state = self.state.lock().await;
            for (agent_type, pool) in state.iter_mut() {
                let policy = self.config.policy_for(agent_type);
                let ttl = ChronoDuration::milliseconds(
                    i64::try_from(policy.idle_ttl_ms).unwrap_or(i64::MAX),
                );
                while pool.total > policy.min_size {
                    let Some(front) = pool.idle.front() else { break };
                    if front.idle_since() + ttl > now {
                        break;
                    }
                    let agent = pool.idle.pop_front().expect("front exists");
                    pool.total = pool.total.saturating_sub(1);
                    doomed.push(agent);
                }
            }
        }

        let reaped = doomed.len();
        for agent in doomed {
            let _ = agent.terminate().await;
            self.factory.forget(agent.id()).await;
        }
        if reaped > 0 {
            tracing::debug!(reaped, "pool reaper terminated idle agents");
        }
        reaped
    }

    /// Spawn the background idle reaper.
    pub fn start_reaper(self: Arc<Self>) -> DaemonHandle {
        let pool = self;
        // Half the smallest idle TTL, clamped to a sane band.
        let min_ttl = pool
            .config
            .per_type
            .values()
            .map(|p| p.idle_ttl_ms)
            .chain(std::iter::once(pool.config.defaults.idle_ttl_ms))
            .min()
            .unwrap_or(300_000);
        let interval = Duration::from_millis((min_ttl / 2).clamp(1_000, 30_000));
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => { pool.reap_idle().await; }
                    _ = shutdown_rx.recv() => return,
                }
            }
        });

        DaemonHandle::new("pool-reaper", shutdown_tx, handle)
    }

    /// Terminate every pooled agent.
    pub async fn shutdown(&self) {
        let agents: Vec<Arc<AgentRuntime>> = {
            let mut state = self.state.lock().await;
            state
                .values_mut()
                .flat_map(|pool| {
                    pool.total = pool.total.saturating_sub(pool.idle.len());
                    std::mem::take(&mut pool.idle)
                })
                .collect()
        };
        for agent in agents {
            let _ = agent.terminate().await;
            self.factory.forget(agent.id()).await;
        }
    }

    pub async fn stats(&self) -> HashMap<String, PoolStats> {
        let state = self.state.lock().await;
        state
            .iter()
            .map(|(tag, pool)| {
                (
                    tag.clone(),
                    PoolStats {
                        idle: pool.idle.len(),
                        total: pool.total,
                    },
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::MockMemoryBackend;
    use crate::domain::models::config::{
        EventBusConfig, LearningConfig, MemoryConfig, PoolPolicy,
    };
    use crate::domain::models::BackendKind;
    use crate::domain::ports::{Clock, SystemClock};
    use crate::services::agent_registry::{register_builtin_agents, AgentRegistry};
    use crate::services::event_bus::EventBus;
    use crate::services::learning_engine::LearningEngine;
    use crate::services::memory_service::SwarmMemoryStore;

    fn pool_with(config: PoolConfig) -> Arc<AgentPool> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
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
        let learning = Arc::new(LearningEngine::new(
            store.clone(),
            bus.clone(),
            clock.clone(),
            LearningConfig::default(),
        ));
        let registry = Arc::new(AgentRegistry::new());
        register_builtin_agents(&registry);
        let factory = Arc::new(AgentFactory::new(registry, bus, store, learning, clock.clone()));
        Arc::new(AgentPool::new(factory, config, clock))
    }

    fn bounded_config(max_size: usize, acquire_timeout_ms: u64) -> PoolConfig {
        PoolConfig {
            defaults: PoolPolicy {
                max_size,
                ..PoolPolicy::default()
            },
            per_type: HashMap::new(),
            acquire_timeout_ms,
        }
    }

    #[tokio::test]
    async fn test_warmup_then_warm_acquire() {
        let pool = pool_with(bounded_config(8, 1_000));
        let created = pool.warmup("test-generator", 3).await.unwrap();
        assert_eq!(created, 3);

        let stats = pool.stats().await;
        assert_eq!(stats["test-generator"].idle, 3);
        assert_eq!(stats["test-generator"].total, 3);

        let agent = pool.acquire("test-generator").await.unwrap();
        let stats = pool.stats().await;
        assert_eq!(stats["test-generator"].idle, 2);
        assert_eq!(stats["test-generator"].total, 3);

        pool.release(agent).await;
        assert_eq!(pool.stats().await["test-generator"].idle, 3);
    }

    #[tokio::test]
    async fn test_cold_acquire_constructs() {
        let pool = pool_with(bounded_config(8, 1_000));
        let agent = pool.acquire("quality-gate").await.unwrap();
        assert_eq!(agent.agent_type().as_str(), "quality-gate");
        assert_eq!(pool.stats().await["quality-gate"].total, 1);
    }

    #[tokio::test]
    async fn test_saturated_acquire_times_out() {
        let pool = pool_with(bounded_config(1, 100));
        let held = pool.acquire("test-executor").await.unwrap();

        let start = std::time::Instant::now();
        let err = pool.acquire("test-executor").await.unwrap_err();
        assert!(matches!(err, FleetError::PoolExhausted { .. }));
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(90));
        assert!(elapsed < Duration::from_secs(2));

        pool.release(held).await;
    }

    #[tokio::test]
    async fn test_release_unblocks_waiter() {
        let pool = pool_with(bounded_config(1, 2_000));
        let held = pool.acquire("test-executor").await.unwrap();

        let pool_clone = pool.clone();
        let waiter =
            tokio::spawn(async move { pool_clone.acquire("test-executor").await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        pool.release(held).await;

        let acquired = waiter.await.unwrap();
        assert!(acquired.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_type_fails_fast_and_frees_slot() {
        let pool = pool_with(bounded_config(1, 100));
        assert!(pool.acquire("bogus").await.is_err());
        // The reserved slot was released; a valid acquire still works.
        assert!(pool.acquire("quality-gate").await.is_ok());
    }

    #[tokio::test]
    async fn test_warmup_respects_max_size() {
        let pool = pool_with(bounded_config(2, 100));
        let created = pool.warmup("flaky-hunter", 10).await.unwrap();
        assert_eq!(created, 2);
    }

    #[tokio::test]
    async fn test_reaper_honors_min_size() {
        let mut config = bounded_config(8, 100);
        config.defaults.min_size = 1;
        config.defaults.idle_ttl_ms = 0; // everything idle is instantly stale
        let pool = pool_with(config);

        pool.warmup("security-scanner", 3).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let reaped = pool.reap_idle().await;
        assert_eq!(reaped, 2);
        let stats = pool.stats().await;
        assert_eq!(stats["security-scanner"].total, 1);
    }

    #[tokio::test]
    async fn test_shutdown_terminates_idle_agents() {
        let pool = pool_with(bounded_config(8, 100));
        pool.warmup("test-generator", 2).await.unwrap();
        pool.shutdown().await;
        let stats = pool.stats().await;
        assert_eq!(stats["test-generator"].idle, 0);
        assert_eq!(stats["test-generator"].total, 0);
    }
}

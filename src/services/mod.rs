//! Core fleet services.

pub mod agent_factory;
pub mod agent_pool;
pub mod agent_registry;
pub mod agent_runtime;
pub mod event_bus;
pub mod fleet_manager;
pub mod learning_engine;
pub mod memory_service;
pub mod metrics;
pub mod router;
pub mod task_queue;

pub use agent_factory::{AgentDirectory, AgentFactory};
pub use agent_pool::{AgentPool, PoolStats};
pub use agent_registry::{
    register_builtin_agents, AgentContext, AgentHandler, AgentRegistry, ScriptedHandler,
};
pub use agent_runtime::{AgentRuntime, ExecutionOutcome};
pub use event_bus::{EventBus, SubscriptionId};
pub use fleet_manager::{FleetManager, FleetStatus, ShutdownSummary};
pub use learning_engine::LearningEngine;
pub use memory_service::{MemoryTransaction, SwarmMemoryStore};
pub use metrics::{MetricsRegistry, MetricsSnapshot};
pub use router::Router;
pub use task_queue::{
    CancelOutcome, QueueCounts, RetryDisposition, TaskQueue, TaskStatusView,
};

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Handle to a background daemon with cooperative shutdown.
pub struct DaemonHandle {
    name: &'static str,
    shutdown_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

impl DaemonHandle {
    pub fn new(name: &'static str, shutdown_tx: mpsc::Sender<()>, handle: JoinHandle<()>) -> Self {
        Self {
            name,
            shutdown_tx,
            handle,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Signal the daemon and wait briefly for it to exit.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(()).await;
        if tokio::time::timeout(Duration::from_secs(5), self.handle)
            .await
            .is_err()
        {
            tracing::warn!(daemon = self.name, "daemon did not stop within 5s");
        }
    }
}

//! Agent factory: builds initialized runtimes from registry blueprints
//! and tracks every live agent in the fleet directory.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::domain::errors::{FleetError, FleetResult};
use crate::domain::models::{AgentId, AgentType};
use crate::domain::ports::Clock;
use crate::services::agent_registry::AgentRegistry;
use crate::services::agent_runtime::AgentRuntime;
use crate::services::event_bus::EventBus;
use crate::services::learning_engine::LearningEngine;
use crate::services::memory_service::SwarmMemoryStore;

/// All agents the fleet has spawned, keyed by id. The fleet manager owns
/// agents; everything else holds ids.
pub type AgentDirectory = Arc<RwLock<HashMap<AgentId, Arc<AgentRuntime>>>>;

pub struct AgentFactory {
    registry: Arc<AgentRegistry>,
    bus: Arc<EventBus>,
    memory: Arc<SwarmMemoryStore>,
    learning: Arc<LearningEngine>,
    clock: Arc<dyn Clock>,
    directory: AgentDirectory,
}

impl AgentFactory {
    pub fn new(
        registry: Arc<AgentRegistry>,
        bus: Arc<EventBus>,
        memory: Arc<SwarmMemoryStore>,
        learning: Arc<LearningEngine>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            registry,
            bus,
            memory,
            learning,
            clock,
            directory: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn directory(&self) -> AgentDirectory {
        self.directory.clone()
    }

    /// Construct and initialize an agent of the given type.
    pub async fn create(&self, agent_type: &str) -> FleetResult<Arc<AgentRuntime>> {
        let (handler, capabilities) = self
            .registry
            .build_handler(agent_type)
            .ok_or_else(|| FleetError::UnknownAgentType(agent_type.to_string()))?;

        let runtime = Arc::new(AgentRuntime::new(
            AgentType::new(agent_type),
            capabilities,
            handler,
            self.bus.clone(),
            self.memory.clone(),
            self.learning.clone(),
            self.clock.clone(),
        ));
        runtime.initialize().await?;

        self.directory
            .write()
            .await
            .insert(runtime.id(), runtime.clone());
        Ok(runtime)
    }

    /// Drop an agent from the directory (after termination).
    pub async fn forget(&self, agent_id: AgentId) {
        self.directory.write().await.remove(&agent_id);
    }
}

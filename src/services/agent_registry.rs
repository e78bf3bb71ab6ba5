//! Agent type registry and the uniform handler contract.
//!
//! Concrete agent types are strategies: a capability set plus a task
//! handler registered under a type tag at program start. The fleet never
//! discovers agents reflectively; the registry is the closed set.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::domain::models::{AgentId, AgentType, BusEvent, FailureKind, Task, TaskOutcome};
use crate::services::event_bus::EventBus;
use crate::services::memory_service::SwarmMemoryStore;

/// Everything a handler may touch while executing a task.
///
/// Handlers get a publish/subscribe sink and the shared memory store, but
/// never direct references to other agents or the fleet manager.
#[derive(Clone)]
pub struct AgentContext {
    pub agent_id: AgentId,
    pub agent_type: AgentType,
    pub memory: Arc<SwarmMemoryStore>,
    pub bus: Arc<EventBus>,
    pub cancel: CancellationToken,
}

/// The strategy a concrete agent type supplies.
#[async_trait]
pub trait AgentHandler: Send + Sync {
    /// Execute one task. Long work must observe `ctx.cancel` at its own
    /// suspension points; results are values, not panics.
    async fn handle(&self, task: Task, ctx: AgentContext) -> TaskOutcome;

    /// Topic patterns the agent listens on for its whole lifetime
    /// (subscriptions survive `pause`).
    fn subscriptions(&self) -> Vec<String> {
        Vec::new()
    }

    /// Invoked for every event delivered to one of the subscriptions.
    async fn on_event(&self, _event: BusEvent) {}
}

type HandlerConstructor = Arc<dyn Fn() -> Arc<dyn AgentHandler> + Send + Sync>;

struct AgentBlueprint {
    capabilities: BTreeSet<String>,
    constructor: HandlerConstructor,
}

/// Map from agent-type tag to constructor; extended only through
/// `register` at startup.
#[derive(Default)]
pub struct AgentRegistry {
    blueprints: std::sync::RwLock<HashMap<String, AgentBlueprint>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent type. Re-registering a tag replaces it.
    pub fn register<F>(
        &self,
        agent_type: impl Into<String>,
        capabilities: impl IntoIterator<Item = String>,
        constructor: F,
    ) where
        F: Fn() -> Arc<dyn AgentHandler> + Send + Sync + 'static,
    {
        let blueprint = AgentBlueprint {
            capabilities: capabilities.into_iter().collect(),
            constructor: Arc::new(constructor),
        };
        self.blueprints
            .write()
            .expect("registry lock poisoned")
            .insert(agent_type.into(), blueprint);
    }

    pub fn contains(&self, agent_type: &str) -> bool {
        self.blueprints
            .read()
            .expect("registry lock poisoned")
            .contains_key(agent_type)
    }

    /// Build a fresh handler plus its advertised capabilities.
    pub fn build_handler(
        &self,
        agent_type: &str,
    ) -> Option<(Arc<dyn AgentHandler>, BTreeSet<String>)> {
        let blueprints = self.blueprints.read().expect("registry lock poisoned");
        blueprints
            .get(agent_type)
            .map(|b| ((b.constructor)(), b.capabilities.clone()))
    }

    pub fn capabilities_of(&self, agent_type: &str) -> Option<BTreeSet<String>> {
        let blueprints = self.blueprints.read().expect("registry lock poisoned");
        blueprints.get(agent_type).map(|b| b.capabilities.clone())
    }

    /// All registered type tags, sorted for deterministic iteration.
    pub fn types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .blueprints
            .read()
            .expect("registry lock poisoned")
            .keys()
            .cloned()
            .collect();
        types.sort();
        types
    }

    /// Agent types whose advertised capabilities cover the requirement.
    pub fn types_with_capabilities(&self, required: &BTreeSet<String>) -> Vec<String> {
        let blueprints = self.blueprints.read().expect("registry lock poisoned");
        let mut matching: Vec<String> = blueprints
            .iter()
            .filter(|(_, b)| required.iter().all(|r| b.capabilities.contains(r)))
            .map(|(tag, _)| tag.clone())
            .collect();
        matching.sort();
        matching
    }
}

/// Payload-scripted handler backing the built-in QE agent types.
///
/// The business logic of real generators/analyzers lives behind external
/// providers and is out of the core; this handler implements only the
/// uniform contract: cooperative cancellation, explicit outcomes, and a
/// result value echoing the work performed.
pub struct ScriptedHandler;

#[async_trait]
impl AgentHandler for ScriptedHandler {
    async fn handle(&self, task: Task, ctx: AgentContext) -> TaskOutcome {
        let sleep_ms = task
            .payload
            .get("sleep_ms")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(0);
        if sleep_ms > 0 {
            tokio::select! {
                () = tokio::time::sleep(Duration::from_millis(sleep_ms)) => {}
                () = ctx.cancel.cancelled() => {
                    return TaskOutcome::failure(FailureKind::Transient, "canceled mid-task");
                }
            }
        }

        match task
            .payload
            .get("outcome")
            .and_then(serde_json::Value::as_str)
        {
            Some("transient_failure") => {
                TaskOutcome::failure(FailureKind::Transient, "scripted transient failure")
            }
            Some("permanent_failure") => {
                TaskOutcome::failure(FailureKind::Permanent, "scripted permanent failure")
            }
            _ => TaskOutcome::Success(json!({
                "task_id": task.id.to_string(),
                "task_type": task.task_type,
                "agent_type": ctx.agent_type.as_str(),
                "echo": task.payload,
            })),
        }
    }
}

/// Register the built-in QE agent types.
pub fn register_builtin_agents(registry: &AgentRegistry) {
    let builtin: &[(&str, &[&str])] = &[
        ("test-generator", &["test-generation", "typescript", "jest"]),
        ("test-executor", &["test-execution", "jest"]),
        ("coverage-analyzer", &["coverage-analysis"]),
        ("flaky-hunter", &["flaky-detection", "test-execution"]),
        ("security-scanner", &["security-scan"]),
        ("quality-gate", &["quality-gate"]),
    ];
    for (tag, capabilities) in builtin {
        registry.register(
            *tag,
            capabilities.iter().map(|c| (*c).to_string()),
            || Arc::new(ScriptedHandler),
        );
    }
}

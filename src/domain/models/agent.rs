//! Agent domain model.
//!
//! Agents are typed workers that execute tasks matching their advertised
//! capabilities. The lifecycle state machine here is the single source of
//! truth for legal transitions; the runtime rejects anything else.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Globally unique agent identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AgentId(pub Uuid);

impl AgentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for AgentId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Agent type tag (e.g. `test-generator`, `coverage-analyzer`).
///
/// The set of valid tags is closed at startup via the registry; this
/// newtype only carries the tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AgentType(pub String);

impl AgentType {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AgentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for AgentType {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Lifecycle status of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// Constructed but not initialized
    Created,
    /// Running initialization (subscriptions, config load)
    Initializing,
    /// Ready to accept a task
    Idle,
    /// Executing exactly one task
    Busy,
    /// Rejecting new tasks, subscriptions kept
    Paused,
    /// Shutting down, releasing resources
    Terminating,
    /// Fully terminated, never reused
    Terminated,
    /// Unrecoverable failure (terminal apart from cleanup)
    Failed,
}

impl Default for AgentStatus {
    fn default() -> Self {
        Self::Created
    }
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Initializing => "initializing",
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Paused => "paused",
            Self::Terminating => "terminating",
            Self::Terminated => "terminated",
            Self::Failed => "failed",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "created" => Some(Self::Created),
            "initializing" => Some(Self::Initializing),
            "idle" => Some(Self::Idle),
            "busy" => Some(Self::Busy),
            "paused" => Some(Self::Paused),
            "terminating" => Some(Self::Terminating),
            "terminated" => Some(Self::Terminated),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminated | Self::Failed)
    }

    /// Valid transitions from this status.
    ///
    /// `Terminating` is reachable from every non-terminated state so that
    /// `terminate()` can always run cleanup; `Failed` is likewise reachable
    /// from every live state.
    pub fn valid_transitions(&self) -> &'static [AgentStatus] {
        match self {
            Self::Created => &[Self::Initializing, Self::Terminating, Self::Failed],
            Self::Initializing => &[Self::Idle, Self::Terminating, Self::Failed],
            Self::Idle => &[Self::Busy, Self::Paused, Self::Terminating, Self::Failed],
            Self::Busy => &[Self::Idle, Self::Terminating, Self::Failed],
            Self::Paused => &[Self::Idle, Self::Terminating, Self::Failed],
            Self::Terminating => &[Self::Terminated],
            Self::Terminated => &[],
            // Cleanup is still allowed after failure.
            Self::Failed => &[Self::Terminating],
        }
    }

    pub fn can_transition_to(&self, new_status: Self) -> bool {
        self.valid_transitions().contains(&new_status)
    }
}

/// Per-agent execution counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentMetrics {
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub total_duration_ms: u64,
    pub avg_duration_ms: f64,
}

impl AgentMetrics {
    pub fn record_success(&mut self, duration_ms: u64) {
        self.tasks_completed += 1;
        self.record_duration(duration_ms);
    }

    pub fn record_failure(&mut self, duration_ms: u64) {
        self.tasks_failed += 1;
        self.record_duration(duration_ms);
    }

    pub fn heartbeat(&mut self, now: DateTime<Utc>) {
        self.last_heartbeat_at = Some(now);
    }

    fn record_duration(&mut self, duration_ms: u64) {
        self.total_duration_ms += duration_ms;
        let total = self.tasks_completed + self.tasks_failed;
        if total > 0 {
            #[allow(clippy::cast_precision_loss)]
            {
                self.avg_duration_ms = self.total_duration_ms as f64 / total as f64;
            }
        }
    }
}

/// Specification for spawning an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSpec {
    pub agent_type: AgentType,
    pub capabilities: BTreeSet<String>,
    /// Opaque per-agent configuration overrides.
    #[serde(default)]
    pub config: serde_json::Value,
}

impl AgentSpec {
    pub fn new(agent_type: impl Into<AgentType>) -> Self {
        Self {
            agent_type: agent_type.into(),
            capabilities: BTreeSet::new(),
            config: serde_json::Value::Null,
        }
    }

    pub fn with_capability(mut self, cap: impl Into<String>) -> Self {
        self.capabilities.insert(cap.into());
        self
    }
}

impl From<&str> for AgentSpec {
    fn from(tag: &str) -> Self {
        Self::new(tag)
    }
}

/// Health report returned by `health_check`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub agent_id: AgentId,
    pub agent_type: AgentType,
    pub status: AgentStatus,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub inflight_tasks: u32,
}

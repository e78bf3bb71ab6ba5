//! Domain error types for the AQE fleet.
//!
//! Each enum covers one failure domain. Kinds that callers must react to
//! differently (retry, re-queue, abort the fleet) expose predicate
//! helpers instead of forcing string matching.

use thiserror::Error;
use uuid::Uuid;

/// Fleet-level errors surfaced by the manager, queue, router, and pool.
#[derive(Debug, Error)]
pub enum FleetError {
    /// Missing or invalid configuration; fatal at init.
    #[error("Configuration error in `{field}`: expected {expected}")]
    Configuration { field: String, expected: String },

    /// Attempted lifecycle transition from a disallowed state.
    #[error("Illegal state transition from {from} to {to}")]
    IllegalStateTransition { from: String, to: String },

    /// A single task attempt exceeded its timeout budget.
    #[error("Task {task_id} timed out after {timeout_ms}ms")]
    TaskTimeout { task_id: Uuid, timeout_ms: u64 },

    /// Task handler reported failure after retries were exhausted.
    #[error("Task {task_id} failed: {cause}")]
    TaskFailed { task_id: Uuid, cause: String },

    /// Agent pool saturated and acquisition timed out.
    #[error("Agent pool exhausted for type `{agent_type}`")]
    PoolExhausted { agent_type: String },

    /// No registered agent type satisfies the task's required capabilities.
    #[error("No agent type satisfies capabilities {missing:?} for task {task_id}")]
    CapabilityUnmet { task_id: Uuid, missing: Vec<String> },

    /// Explicit cancellation; not an error from the caller's view.
    #[error("Task {0} was canceled")]
    Canceled(Uuid),

    /// Submitting the task would create a dependency cycle.
    #[error("Task dependency cycle detected involving task {0}")]
    DependencyCycle(Uuid),

    /// Referenced dependency does not exist in the queue.
    #[error("Task {task_id} depends on unknown task {dependency}")]
    UnknownDependency { task_id: Uuid, dependency: Uuid },

    #[error("Task not found: {0}")]
    TaskNotFound(Uuid),

    #[error("Task already exists: {0}")]
    TaskAlreadyExists(Uuid),

    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    #[error("Unknown agent type: {0}")]
    UnknownAgentType(String),

    /// The fleet is shutting down and rejects new work.
    #[error("Fleet is shut down")]
    Shutdown,

    #[error(transparent)]
    Memory(#[from] MemoryError),

    #[error(transparent)]
    Bus(#[from] BusError),
}

impl FleetError {
    /// True when the fleet must stop: persistent storage failure.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Memory(e) if e.is_fatal())
    }

    /// Exit code the CLI adapter maps this error to.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Configuration { .. }
            | Self::DependencyCycle(_)
            | Self::UnknownDependency { .. } => 3,
            Self::TaskTimeout { .. } | Self::TaskFailed { .. } | Self::CapabilityUnmet { .. } => 1,
            Self::Canceled(_) => 130,
            _ => 4,
        }
    }
}

/// Errors raised by the memory store and its backends.
#[derive(Debug, Error)]
pub enum MemoryError {
    /// Partition name is outside the enumerated set.
    #[error("Unknown memory partition: `{0}`")]
    UnknownPartition(String),

    #[error("Memory key cannot be empty")]
    EmptyKey,

    /// Transient backend I/O failure.
    #[error("Backend I/O error: {0}")]
    Io(String),

    /// Persistent storage failure (disk full or similar); fatal for the fleet.
    #[error("Backend storage exhausted: {0}")]
    StorageExhausted(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Pattern not found: {0}")]
    PatternNotFound(Uuid),

    /// Configured backend kind does not match the constructed backend.
    #[error("Memory backend mismatch: configured `{configured}`, constructed `{constructed}`")]
    BackendMismatch {
        configured: String,
        constructed: String,
    },

    #[error("Memory store is shut down")]
    Shutdown,
}

impl MemoryError {
    /// Transient errors may be retried by callers.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Io(_))
    }

    /// Fatal errors trigger an emergency fleet shutdown.
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::StorageExhausted(_))
    }
}

impl From<sqlx::Error> for MemoryError {
    fn from(err: sqlx::Error) -> Self {
        let text = err.to_string();
        // SQLITE_FULL surfaces as a database error mentioning a full disk.
        if text.contains("disk is full") || text.contains("database or disk is full") {
            MemoryError::StorageExhausted(text)
        } else {
            MemoryError::Io(text)
        }
    }
}

impl From<serde_json::Error> for MemoryError {
    fn from(err: serde_json::Error) -> Self {
        MemoryError::Serialization(err.to_string())
    }
}

/// Errors raised by the event bus.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("Event bus is shut down")]
    Shutdown,

    #[error("Invalid topic `{topic}`: {reason}")]
    InvalidTopic { topic: String, reason: String },

    #[error("Invalid subscription pattern `{pattern}`: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Unknown subscription: {0}")]
    UnknownSubscription(u64),
}

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for `{field}`: {value} (expected {expected})")]
    InvalidValue {
        field: String,
        value: String,
        expected: String,
    },

    #[error("Missing required field `{field}` (expected {expected})")]
    MissingField { field: String, expected: String },

    #[error("Failed to read configuration: {0}")]
    Load(String),
}

impl From<ConfigError> for FleetError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::InvalidValue {
                field, expected, ..
            }
            | ConfigError::MissingField { field, expected } => {
                FleetError::Configuration { field, expected }
            }
            ConfigError::Load(msg) => FleetError::Configuration {
                field: "config".to_string(),
                expected: msg,
            },
        }
    }
}

pub type FleetResult<T> = Result<T, FleetError>;
pub type MemoryResult<T> = Result<T, MemoryError>;

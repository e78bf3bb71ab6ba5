//! Task domain model.
//!
//! Tasks are immutable work items routed to agents. They form a DAG with
//! dependencies; queue-side bookkeeping (status, attempts) lives in the
//! task queue, not on the task itself.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique task identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Priority lanes. P0 is the highest and sorts first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    P0 = 0,
    P1 = 1,
    P2 = 2,
    P3 = 3,
}

impl Default for TaskPriority {
    fn default() -> Self {
        Self::P2
    }
}

impl TaskPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::P0 => "p0",
            Self::P1 => "p1",
            Self::P2 => "p2",
            Self::P3 => "p3",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "p0" => Some(Self::P0),
            "p1" => Some(Self::P1),
            "p2" => Some(Self::P2),
            "p3" => Some(Self::P3),
            _ => None,
        }
    }
}

/// Status of a task in the execution pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Accepted but dependencies not yet met
    Queued,
    /// All dependencies completed; eligible for dispatch
    Ready,
    /// Claimed by the dispatcher, agent acquisition in progress
    Assigned,
    /// An agent is executing the task
    Running,
    /// Finished successfully
    Completed,
    /// Failed after retries were exhausted
    Failed,
    /// Explicitly canceled
    Canceled,
    /// Last attempt exceeded the timeout budget
    TimedOut,
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Queued
    }
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Ready => "ready",
            Self::Assigned => "assigned",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
            Self::TimedOut => "timed_out",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "queued" => Some(Self::Queued),
            "ready" => Some(Self::Ready),
            "assigned" => Some(Self::Assigned),
            "running" => Some(Self::Running),
            "completed" | "complete" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "canceled" | "cancelled" => Some(Self::Canceled),
            "timed_out" => Some(Self::TimedOut),
            _ => None,
        }
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Canceled | Self::TimedOut
        )
    }

    /// Valid transitions from this status.
    pub fn valid_transitions(&self) -> &'static [TaskStatus] {
        match self {
            Self::Queued => &[Self::Ready, Self::Canceled, Self::Failed],
            Self::Ready => &[Self::Assigned, Self::Canceled, Self::Failed],
            Self::Assigned => &[Self::Running, Self::Ready, Self::Canceled, Self::Failed],
            // Failed attempts with retry budget left re-enter Queued.
            Self::Running => &[
                Self::Completed,
                Self::Failed,
                Self::Canceled,
                Self::TimedOut,
                Self::Queued,
            ],
            Self::Completed | Self::Failed | Self::Canceled | Self::TimedOut => &[],
        }
    }

    pub fn can_transition_to(&self, new_status: Self) -> bool {
        self.valid_transitions().contains(&new_status)
    }
}

/// Backoff strategy between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    Exponential,
    Fixed,
}

/// Retry policy attached to a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: BackoffKind,
    pub base_ms: u64,
    pub cap_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff: BackoffKind::Exponential,
            base_ms: 100,
            cap_ms: 10_000,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: BackoffKind, base_ms: u64, cap_ms: u64) -> Self {
        Self {
            max_attempts,
            backoff,
            base_ms,
            cap_ms,
        }
    }

    /// Delay before the given attempt number (1-based; the delay after
    /// attempt 1 failed is `delay_for_attempt(1)`).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let ms = match self.backoff {
            BackoffKind::Fixed => self.base_ms,
            BackoffKind::Exponential => {
                let exp = attempt.saturating_sub(1).min(32);
                self.base_ms.saturating_mul(1u64 << exp)
            }
        };
        Duration::from_millis(ms.min(self.cap_ms))
    }
}

/// An immutable unit of work submitted to the fleet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    /// Semantic discriminator, e.g. `generate-tests`, `analyze-coverage`.
    pub task_type: String,
    pub payload: serde_json::Value,
    pub priority: TaskPriority,
    pub required_capabilities: BTreeSet<String>,
    pub dependencies: BTreeSet<TaskId>,
    /// Budget for a single attempt.
    pub timeout_ms: u64,
    pub retry_policy: RetryPolicy,
    pub created_at: DateTime<Utc>,
    pub deadline: Option<DateTime<Utc>>,
    /// When true, this task survives cancellation/failure of its parents.
    #[serde(default)]
    pub allow_parent_failure: bool,
}

impl Task {
    pub const DEFAULT_TIMEOUT_MS: u64 = 60_000;

    pub fn new(task_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: TaskId::new(),
            task_type: task_type.into(),
            payload,
            priority: TaskPriority::default(),
            required_capabilities: BTreeSet::new(),
            dependencies: BTreeSet::new(),
            timeout_ms: Self::DEFAULT_TIMEOUT_MS,
            retry_policy: RetryPolicy::default(),
            created_at: Utc::now(),
            deadline: None,
            allow_parent_failure: false,
        }
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_capability(mut self, cap: impl Into<String>) -> Self {
        self.required_capabilities.insert(cap.into());
        self
    }

    pub fn with_dependency(mut self, dep: TaskId) -> Self {
        self.dependencies.insert(dep);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_allow_parent_failure(mut self, allow: bool) -> Self {
        self.allow_parent_failure = allow;
        self
    }

    pub fn has_dependencies(&self) -> bool {
        !self.dependencies.is_empty()
    }

    /// Stable routing fingerprint: task type plus sorted capabilities.
    pub fn fingerprint(&self) -> String {
        let mut parts = vec![self.task_type.clone()];
        parts.extend(self.required_capabilities.iter().cloned());
        parts.join("|")
    }
}

/// How a single handler invocation ended, as reported by the handler.
///
/// Handlers return this value instead of panicking; infrastructure errors
/// still propagate as `Err` at the runtime boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TaskOutcome {
    Success(serde_json::Value),
    Failure {
        kind: FailureKind,
        message: String,
    },
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn failure(kind: FailureKind, message: impl Into<String>) -> Self {
        Self::Failure {
            kind,
            message: message.into(),
        }
    }
}

/// Whether a failure is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Transient,
    Permanent,
}

impl FailureKind {
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient)
    }
}

/// Final result of a task, returned by `FleetManager::await_task`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub value: Option<serde_json::Value>,
    pub error: Option<String>,
    pub attempts: u32,
    pub completed_at: DateTime<Utc>,
}

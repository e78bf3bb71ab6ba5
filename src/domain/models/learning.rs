//! Learning domain model: experiences and Q-values.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::models::agent::AgentId;

/// An immutable record of one task outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Experience {
    pub id: Uuid,
    pub agent_id: AgentId,
    pub task_type: String,
    pub state_key: String,
    pub action_key: String,
    pub reward: f64,
    pub outcome: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl Experience {
    pub fn new(
        agent_id: AgentId,
        task_type: impl Into<String>,
        state_key: impl Into<String>,
        action_key: impl Into<String>,
        reward: f64,
        outcome: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            agent_id,
            task_type: task_type.into(),
            state_key: state_key.into(),
            action_key: action_key.into(),
            reward,
            outcome,
            timestamp: Utc::now(),
        }
    }

    /// Storage key: zero-padded millisecond timestamp + id, so a
    /// lexicographic scan of the experience partition is chronological.
    pub fn storage_key(&self) -> String {
        format!("{:020}:{}", self.timestamp.timestamp_millis(), self.id)
    }
}

/// A state/action value mutated only through the TD(0) update rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QValue {
    pub state_key: String,
    pub action_key: String,
    pub value: f64,
    pub update_count: u64,
}

impl QValue {
    pub fn new(state_key: impl Into<String>, action_key: impl Into<String>) -> Self {
        Self {
            state_key: state_key.into(),
            action_key: action_key.into(),
            value: 0.0,
            update_count: 0,
        }
    }

    /// Apply one TD(0) step:
    /// `Q(s,a) ← Q(s,a) + α · (r + γ · max_next − Q(s,a))`.
    ///
    /// Returns the magnitude of the change, which under bounded rewards is
    /// bounded by `α · (|r| + γ · |max_next| + |Q|)`.
    pub fn apply_td0(&mut self, reward: f64, max_next: f64, alpha: f64, gamma: f64) -> f64 {
        let target = reward + gamma * max_next;
        let delta = alpha * (target - self.value);
        self.value += delta;
        self.update_count += 1;
        delta.abs()
    }

    /// Storage key within the `learning/qvalues` partition. The real
    /// state/action strings travel in the serialized value; this key only
    /// needs to be unique and stable.
    pub fn storage_key(&self) -> String {
        format!("{}::{}", self.state_key, self.action_key)
    }
}

//! Event domain model: topics, wildcard patterns, and the bus envelope.
//!
//! Topics are dot-separated hierarchies (`agent.test-generator.task.completed`).
//! Subscription patterns accept `*` for exactly one segment and a trailing
//! `**` for any suffix.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::errors::BusError;
use crate::domain::models::agent::AgentId;

/// Prefixes reserved for core components; agents publish under
/// `agent.<type>.*`.
const ALLOWED_PREFIXES: &[&str] = &["fleet", "agent", "task", "memory", "bus", "learning"];

/// A validated topic name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Topic(String);

impl Topic {
    /// Parse and validate a topic against the enumerated prefix set.
    pub fn parse(raw: &str) -> Result<Self, BusError> {
        if raw.is_empty() {
            return Err(BusError::InvalidTopic {
                topic: raw.to_string(),
                reason: "topic cannot be empty".to_string(),
            });
        }
        let segments: Vec<&str> = raw.split('.').collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(BusError::InvalidTopic {
                topic: raw.to_string(),
                reason: "empty topic segment".to_string(),
            });
        }
        if segments.iter().any(|s| s.contains('*')) {
            return Err(BusError::InvalidTopic {
                topic: raw.to_string(),
                reason: "wildcards are only valid in subscription patterns".to_string(),
            });
        }
        let prefix = segments[0];
        if !ALLOWED_PREFIXES.contains(&prefix) {
            return Err(BusError::InvalidTopic {
                topic: raw.to_string(),
                reason: format!("prefix `{prefix}` is not one of {ALLOWED_PREFIXES:?}"),
            });
        }
        // Agent topics carry the agent type as the second segment.
        if prefix == "agent" && segments.len() < 3 {
            return Err(BusError::InvalidTopic {
                topic: raw.to_string(),
                reason: "agent topics use the form agent.<type>.<suffix>".to_string(),
            });
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('.')
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One segment of a subscription pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
enum PatternSegment {
    Literal(String),
    /// `*` — exactly one segment
    Star,
    /// `**` — any remaining suffix (including empty), terminal only
    DoubleStar,
}

/// A compiled wildcard subscription pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPattern {
    segments: Vec<PatternSegment>,
    raw: String,
}

impl TopicPattern {
    pub fn parse(raw: &str) -> Result<Self, BusError> {
        if raw.is_empty() {
            return Err(BusError::InvalidPattern {
                pattern: raw.to_string(),
                reason: "pattern cannot be empty".to_string(),
            });
        }
        let parts: Vec<&str> = raw.split('.').collect();
        let mut segments = Vec::with_capacity(parts.len());
        for (i, part) in parts.iter().enumerate() {
            let segment = match *part {
                "" => {
                    return Err(BusError::InvalidPattern {
                        pattern: raw.to_string(),
                        reason: "empty pattern segment".to_string(),
                    })
                }
                "*" => PatternSegment::Star,
                "**" => {
                    if i != parts.len() - 1 {
                        return Err(BusError::InvalidPattern {
                            pattern: raw.to_string(),
                            reason: "`**` is only valid as the final segment".to_string(),
                        });
                    }
                    PatternSegment::DoubleStar
                }
                literal => {
                    if literal.contains('*') {
                        return Err(BusError::InvalidPattern {
                            pattern: raw.to_string(),
                            reason: "`*` cannot appear inside a segment".to_string(),
                        });
                    }
                    PatternSegment::Literal(literal.to_string())
                }
            };
            segments.push(segment);
        }
        Ok(Self {
            segments,
            raw: raw.to_string(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Check whether the pattern matches a concrete topic.
    pub fn matches(&self, topic: &Topic) -> bool {
        let topic_segments: Vec<&str> = topic.segments().collect();
        let mut ti = 0;
        for segment in &self.segments {
            match segment {
                PatternSegment::DoubleStar => return true,
                PatternSegment::Star => {
                    if ti >= topic_segments.len() {
                        return false;
                    }
                    ti += 1;
                }
                PatternSegment::Literal(lit) => {
                    if ti >= topic_segments.len() || topic_segments[ti] != lit {
                        return false;
                    }
                    ti += 1;
                }
            }
        }
        ti == topic_segments.len()
    }
}

impl std::fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.raw)
    }
}

/// A published message with its bus-assigned sequence number.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusEvent {
    pub id: Uuid,
    pub topic: Topic,
    /// Strictly increasing per topic; assigned on publish.
    pub sequence: u64,
    pub payload: serde_json::Value,
    pub source_agent: Option<AgentId>,
    pub published_at: DateTime<Utc>,
}

/// Well-known core topics.
pub mod topics {
    pub const FLEET_STARTED: &str = "fleet.started";
    pub const FLEET_STOPPED: &str = "fleet.stopped";
    pub const FLEET_AGENT_FAILED: &str = "fleet.agent.failed";
    pub const FLEET_MEMORY_FATAL: &str = "fleet.memory.fatal";
    pub const TASK_SUBMITTED: &str = "task.submitted";
    pub const TASK_STARTED: &str = "task.started";
    pub const TASK_COMPLETED: &str = "task.completed";
    pub const TASK_FAILED: &str = "task.failed";
    pub const TASK_RETRYING: &str = "task.retrying";
    pub const TASK_CANCELED: &str = "task.canceled";
    pub const MEMORY_GC_SWEPT: &str = "memory.gc.swept";
    pub const BUS_BACKPRESSURE_DROP: &str = "bus.backpressure.drop";
    pub const LEARNING_PERSIST_FAILED: &str = "learning.persist.failed";
}

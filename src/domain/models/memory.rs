//! Memory domain model: partitions, entries, and learned patterns.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::errors::MemoryError;
use crate::domain::models::agent::AgentId;

/// Closed set of memory partitions. Any other name is rejected at write
/// time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Partition {
    Coordination,
    Shared,
    LearningExperiences,
    LearningQvalues,
    Patterns,
    PatternsCache,
    Quarantine,
    Metrics,
}

impl Partition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Coordination => "coordination",
            Self::Shared => "shared",
            Self::LearningExperiences => "learning/experiences",
            Self::LearningQvalues => "learning/qvalues",
            Self::Patterns => "patterns",
            Self::PatternsCache => "patterns/cache",
            Self::Quarantine => "quarantine",
            Self::Metrics => "metrics",
        }
    }

    pub fn parse_str(s: &str) -> Result<Self, MemoryError> {
        match s {
            "coordination" => Ok(Self::Coordination),
            "shared" => Ok(Self::Shared),
            "learning/experiences" => Ok(Self::LearningExperiences),
            "learning/qvalues" => Ok(Self::LearningQvalues),
            "patterns" => Ok(Self::Patterns),
            "patterns/cache" => Ok(Self::PatternsCache),
            "quarantine" => Ok(Self::Quarantine),
            "metrics" => Ok(Self::Metrics),
            other => Err(MemoryError::UnknownPartition(other.to_string())),
        }
    }

    pub fn all() -> &'static [Partition] {
        &[
            Self::Coordination,
            Self::Shared,
            Self::LearningExperiences,
            Self::LearningQvalues,
            Self::Patterns,
            Self::PatternsCache,
            Self::Quarantine,
            Self::Metrics,
        ]
    }
}

impl std::fmt::Display for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single key/value record in the store.
///
/// `(partition, key)` is unique; writes are last-writer-wins with a
/// monotonic `updated_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub partition: Partition,
    pub key: String,
    pub value: Vec<u8>,
    pub ttl_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub agent_id: Option<AgentId>,
    pub metadata: BTreeMap<String, String>,
}

impl MemoryEntry {
    pub fn new(partition: Partition, key: impl Into<String>, value: Vec<u8>) -> Self {
        let now = Utc::now();
        Self {
            partition,
            key: key.into(),
            value,
            ttl_ms: None,
            created_at: now,
            updated_at: now,
            agent_id: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_ttl_ms(mut self, ttl_ms: u64) -> Self {
        self.ttl_ms = Some(ttl_ms);
        self
    }

    pub fn with_agent(mut self, agent_id: AgentId) -> Self {
        self.agent_id = Some(agent_id);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Absolute expiry instant, if a TTL is set.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.ttl_ms.and_then(|ttl| {
            i64::try_from(ttl)
                .ok()
                .map(|ms| self.created_at + ChronoDuration::milliseconds(ms))
        })
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().is_some_and(|at| at < now)
    }
}

/// Options for a `put` call.
#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    pub ttl_ms: Option<u64>,
    pub agent_id: Option<AgentId>,
    pub metadata: BTreeMap<String, String>,
}

/// A stored, reusable decision-unit with confidence derived from
/// success/failure counts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pattern {
    pub id: Uuid,
    pub agent_id: AgentId,
    pub pattern_type: String,
    pub payload: Vec<u8>,
    pub confidence: f64,
    pub success_count: u64,
    pub failure_count: u64,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
}

impl Pattern {
    pub fn new(agent_id: AgentId, pattern_type: impl Into<String>, payload: Vec<u8>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            agent_id,
            pattern_type: pattern_type.into(),
            payload,
            confidence: 0.0,
            success_count: 0,
            failure_count: 0,
            created_at: now,
            last_used_at: now,
        }
    }

    pub fn samples(&self) -> u64 {
        self.success_count + self.failure_count
    }

    /// Record an outcome and recompute confidence.
    ///
    /// Invariant: confidence stays within [0, 1] and always equals
    /// `success / (success + failure)` afterwards.
    pub fn record_outcome(&mut self, success: bool, now: DateTime<Utc>) {
        if success {
            self.success_count += 1;
        } else {
            self.failure_count += 1;
        }
        #[allow(clippy::cast_precision_loss)]
        {
            self.confidence = self.success_count as f64 / self.samples() as f64;
        }
        self.last_used_at = now;
    }

    /// Fold a batch of mined outcomes into the counts and recompute
    /// confidence.
    pub fn merge_counts(&mut self, successes: u64, failures: u64, now: DateTime<Utc>) {
        self.success_count += successes;
        self.failure_count += failures;
        if self.samples() > 0 {
            #[allow(clippy::cast_precision_loss)]
            {
                self.confidence = self.success_count as f64 / self.samples() as f64;
            }
        }
        self.last_used_at = now;
    }

    /// Patterns below the sample floor are hidden from retrieval.
    pub fn is_visible(&self, min_samples: u64) -> bool {
        self.samples() >= min_samples
    }
}

/// A routing hint derived from a stored pattern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternHint {
    pub pattern_id: Uuid,
    pub pattern_type: String,
    pub confidence: f64,
    pub payload: serde_json::Value,
}

//! Fleet configuration tree.
//!
//! Loaded once at construction via the figment-based loader; every
//! section has serde defaults matching the documented values so a missing
//! file yields a working mock-backed fleet.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Which memory backend the fleet runs against. Explicit, no
/// auto-detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Real,
    Mock,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Real => "real",
            Self::Mock => "mock",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Advisory fleet topology; affects default routing tie-breaks only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Topology {
    Mesh,
    Hierarchical,
    Ring,
    Star,
}

impl Default for Topology {
    fn default() -> Self {
        Self::Mesh
    }
}

impl Topology {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mesh => "mesh",
            Self::Hierarchical => "hierarchical",
            Self::Ring => "ring",
            Self::Star => "star",
        }
    }

    /// Ring fleets prefer rotating assignment; the others break ties by
    /// current load first.
    pub fn prefers_round_robin(&self) -> bool {
        matches!(self, Self::Ring)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterConfig {
    #[serde(rename = "type")]
    pub kind: BackendKind,
    pub db_path: Option<String>,
    pub max_connections: u32,
    pub fail_fast: bool,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::Mock,
            db_path: None,
            max_connections: 5,
            fail_fast: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetSection {
    pub max_concurrent_agents: usize,
    pub topology: Topology,
}

impl Default for FleetSection {
    fn default() -> Self {
        Self {
            max_concurrent_agents: 15,
            topology: Topology::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventBusConfig {
    pub topic_ring_capacity: usize,
    pub mailbox_capacity: usize,
    pub publish_timeout_ms: u64,
    pub handler_timeout_ms: u64,
    pub persist_events: bool,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            topic_ring_capacity: 1024,
            mailbox_capacity: 256,
            publish_timeout_ms: 250,
            handler_timeout_ms: 5_000,
            persist_events: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub cache_size: u64,
    pub cache_ttl_ms: u64,
    pub gc_interval_ms: u64,
    /// Patterns with fewer samples are hidden from retrieval.
    pub min_pattern_samples: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            cache_size: 1_000,
            cache_ttl_ms: 60_000,
            gc_interval_ms: 60_000,
            min_pattern_samples: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LearningConfig {
    pub alpha: f64,
    pub gamma: f64,
    pub epsilon: f64,
    /// Multiplied into epsilon after every selection; 1.0 disables decay.
    pub epsilon_decay: f64,
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    pub max_persist_retries: u32,
    /// Top-K cap for pattern hints.
    pub hint_limit: usize,
    pub hint_confidence_threshold: f64,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            alpha: 0.1,
            gamma: 0.95,
            epsilon: 0.1,
            epsilon_decay: 1.0,
            batch_size: 32,
            flush_interval_ms: 500,
            max_persist_retries: 3,
            hint_limit: 10,
            hint_confidence_threshold: 0.5,
        }
    }
}

/// Per-type pool sizing policy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolPolicy {
    pub min_size: usize,
    pub max_size: usize,
    pub warmup_count: usize,
    pub idle_ttl_ms: u64,
    pub growth_increment: usize,
}

impl Default for PoolPolicy {
    fn default() -> Self {
        Self {
            min_size: 0,
            max_size: 8,
            warmup_count: 0,
            idle_ttl_ms: 300_000,
            growth_increment: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub defaults: PoolPolicy,
    /// Per agent-type overrides keyed by type tag.
    pub per_type: HashMap<String, PoolPolicy>,
    pub acquire_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            defaults: PoolPolicy::default(),
            per_type: HashMap::new(),
            acquire_timeout_ms: 5_000,
        }
    }
}

impl PoolConfig {
    pub fn policy_for(&self, agent_type: &str) -> PoolPolicy {
        self.per_type
            .get(agent_type)
            .copied()
            .unwrap_or(self.defaults)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Consecutive failures of a (fingerprint, type) pair before blacklisting.
    pub blacklist_threshold: u32,
    pub blacklist_cooldown_ms: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            blacklist_threshold: 3,
            blacklist_cooldown_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub heartbeat_interval_ms: u64,
    pub misses_allowed: u32,
    pub cancellation_grace_ms: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 30_000,
            misses_allowed: 2,
            cancellation_grace_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    /// Optional log file directory; stderr only when absent.
    pub directory: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            directory: None,
        }
    }
}

/// Root configuration for the fleet.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    pub adapter: AdapterConfig,
    pub fleet: FleetSection,
    pub event_bus: EventBusConfig,
    pub memory: MemoryConfig,
    pub learning: LearningConfig,
    pub pool: PoolConfig,
    pub router: RouterConfig,
    pub watchdog: WatchdogConfig,
    pub logging: LoggingConfig,
}

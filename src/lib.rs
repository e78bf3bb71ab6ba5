//! AQE - Autonomous Quality Engineering Fleet
//!
//! A single-process fleet that spawns specialized QE worker agents,
//! routes tasks to them by capability and learned outcome, and
//! coordinates them through:
//! - An in-process event bus with wildcard topics and backpressure
//! - A partitioned, durable swarm memory store (SQLite, WAL mode)
//! - A Q-learning engine biasing future routing decisions
//! - Warm agent pools with idle reaping and a heartbeat watchdog

pub mod adapters;
pub mod cli;
pub mod domain;
pub mod infrastructure;
pub mod services;

// Re-export key types for convenience
pub use domain::models::{FleetConfig, Task, TaskId, TaskPriority, TaskStatus};
pub use services::FleetManager;

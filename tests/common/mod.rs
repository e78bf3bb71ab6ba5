//! Common test utilities for integration tests.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use aqe::domain::models::{BackendKind, FleetConfig, PoolPolicy};
use aqe::services::FleetManager;
use tempfile::TempDir;

/// Create a temporary directory for test isolation.
#[allow(dead_code)]
pub fn temp_dir() -> TempDir {
    tempfile::tempdir().expect("failed to create temp dir")
}

/// Path to a fresh SQLite database file in a temporary directory.
#[allow(dead_code)]
pub fn temp_db_path() -> (TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let db_path = dir.path().join("fleet.db");
    (dir, db_path)
}

/// Config backed by the in-memory mock adapter.
#[allow(dead_code)]
pub fn mock_config() -> FleetConfig {
    FleetConfig::default()
}

/// Config backed by a real SQLite file.
#[allow(dead_code)]
pub fn real_config(db_path: &std::path::Path) -> FleetConfig {
    let mut config = FleetConfig::default();
    config.adapter.kind = BackendKind::Real;
    config.adapter.db_path = Some(db_path.to_string_lossy().into_owned());
    config
}

/// Add a per-type pool policy to a config.
#[allow(dead_code)]
pub fn with_pool_policy(
    mut config: FleetConfig,
    agent_type: &str,
    policy: PoolPolicy,
) -> FleetConfig {
    config.pool.per_type.insert(agent_type.to_string(), policy);
    config
}

/// Init and start a fleet over the given config.
#[allow(dead_code)]
pub async fn started_fleet(config: FleetConfig) -> Arc<FleetManager> {
    let fleet = FleetManager::init(config).await.expect("fleet init");
    fleet.start().await.expect("fleet start");
    fleet
}

/// Poll an async predicate until it holds or the timeout elapses.
#[allow(dead_code)]
pub async fn wait_for<F, Fut>(mut predicate: F, timeout_ms: u64) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = std::time::Instant::now() + Duration::from_millis(timeout_ms);
    while std::time::Instant::now() < deadline {
        if predicate().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

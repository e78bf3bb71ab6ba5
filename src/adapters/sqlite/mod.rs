//! SQLite adapters for the fleet memory store and event persistence.

pub mod connection;
pub mod memory_backend;
pub mod schema;

pub use connection::{open_fleet_db, open_in_memory};
pub use memory_backend::{SqliteEventSink, SqliteMemoryBackend};
pub use schema::{apply_schema, stored_schema_version, SCHEMA_VERSION};

use std::path::Path;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::domain::errors::{MemoryError, MemoryResult};

/// Parse a UUID string from a SQLite row field.
pub(crate) fn parse_uuid(s: &str) -> MemoryResult<Uuid> {
    Uuid::parse_str(s).map_err(|e| MemoryError::Serialization(e.to_string()))
}

/// Parse an RFC3339 datetime string from a SQLite row field.
pub(crate) fn parse_datetime(s: &str) -> MemoryResult<DateTime<Utc>> {
    chrono::DateTime::parse_from_rfc3339(s)
        .map_err(|e| MemoryError::Serialization(e.to_string()))
        .map(|dt| dt.with_timezone(&Utc))
}

/// Open (creating if missing) the fleet database and bring its schema up.
pub async fn initialize_database(
    db_path: &Path,
    max_connections: u32,
) -> MemoryResult<SqlitePool> {
    let pool = open_fleet_db(db_path, max_connections).await?;
    apply_schema(&pool).await?;
    Ok(pool)
}

/// In-memory pool with the full schema applied, for tests.
pub async fn create_migrated_test_pool() -> MemoryResult<SqlitePool> {
    let pool = open_in_memory().await?;
    apply_schema(&pool).await?;
    Ok(pool)
}

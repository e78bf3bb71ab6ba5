//! Fleet database schema.
//!
//! The whole schema ships embedded in the binary and is applied
//! idempotently at startup: every statement is `IF NOT EXISTS`, and the
//! version stamped in `fleet_meta` lets this build refuse a database
//! written by a newer one instead of silently reinterpreting it.

use sqlx::SqlitePool;

use crate::domain::errors::{MemoryError, MemoryResult};

/// Schema version this build writes.
pub const SCHEMA_VERSION: i64 = 1;

const SCHEMA_SQL: &str = include_str!("../../../migrations/fleet_schema.sql");

/// Apply the embedded schema to a freshly opened database.
pub async fn apply_schema(pool: &SqlitePool) -> MemoryResult<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS fleet_meta (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
    )
    .execute(pool)
    .await?;

    if let Some(stored) = stored_schema_version(pool).await? {
        if stored > SCHEMA_VERSION {
            return Err(MemoryError::Io(format!(
                "database schema v{stored} is newer than this build (v{SCHEMA_VERSION})"
            )));
        }
    }

    sqlx::raw_sql(SCHEMA_SQL).execute(pool).await?;

    sqlx::query("INSERT OR REPLACE INTO fleet_meta (key, value) VALUES ('schema_version', ?)")
        .bind(SCHEMA_VERSION.to_string())
        .execute(pool)
        .await?;
    Ok(())
}

/// Schema version stamped in the database, if any.
pub async fn stored_schema_version(pool: &SqlitePool) -> MemoryResult<Option<i64>> {
    let row: Option<(String,)> =
        sqlx::query_as("SELECT value FROM fleet_meta WHERE key = 'schema_version'")
            .fetch_optional(pool)
            .await?;
    Ok(row.and_then(|(value,)| value.parse().ok()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sqlite::connection::open_in_memory;

    #[tokio::test]
    async fn test_apply_is_idempotent_and_stamps_version() {
        let pool = open_in_memory().await.unwrap();

        apply_schema(&pool).await.unwrap();
        apply_schema(&pool).await.unwrap();

        assert_eq!(
            stored_schema_version(&pool).await.unwrap(),
            Some(SCHEMA_VERSION)
        );

        // The fleet tables came up.
        sqlx::query("SELECT COUNT(*) FROM memory_entries")
            .fetch_one(&pool)
            .await
            .unwrap();
        sqlx::query("SELECT COUNT(*) FROM patterns")
            .fetch_one(&pool)
            .await
            .unwrap();
        sqlx::query("SELECT COUNT(*) FROM bus_events")
            .fetch_one(&pool)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_newer_database_is_rejected() {
        let pool = open_in_memory().await.unwrap();
        apply_schema(&pool).await.unwrap();

        sqlx::query("UPDATE fleet_meta SET value = ? WHERE key = 'schema_version'")
            .bind((SCHEMA_VERSION + 1).to_string())
            .execute(&pool)
            .await
            .unwrap();

        let err = apply_schema(&pool).await.unwrap_err();
        assert!(err.to_string().contains("newer than this build"));
    }
}

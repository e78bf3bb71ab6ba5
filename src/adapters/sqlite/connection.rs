//! Fleet database handle.
//!
//! The fleet owns exactly one SQLite file (plus in-memory databases for
//! tests), so there is no generic pool plumbing here: one set of
//! connect options tuned for the fleet's concurrent daemons, opened from
//! the configured path.

use std::path::Path;
use std::time::Duration;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::SqlitePool;

use crate::domain::errors::{MemoryError, MemoryResult};

/// Writers from the GC sweeper, learning flusher, and agents all share
/// the file; a generous busy timeout beats failing a flush.
const BUSY_TIMEOUT: Duration = Duration::from_secs(30);
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(3);

fn fleet_options(db_path: &Path) -> SqliteConnectOptions {
    SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .foreign_keys(true)
        .busy_timeout(BUSY_TIMEOUT)
}

/// Open (creating if missing) the fleet database at `db_path`.
///
/// Missing parent directories are created, and the connection is probed
/// once so an unusable path surfaces at init instead of on first use.
pub async fn open_fleet_db(db_path: &Path, max_connections: u32) -> MemoryResult<SqlitePool> {
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent).map_err(|e| {
                MemoryError::Io(format!("creating {}: {e}", parent.display()))
            })?;
        }
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections.max(1))
        .acquire_timeout(ACQUIRE_TIMEOUT)
        .connect_with(fleet_options(db_path))
        .await?;

    sqlx::query("SELECT 1").execute(&pool).await?;
    Ok(pool)
}

/// Single-connection in-memory database for tests.
pub async fn open_in_memory() -> MemoryResult<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(fleet_options(Path::new(":memory:")))
        .await?;
    Ok(pool)
}

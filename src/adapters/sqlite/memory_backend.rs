//! SQLite implementation of the memory backend port.
//!
//! Entries live in `memory_entries` keyed by `(partition, key)`; patterns
//! get their own table with a composite `(agent_id, confidence)` index so
//! agent-scoped queries stay sub-linear.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::domain::errors::{MemoryError, MemoryResult};
use crate::domain::models::{AgentId, BackendKind, BusEvent, MemoryEntry, Partition, Pattern};
use crate::domain::ports::{EventSink, MemoryBackend, WriteOp};

use super::{parse_datetime, parse_uuid};

#[derive(Clone)]
pub struct SqliteMemoryBackend {
    pool: SqlitePool,
}

impl SqliteMemoryBackend {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn exists(&self, partition: Partition, key: &str) -> MemoryResult<bool> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM memory_entries WHERE partition = ? AND key = ?")
                .bind(partition.as_str())
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.is_some())
    }
}

/// Escape `%` and `_` so a key prefix can be used in a LIKE clause.
fn escape_like_prefix(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len() + 4);
    for c in prefix.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('%');
    escaped
}

fn bind_entry<'q>(
    query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    entry: &'q MemoryEntry,
    metadata_json: &'q str,
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    query
        .bind(entry.partition.as_str())
        .bind(&entry.key)
        .bind(&entry.value)
        .bind(entry.ttl_ms.and_then(|v| i64::try_from(v).ok()))
        .bind(entry.agent_id.map(|a| a.to_string()))
        .bind(metadata_json)
        .bind(entry.created_at.to_rfc3339())
        .bind(entry.updated_at.to_rfc3339())
        .bind(entry.expires_at().map(|t| t.to_rfc3339()))
}

const INSERT_ENTRY_SQL: &str = "INSERT OR REPLACE INTO memory_entries \
     (partition, key, value, ttl_ms, agent_id, metadata, created_at, updated_at, expires_at) \
     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)";

#[async_trait]
impl MemoryBackend for SqliteMemoryBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Real
    }

    async fn put(&self, entry: MemoryEntry) -> MemoryResult<bool> {
        let existed = self.exists(entry.partition, &entry.key).await?;
        let metadata_json = serde_json::to_string(&entry.metadata)?;
        bind_entry(sqlx::query(INSERT_ENTRY_SQL), &entry, &metadata_json)
            .execute(&self.pool)
            .await?;
        Ok(!existed)
    }

    async fn get(&self, partition: Partition, key: &str) -> MemoryResult<Option<MemoryEntry>> {
        let row: Option<MemoryEntryRow> =
            sqlx::query_as("SELECT * FROM memory_entries WHERE partition = ? AND key = ?")
                .bind(partition.as_str())
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;

        row.map(TryInto::try_into).transpose()
    }

    async fn delete(&self, partition: Partition, key: &str) -> MemoryResult<bool> {
        let result = sqlx::query("DELETE FROM memory_entries WHERE partition = ? AND key = ?")
            .bind(partition.as_str())
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn scan(
        &self,
        partition: Partition,
        key_prefix: Option<&str>,
        limit: Option<usize>,
    ) -> MemoryResult<Vec<MemoryEntry>> {
        let limit = limit
            .and_then(|l| i64::try_from(l).ok())
            .unwrap_or(i64::MAX);

        let rows: Vec<MemoryEntryRow> = if let Some(prefix) = key_prefix {
            sqlx::query_as(
                "SELECT * FROM memory_entries \
                 WHERE partition = ? AND key LIKE ? ESCAPE '\\' \
                 ORDER BY key ASC LIMIT ?",
            )
            .bind(partition.as_str())
            .bind(escape_like_prefix(prefix))
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
        } else {
            sqlx::query_as(
                "SELECT * FROM memory_entries WHERE partition = ? ORDER BY key ASC LIMIT ?",
            )
            .bind(partition.as_str())
            .bind(limit)
            .fetch_all(&self.pool)
            .await?
        };

        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn apply_batch(&self, ops: Vec<WriteOp>) -> MemoryResult<()> {
        let mut tx = self.pool.begin().await?;
        for op in &ops {
            match op {
                WriteOp::Put(entry) => {
                    let metadata_json = serde_json::to_string(&entry.metadata)?;
                    bind_entry(sqlx::query(INSERT_ENTRY_SQL), entry, &metadata_json)
                        .execute(&mut *tx)
                        .await?;
                }
                WriteOp::Delete { partition, key } => {
                    sqlx::query("DELETE FROM memory_entries WHERE partition = ? AND key = ?")
                        .bind(partition.as_str())
                        .bind(key)
                        .execute(&mut *tx)
                        .await?;
                }
            }
        }
        tx.commit().await?;
        Ok(())
    }

    async fn prune_expired(&self, now: DateTime<Utc>) -> MemoryResult<u64> {
        let result = sqlx::query(
            "DELETE FROM memory_entries WHERE expires_at IS NOT NULL AND expires_at < ?",
        )
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn store_pattern(&self, pattern: &Pattern) -> MemoryResult<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO patterns \
             (id, agent_id, pattern_type, payload, confidence, success_count, failure_count, \
              created_at, last_used_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(pattern.id.to_string())
        .bind(pattern.agent_id.to_string())
        .bind(&pattern.pattern_type)
        .bind(&pattern.payload)
        .bind(pattern.confidence)
        .bind(i64::try_from(pattern.success_count).unwrap_or(i64::MAX))
        .bind(i64::try_from(pattern.failure_count).unwrap_or(i64::MAX))
        .bind(pattern.created_at.to_rfc3339())
        .bind(pattern.last_used_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_pattern(&self, id: Uuid) -> MemoryResult<Option<Pattern>> {
        let row: Option<PatternRow> = sqlx::query_as("SELECT * FROM patterns WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn patterns_by_agent(
        &self,
        agent_id: AgentId,
        min_confidence: f64,
        min_samples: u64,
    ) -> MemoryResult<Vec<Pattern>> {
        let rows: Vec<PatternRow> = sqlx::query_as(
            "SELECT * FROM patterns \
             WHERE agent_id = ? AND confidence >= ? \
               AND success_count + failure_count >= ? \
             ORDER BY confidence DESC, last_used_at DESC",
        )
        .bind(agent_id.to_string())
        .bind(min_confidence)
        .bind(i64::try_from(min_samples).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn find_pattern_by_type(
        &self,
        agent_id: AgentId,
        pattern_type: &str,
    ) -> MemoryResult<Option<Pattern>> {
        let row: Option<PatternRow> = sqlx::query_as(
            "SELECT * FROM patterns WHERE agent_id = ? AND pattern_type = ? LIMIT 1",
        )
        .bind(agent_id.to_string())
        .bind(pattern_type)
        .fetch_optional(&self.pool)
        .await?;
        row.map(TryInto::try_into).transpose()
    }

    async fn update_pattern(
        &self,
        id: Uuid,
        success: bool,
        now: DateTime<Utc>,
    ) -> MemoryResult<Pattern> {
        let mut pattern = self
            .get_pattern(id)
            .await?
            .ok_or(MemoryError::PatternNotFound(id))?;
        pattern.record_outcome(success, now);
        self.store_pattern(&pattern).await?;
        Ok(pattern)
    }

    async fn count_patterns(&self) -> MemoryResult<u64> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM patterns")
            .fetch_one(&self.pool)
            .await?;
        Ok(u64::try_from(row.0).unwrap_or(0))
    }
}

/// Event bus persistence hook backed by the same database file.
#[derive(Clone)]
pub struct SqliteEventSink {
    pool: SqlitePool,
}

impl SqliteEventSink {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventSink for SqliteEventSink {
    async fn append(&self, event: &BusEvent) -> MemoryResult<()> {
        let payload = serde_json::to_string(&event.payload)?;
        sqlx::query(
            "INSERT OR IGNORE INTO bus_events \
             (topic, sequence, payload, source_agent_id, published_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(event.topic.as_str())
        .bind(i64::try_from(event.sequence).unwrap_or(i64::MAX))
        .bind(payload)
        .bind(event.source_agent.map(|a| a.to_string()))
        .bind(event.published_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn latest_sequences(&self) -> MemoryResult<Vec<(String, u64)>> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT topic, MAX(sequence) FROM bus_events GROUP BY topic")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows
            .into_iter()
            .map(|(topic, seq)| (topic, u64::try_from(seq).unwrap_or(0)))
            .collect())
    }
}

#[derive(sqlx::FromRow)]
struct MemoryEntryRow {
    partition: String,
    key: String,
    value: Vec<u8>,
    ttl_ms: Option<i64>,
    agent_id: Option<String>,
    metadata: Option<String>,
    created_at: String,
    updated_at: String,
    #[allow(dead_code)]
    expires_at: Option<String>,
}

impl TryFrom<MemoryEntryRow> for MemoryEntry {
    type Error = MemoryError;

    fn try_from(row: MemoryEntryRow) -> Result<Self, Self::Error> {
        let partition = Partition::parse_str(&row.partition)?;
        let metadata = row
            .metadata
            .map(|m| serde_json::from_str(&m))
            .transpose()?
            .unwrap_or_default();
        let agent_id = row
            .agent_id
            .map(|s| parse_uuid(&s).map(AgentId))
            .transpose()?;

        Ok(MemoryEntry {
            partition,
            key: row.key,
            value: row.value,
            ttl_ms: row.ttl_ms.and_then(|v| u64::try_from(v).ok()),
            created_at: parse_datetime(&row.created_at)?,
            updated_at: parse_datetime(&row.updated_at)?,
            agent_id,
            metadata,
        })
    }
}

#[derive(sqlx::FromRow)]
struct PatternRow {
    id: String,
    agent_id: String,
    pattern_type: String,
    payload: Vec<u8>,
    confidence: f64,
    success_count: i64,
    failure_count: i64,
    created_at: String,
    last_used_at: String,
}

impl TryFrom<PatternRow> for Pattern {
    type Error = MemoryError;

    fn try_from(row: PatternRow) -> Result<Self, Self::Error> {
        Ok(Pattern {
            id: parse_uuid(&row.id)?,
            agent_id: AgentId(parse_uuid(&row.agent_id)?),
            pattern_type: row.pattern_type,
            payload: row.payload,
            confidence: row.confidence,
            success_count: u64::try_from(row.success_count).unwrap_or(0),
            failure_count: u64::try_from(row.failure_count).unwrap_or(0),
            created_at: parse_datetime(&row.created_at)?,
            last_used_at: parse_datetime(&row.last_used_at)?,
        })
    }
}

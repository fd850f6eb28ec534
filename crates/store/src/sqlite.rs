//! SQLite backend.
//!
//! One database file holds every session:
//! - `messages`: the append-only conversation log, keyed by (session, sort key)
//! - `metadata`: per-session JSON values
//! - `token_usage`: cumulative usage per (session, model)
//! - `sessions`: the derived session cost

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use std::sync::Arc;
use swerve_core::error::StoreError;
use swerve_core::message::{
    ContentBlock, MessageRecord, MessageType, NewMessage, RecordKey, Role, SessionId,
};
use swerve_core::provider::TokenUsage;
use swerve_core::store::{ConversationStore, MetadataStore, UsageLedger, UsageRecord};
use tracing::{debug, info};

use crate::keys::SortKeyClock;

/// A SQLite-backed conversation store.
pub struct SqliteStore {
    pool: SqlitePool,
    clock: Arc<SortKeyClock>,
}

impl SqliteStore {
    /// Open (or create) the database at `path`.
    ///
    /// Tables are created automatically.
    pub async fn new(path: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(path)
            .map_err(|e| StoreError::Storage(format!("Invalid SQLite path: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Storage(format!("Failed to open SQLite: {e}")))?;

        let store = Self::from_pool(pool).await?;
        info!("SQLite store initialized at {path}");
        Ok(store)
    }

    /// An ephemeral database on a single connection (useful for tests).
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| StoreError::Storage(format!("Invalid SQLite path: {e}")))?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Storage(format!("Failed to open SQLite: {e}")))?;
        Self::from_pool(pool).await
    }

    /// Create from an existing pool.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        let store = Self {
            pool,
            clock: Arc::new(SortKeyClock::new()),
        };
        store.run_migrations().await?;
        Ok(store)
    }

    /// The underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                session_id   TEXT NOT NULL,
                sort_key     TEXT NOT NULL,
                role         TEXT NOT NULL,
                message_type TEXT NOT NULL,
                content      TEXT NOT NULL,
                token_count  INTEGER NOT NULL DEFAULT 0,
                created_at   TEXT NOT NULL,
                PRIMARY KEY (session_id, sort_key)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::MigrationFailed(format!("messages table: {e}")))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS metadata (
                session_id TEXT NOT NULL,
                key        TEXT NOT NULL,
                value      TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (session_id, key)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::MigrationFailed(format!("metadata table: {e}")))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS token_usage (
                session_id         TEXT NOT NULL,
                model              TEXT NOT NULL,
                input_tokens       INTEGER NOT NULL DEFAULT 0,
                output_tokens      INTEGER NOT NULL DEFAULT 0,
                cache_read_tokens  INTEGER NOT NULL DEFAULT 0,
                cache_write_tokens INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (session_id, model)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::MigrationFailed(format!("token_usage table: {e}")))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                session_id   TEXT PRIMARY KEY,
                session_cost REAL NOT NULL DEFAULT 0.0,
                updated_at   TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::MigrationFailed(format!("sessions table: {e}")))?;

        debug!("SQLite migrations complete");
        Ok(())
    }

    /// Ids of every session with at least one record, oldest activity first.
    pub async fn sessions(&self) -> Result<Vec<SessionId>, StoreError> {
        let rows = sqlx::query(
            "SELECT session_id, MIN(sort_key) AS first_key FROM messages GROUP BY session_id ORDER BY first_key",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::QueryFailed(format!("list sessions: {e}")))?;

        rows.iter()
            .map(|row| {
                row.try_get::<String, _>("session_id")
                    .map(SessionId)
                    .map_err(|e| StoreError::QueryFailed(format!("session_id column: {e}")))
            })
            .collect()
    }

    fn new_key(&self, session_id: &SessionId, sort_key: String) -> RecordKey {
        RecordKey {
            session_id: session_id.clone(),
            sort_key,
        }
    }

    /// Parse a `MessageRecord` from a SQLite row.
    fn row_to_record(
        session_id: &SessionId,
        row: &sqlx::sqlite::SqliteRow,
    ) -> Result<MessageRecord, StoreError> {
        let sort_key: String = row
            .try_get("sort_key")
            .map_err(|e| StoreError::QueryFailed(format!("sort_key column: {e}")))?;
        let role: String = row
            .try_get("role")
            .map_err(|e| StoreError::QueryFailed(format!("role column: {e}")))?;
        let message_type: String = row
            .try_get("message_type")
            .map_err(|e| StoreError::QueryFailed(format!("message_type column: {e}")))?;
        let content: String = row
            .try_get("content")
            .map_err(|e| StoreError::QueryFailed(format!("content column: {e}")))?;
        let token_count: i64 = row
            .try_get("token_count")
            .map_err(|e| StoreError::QueryFailed(format!("token_count column: {e}")))?;

        let corrupt = |reason: String| StoreError::Corrupt {
            key: sort_key.clone(),
            reason,
        };

        let role = Role::parse(&role).ok_or_else(|| corrupt(format!("unknown role '{role}'")))?;
        let message_type = MessageType::parse(&message_type)
            .ok_or_else(|| corrupt(format!("unknown message type '{message_type}'")))?;
        let content: Vec<ContentBlock> =
            serde_json::from_str(&content).map_err(|e| corrupt(e.to_string()))?;

        Ok(MessageRecord {
            key: RecordKey {
                session_id: session_id.clone(),
                sort_key,
            },
            role,
            message_type,
            content,
            token_count,
        })
    }
}

const INSERT_MESSAGE: &str = r#"
    INSERT INTO messages (session_id, sort_key, role, message_type, content, token_count, created_at)
    VALUES (?, ?, ?, ?, ?, ?, ?)
"#;

fn encode_content(content: &[ContentBlock]) -> Result<String, StoreError> {
    serde_json::to_string(content)
        .map_err(|e| StoreError::Storage(format!("Failed to encode content: {e}")))
}

#[async_trait]
impl ConversationStore for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn append(
        &self,
        session_id: &SessionId,
        message: NewMessage,
    ) -> Result<MessageRecord, StoreError> {
        let record = message.into_record(self.new_key(session_id, self.clock.next()));
        let content = encode_content(&record.content)?;

        sqlx::query(INSERT_MESSAGE)
            .bind(&session_id.0)
            .bind(&record.key.sort_key)
            .bind(record.role.as_str())
            .bind(record.message_type.as_str())
            .bind(&content)
            .bind(record.token_count)
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Storage(format!("Insert failed: {e}")))?;

        debug!(session_id = %session_id, sort_key = %record.key.sort_key, "Appended record");
        Ok(record)
    }

    async fn append_atomic(
        &self,
        session_id: &SessionId,
        messages: Vec<NewMessage>,
    ) -> Result<Vec<MessageRecord>, StoreError> {
        let keys = self.clock.next_batch(messages.len());
        let records: Vec<MessageRecord> = messages
            .into_iter()
            .zip(keys)
            .map(|(message, sort_key)| message.into_record(self.new_key(session_id, sort_key)))
            .collect();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::Storage(format!("Begin transaction failed: {e}")))?;

        let now = Utc::now().to_rfc3339();
        for record in &records {
            let content = encode_content(&record.content)?;
            sqlx::query(INSERT_MESSAGE)
                .bind(&session_id.0)
                .bind(&record.key.sort_key)
                .bind(record.role.as_str())
                .bind(record.message_type.as_str())
                .bind(&content)
                .bind(record.token_count)
                .bind(&now)
                .execute(&mut *tx)
                .await
                .map_err(|e| StoreError::Storage(format!("Insert failed: {e}")))?;
        }

        // Dropping `tx` on an early return rolls everything back
        tx.commit()
            .await
            .map_err(|e| StoreError::Storage(format!("Commit failed: {e}")))?;

        debug!(session_id = %session_id, count = records.len(), "Appended records atomically");
        Ok(records)
    }

    async fn read_all(&self, session_id: &SessionId) -> Result<Vec<MessageRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT sort_key, role, message_type, content, token_count
            FROM messages
            WHERE session_id = ?
            ORDER BY sort_key ASC
            "#,
        )
        .bind(&session_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::QueryFailed(format!("read_all: {e}")))?;

        rows.iter()
            .map(|row| Self::row_to_record(session_id, row))
            .collect()
    }

    async fn backfill_token_count(
        &self,
        key: &RecordKey,
        token_count: i64,
    ) -> Result<(), StoreError> {
        let result =
            sqlx::query("UPDATE messages SET token_count = ? WHERE session_id = ? AND sort_key = ?")
                .bind(token_count)
                .bind(&key.session_id.0)
                .bind(&key.sort_key)
                .execute(&self.pool)
                .await
                .map_err(|e| StoreError::QueryFailed(format!("backfill: {e}")))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(key.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn read_metadata(
        &self,
        session_id: &SessionId,
        key: &str,
    ) -> Result<Option<serde_json::Value>, StoreError> {
        let row = sqlx::query("SELECT value FROM metadata WHERE session_id = ? AND key = ?")
            .bind(&session_id.0)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("read_metadata: {e}")))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let raw: String = row
            .try_get("value")
            .map_err(|e| StoreError::QueryFailed(format!("value column: {e}")))?;
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| StoreError::Corrupt {
                key: key.to_string(),
                reason: e.to_string(),
            })
    }

    async fn write_metadata(
        &self,
        session_id: &SessionId,
        key: &str,
        value: serde_json::Value,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO metadata (session_id, key, value, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(session_id, key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&session_id.0)
        .bind(key)
        .bind(value.to_string())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("write_metadata: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl UsageLedger for SqliteStore {
    async fn record_usage(
        &self,
        session_id: &SessionId,
        model: &str,
        usage: &TokenUsage,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO token_usage
                (session_id, model, input_tokens, output_tokens, cache_read_tokens, cache_write_tokens)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(session_id, model) DO UPDATE SET
                input_tokens = input_tokens + excluded.input_tokens,
                output_tokens = output_tokens + excluded.output_tokens,
                cache_read_tokens = cache_read_tokens + excluded.cache_read_tokens,
                cache_write_tokens = cache_write_tokens + excluded.cache_write_tokens
            "#,
        )
        .bind(&session_id.0)
        .bind(model)
        .bind(usage.input_tokens as i64)
        .bind(usage.output_tokens as i64)
        .bind(usage.cache_read_tokens as i64)
        .bind(usage.cache_write_tokens as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("record_usage: {e}")))?;
        Ok(())
    }

    async fn usage_records(&self, session_id: &SessionId) -> Result<Vec<UsageRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT model, input_tokens, output_tokens, cache_read_tokens, cache_write_tokens
            FROM token_usage
            WHERE session_id = ?
            ORDER BY model
            "#,
        )
        .bind(&session_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::QueryFailed(format!("usage_records: {e}")))?;

        rows.iter()
            .map(|row| {
                let get = |column: &str| -> Result<u64, StoreError> {
                    row.try_get::<i64, _>(column)
                        .map(|v| v.max(0) as u64)
                        .map_err(|e| StoreError::QueryFailed(format!("{column} column: {e}")))
                };
                Ok(UsageRecord {
                    model: row
                        .try_get("model")
                        .map_err(|e| StoreError::QueryFailed(format!("model column: {e}")))?,
                    usage: TokenUsage {
                        input_tokens: get("input_tokens")?,
                        output_tokens: get("output_tokens")?,
                        cache_read_tokens: get("cache_read_tokens")?,
                        cache_write_tokens: get("cache_write_tokens")?,
                    },
                })
            })
            .collect()
    }

    async fn set_session_cost(&self, session_id: &SessionId, cost: f64) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO sessions (session_id, session_cost, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(session_id) DO UPDATE SET
                session_cost = excluded.session_cost,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&session_id.0)
        .bind(cost)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(format!("set_session_cost: {e}")))?;
        Ok(())
    }

    async fn session_cost(&self, session_id: &SessionId) -> Result<f64, StoreError> {
        let row = sqlx::query("SELECT session_cost FROM sessions WHERE session_id = ?")
            .bind(&session_id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::QueryFailed(format!("session_cost: {e}")))?;

        match row {
            Some(row) => row
                .try_get("session_cost")
                .map_err(|e| StoreError::QueryFailed(format!("session_cost column: {e}"))),
            None => Ok(0.0),
        }
    }
}

//! Persistence boundary traits.
//!
//! The conversation log is append-only and ordered by sort key. The only
//! mutation after append is the token-count backfill on a single record.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::message::{MessageRecord, NewMessage, RecordKey, SessionId};
use crate::provider::TokenUsage;

type StoreResult<T> = std::result::Result<T, StoreError>;

/// The conversation store for one or many sessions.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Backend name for logging.
    fn name(&self) -> &str;

    /// Append one record; the store assigns its sort key.
    async fn append(&self, session_id: &SessionId, message: NewMessage)
    -> StoreResult<MessageRecord>;

    /// Append several records as one unit: either all become visible, in
    /// order, or none do.
    async fn append_atomic(
        &self,
        session_id: &SessionId,
        messages: Vec<NewMessage>,
    ) -> StoreResult<Vec<MessageRecord>>;

    /// Every record of the session, ascending by sort key.
    async fn read_all(&self, session_id: &SessionId) -> StoreResult<Vec<MessageRecord>>;

    /// Overwrite the token count of one record.
    async fn backfill_token_count(&self, key: &RecordKey, token_count: i64) -> StoreResult<()>;
}

/// Free-form per-session JSON metadata (todo list, cloned repository, ...).
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn read_metadata(
        &self,
        session_id: &SessionId,
        key: &str,
    ) -> StoreResult<Option<serde_json::Value>>;

    async fn write_metadata(
        &self,
        session_id: &SessionId,
        key: &str,
        value: serde_json::Value,
    ) -> StoreResult<()>;
}

/// Accumulated usage of one model within a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub model: String,
    pub usage: TokenUsage,
}

/// Per-session, per-model usage totals and the derived session cost.
#[async_trait]
pub trait UsageLedger: Send + Sync {
    /// Add `usage` to the running totals for `(session, model)`.
    async fn record_usage(
        &self,
        session_id: &SessionId,
        model: &str,
        usage: &TokenUsage,
    ) -> StoreResult<()>;

    async fn usage_records(&self, session_id: &SessionId) -> StoreResult<Vec<UsageRecord>>;

    async fn set_session_cost(&self, session_id: &SessionId, cost: f64) -> StoreResult<()>;

    async fn session_cost(&self, session_id: &SessionId) -> StoreResult<f64>;
}

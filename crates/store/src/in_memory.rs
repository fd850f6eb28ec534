//! In-memory store: useful for testing and ephemeral sessions.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use swerve_core::error::StoreError;
use swerve_core::message::{MessageRecord, NewMessage, RecordKey, SessionId};
use swerve_core::provider::TokenUsage;
use swerve_core::store::{ConversationStore, MetadataStore, UsageLedger, UsageRecord};
use tokio::sync::RwLock;

use crate::keys::SortKeyClock;

#[derive(Default)]
struct State {
    logs: HashMap<SessionId, Vec<MessageRecord>>,
    metadata: HashMap<(SessionId, String), serde_json::Value>,
    usage: HashMap<SessionId, Vec<UsageRecord>>,
    costs: HashMap<SessionId, f64>,
}

/// A store that keeps every session in process memory.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<RwLock<State>>,
    clock: Arc<SortKeyClock>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ids of every session with at least one record.
    pub async fn sessions(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.state.read().await.logs.keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl ConversationStore for InMemoryStore {
    fn name(&self) -> &str {
        "in_memory"
    }

    async fn append(
        &self,
        session_id: &SessionId,
        message: NewMessage,
    ) -> Result<MessageRecord, StoreError> {
        // Keys are taken under the lock so push order matches key order
        let mut state = self.state.write().await;
        let record = message.into_record(RecordKey {
            session_id: session_id.clone(),
            sort_key: self.clock.next(),
        });
        state
            .logs
            .entry(session_id.clone())
            .or_default()
            .push(record.clone());
        Ok(record)
    }

    async fn append_atomic(
        &self,
        session_id: &SessionId,
        messages: Vec<NewMessage>,
    ) -> Result<Vec<MessageRecord>, StoreError> {
        // One write lock for the whole batch
        let mut state = self.state.write().await;
        let keys = self.clock.next_batch(messages.len());
        let records: Vec<MessageRecord> = messages
            .into_iter()
            .zip(keys)
            .map(|(message, sort_key)| {
                message.into_record(RecordKey {
                    session_id: session_id.clone(),
                    sort_key,
                })
            })
            .collect();

        state
            .logs
            .entry(session_id.clone())
            .or_default()
            .extend(records.iter().cloned());
        Ok(records)
    }

    async fn read_all(&self, session_id: &SessionId) -> Result<Vec<MessageRecord>, StoreError> {
        Ok(self
            .state
            .read()
            .await
            .logs
            .get(session_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn backfill_token_count(
        &self,
        key: &RecordKey,
        token_count: i64,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let record = state
            .logs
            .get_mut(&key.session_id)
            .and_then(|log| log.iter_mut().find(|r| r.key.sort_key == key.sort_key))
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        record.token_count = token_count;
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for InMemoryStore {
    async fn read_metadata(
        &self,
        session_id: &SessionId,
        key: &str,
    ) -> Result<Option<serde_json::Value>, StoreError> {
        Ok(self
            .state
            .read()
            .await
            .metadata
            .get(&(session_id.clone(), key.to_string()))
            .cloned())
    }

    async fn write_metadata(
        &self,
        session_id: &SessionId,
        key: &str,
        value: serde_json::Value,
    ) -> Result<(), StoreError> {
        self.state
            .write()
            .await
            .metadata
            .insert((session_id.clone(), key.to_string()), value);
        Ok(())
    }
}

#[async_trait]
impl UsageLedger for InMemoryStore {
    async fn record_usage(
        &self,
        session_id: &SessionId,
        model: &str,
        usage: &TokenUsage,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let records = state.usage.entry(session_id.clone()).or_default();
        match records.iter_mut().find(|r| r.model == model) {
            Some(existing) => existing.usage.add(usage),
            None => records.push(UsageRecord {
                model: model.to_string(),
                usage: *usage,
            }),
        }
        Ok(())
    }

    async fn usage_records(&self, session_id: &SessionId) -> Result<Vec<UsageRecord>, StoreError> {
        Ok(self
            .state
            .read()
            .await
            .usage
            .get(session_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn set_session_cost(&self, session_id: &SessionId, cost: f64) -> Result<(), StoreError> {
        self.state
            .write()
            .await
            .costs
            .insert(session_id.clone(), cost);
        Ok(())
    }

    async fn session_cost(&self, session_id: &SessionId) -> Result<f64, StoreError> {
        Ok(self
            .state
            .read()
            .await
            .costs
            .get(session_id)
            .copied()
            .unwrap_or(0.0))
    }
}

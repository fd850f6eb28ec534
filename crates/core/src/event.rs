//! Live-update events emitted during a turn.
//!
//! The turn loop publishes what it is doing; a UI, CLI printer, or websocket
//! bridge subscribes and forwards. Events are fire-and-forget.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::message::SessionId;

/// Whether the worker for a session is busy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Working,
    Pending,
}

/// All turn events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TurnEvent {
    /// The model asked for a tool call
    ToolRequested {
        session_id: SessionId,
        tool_name: String,
        call_id: String,
        input: serde_json::Value,
        timestamp: DateTime<Utc>,
    },

    /// A tool call finished (successfully or with a rendered error)
    ToolCompleted {
        session_id: SessionId,
        tool_name: String,
        call_id: String,
        output: String,
        timestamp: DateTime<Utc>,
    },

    /// The agent sent an interim message to the user
    ProgressReported {
        session_id: SessionId,
        message: String,
        timestamp: DateTime<Utc>,
    },

    /// The model produced its final answer for this turn
    TurnCompleted {
        session_id: SessionId,
        text: String,
        timestamp: DateTime<Utc>,
    },

    StatusChanged {
        session_id: SessionId,
        status: AgentStatus,
        timestamp: DateTime<Utc>,
    },
}

impl TurnEvent {
    pub fn session_id(&self) -> &SessionId {
        match self {
            TurnEvent::ToolRequested { session_id, .. }
            | TurnEvent::ToolCompleted { session_id, .. }
            | TurnEvent::ProgressReported { session_id, .. }
            | TurnEvent::TurnCompleted { session_id, .. }
            | TurnEvent::StatusChanged { session_id, .. } => session_id,
        }
    }
}

/// A broadcast-based event bus for turn events.
///
/// Uses `tokio::sync::broadcast` for multi-consumer pub/sub.
pub struct EventBus {
    sender: broadcast::Sender<Arc<TurnEvent>>,
}

impl EventBus {
    /// Create a new event bus with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: TurnEvent) {
        // No subscribers is fine
        let _ = self.sender.send(Arc::new(event));
    }

    /// Subscribe to receive events.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<TurnEvent>> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

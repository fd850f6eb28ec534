//! Conversation log domain types.
//!
//! A session's history is an append-only list of [`MessageRecord`]s ordered by
//! sort key. Records are converted into [`ModelMessage`]s before each model
//! invocation; model messages are never persisted.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

/// Unique identifier for a session (one conversation, one worker).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Who authored a message, from the model's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            _ => None,
        }
    }
}

/// What a persisted record represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageType {
    /// A message typed by the human user
    UserMessage,
    /// A final assistant answer
    Assistant,
    /// An assistant message requesting one or more tool calls
    ToolUse,
    /// The user-role message carrying the results of a tool-use request
    ToolResult,
}

impl MessageType {
    /// The role a record of this type is sent to the model with.
    pub fn role(&self) -> Role {
        match self {
            MessageType::UserMessage | MessageType::ToolResult => Role::User,
            MessageType::Assistant | MessageType::ToolUse => Role::Assistant,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::UserMessage => "userMessage",
            MessageType::Assistant => "assistant",
            MessageType::ToolUse => "toolUse",
            MessageType::ToolResult => "toolResult",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "userMessage" => Some(MessageType::UserMessage),
            "assistant" => Some(MessageType::Assistant),
            "toolUse" => Some(MessageType::ToolUse),
            "toolResult" => Some(MessageType::ToolResult),
            _ => None,
        }
    }
}

/// One block of message content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        call_id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        call_id: String,
        content: Vec<ContentBlock>,
    },
    Image {
        /// Image format without the `image/` prefix (e.g. `png`)
        format: String,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    /// Prompt-cache boundary: the prefix up to here may be reused.
    CachePoint,
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ContentBlock::Text { text } => Some(text),
            _ => None,
        }
    }
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// Identifies a record: the session it belongs to plus its sort key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordKey {
    pub session_id: SessionId,
    pub sort_key: String,
}

impl std::fmt::Display for RecordKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.session_id, self.sort_key)
    }
}

/// A message that has not been persisted yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMessage {
    pub message_type: MessageType,
    pub content: Vec<ContentBlock>,
    #[serde(default)]
    pub token_count: i64,
}

impl NewMessage {
    pub fn new(message_type: MessageType, content: Vec<ContentBlock>, token_count: i64) -> Self {
        Self {
            message_type,
            content,
            token_count,
        }
    }

    /// A human-authored text message. Its token count is backfilled later.
    pub fn user_text(text: impl Into<String>) -> Self {
        Self::new(MessageType::UserMessage, vec![ContentBlock::text(text)], 0)
    }

    pub fn role(&self) -> Role {
        self.message_type.role()
    }

    /// Attach the key assigned by the store.
    pub fn into_record(self, key: RecordKey) -> MessageRecord {
        MessageRecord {
            key,
            role: self.message_type.role(),
            message_type: self.message_type,
            content: self.content,
            token_count: self.token_count,
        }
    }
}

/// A persisted conversation record.
///
/// Immutable once written, except for `token_count` which is backfilled with
/// a signed adjustment after the model reports its input usage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub key: RecordKey,
    pub role: Role,
    pub message_type: MessageType,
    pub content: Vec<ContentBlock>,
    pub token_count: i64,
}

impl MessageRecord {
    pub fn to_model_message(&self) -> ModelMessage {
        ModelMessage {
            role: self.role,
            content: self.content.clone(),
        }
    }

    /// Call ids of the tool-use blocks in this record.
    pub fn tool_use_ids(&self) -> Vec<&str> {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolUse { call_id, .. } => Some(call_id.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Call ids of the tool-result blocks in this record.
    pub fn tool_result_ids(&self) -> Vec<&str> {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolResult { call_id, .. } => Some(call_id.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Whether `next` answers every tool call requested by this record.
    pub fn is_answered_by(&self, next: &MessageRecord) -> bool {
        if self.message_type != MessageType::ToolUse || next.message_type != MessageType::ToolResult
        {
            return false;
        }
        let requested: HashSet<&str> = self.tool_use_ids().into_iter().collect();
        let answered: HashSet<&str> = next.tool_result_ids().into_iter().collect();
        requested == answered
    }
}

/// A model-ready message: one entry of the compacted turn input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMessage {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

impl ModelMessage {
    pub fn has_cache_point(&self) -> bool {
        matches!(self.content.last(), Some(ContentBlock::CachePoint))
    }

    /// Append a cache-point marker unless one already closes this message.
    pub fn mark_cache_point(&mut self) {
        if !self.has_cache_point() {
            self.content.push(ContentBlock::CachePoint);
        }
    }

    /// Concatenated text of all text blocks.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(ContentBlock::as_text)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

//! Model invocation boundary.
//!
//! A [`ModelClient`] knows how to send the compacted conversation, the system
//! prompt, and the tool catalogue to a tool-calling LLM endpoint and return
//! the stop reason, output message, and usage counters.
//!
//! Implementations: Anthropic Messages API (`swerve-providers`), scripted
//! mocks in tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;
use crate::message::{ContentBlock, ModelMessage, SessionId};

/// A tool definition sent to the LLM so it knows what tools it can call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// The tool name
    pub name: String,

    /// Description of what the tool does
    pub description: String,

    /// JSON Schema describing the tool's input
    pub input_schema: serde_json::Value,
}

/// The tool catalogue for one request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolConfig {
    pub tools: Vec<ToolDefinition>,

    /// Place a cache marker after the last tool definition.
    #[serde(default)]
    pub cache_point: bool,
}

/// The system prompt for one request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemPrompt {
    pub text: String,

    /// Place a cache marker after the system prompt.
    #[serde(default)]
    pub cache_point: bool,
}

/// Everything the model sees in one `converse` call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConverseRequest {
    pub messages: Vec<ModelMessage>,
    pub system: SystemPrompt,
    pub tool_config: ToolConfig,
}

/// Why the model stopped generating.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The model requests one or more tool calls
    ToolUse,
    /// The model produced its final answer
    EndTurn,
    /// The output budget ran out mid-generation
    MaxTokens,
    StopSequence,
    Other(String),
}

impl StopReason {
    pub fn parse(s: &str) -> Self {
        match s {
            "tool_use" => StopReason::ToolUse,
            "end_turn" => StopReason::EndTurn,
            "max_tokens" => StopReason::MaxTokens,
            "stop_sequence" => StopReason::StopSequence,
            other => StopReason::Other(other.to_string()),
        }
    }
}

/// Token usage counters reported by the endpoint for one call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_read_tokens: u64,
    #[serde(default)]
    pub cache_write_tokens: u64,
}

impl TokenUsage {
    /// Every prompt-side token the endpoint saw, cached or not.
    pub fn prompt_tokens(&self) -> u64 {
        self.input_tokens + self.cache_read_tokens + self.cache_write_tokens
    }

    pub fn add(&mut self, other: &TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cache_read_tokens += other.cache_read_tokens;
        self.cache_write_tokens += other.cache_write_tokens;
    }
}

/// A complete response from the model endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConverseResponse {
    pub stop_reason: StopReason,

    /// The generated assistant message. `None` is a contract violation when
    /// `stop_reason` is [`StopReason::ToolUse`].
    pub output: Option<ModelMessage>,

    pub usage: TokenUsage,

    /// Which model actually responded
    pub model: String,
}

impl ConverseResponse {
    /// The tool-use blocks of the output, in request order.
    pub fn tool_uses(&self) -> Vec<&ContentBlock> {
        self.output
            .as_ref()
            .map(|m| {
                m.content
                    .iter()
                    .filter(|b| matches!(b, ContentBlock::ToolUse { .. }))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// The model invocation boundary.
///
/// `models` is an ordered preference list; implementations may fall through
/// to the next model when one is throttled. `expansion` counts how many times
/// this turn has hit [`StopReason::MaxTokens`]; each increment doubles the
/// output-token budget.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// A human-readable name for this client (e.g., "anthropic").
    fn name(&self) -> &str;

    async fn converse(
        &self,
        session_id: &SessionId,
        models: &[String],
        request: &ConverseRequest,
        expansion: u32,
    ) -> std::result::Result<ConverseResponse, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_reason_parsing() {
        assert_eq!(StopReason::parse("tool_use"), StopReason::ToolUse);
        assert_eq!(StopReason::parse("max_tokens"), StopReason::MaxTokens);
        assert_eq!(
            StopReason::parse("refusal"),
            StopReason::Other("refusal".into())
        );
    }

    #[test]
    fn prompt_tokens_include_cache_counters() {
        let usage = TokenUsage {
            input_tokens: 100,
            output_tokens: 40,
            cache_read_tokens: 900,
            cache_write_tokens: 50,
        };
        assert_eq!(usage.prompt_tokens(), 1050);
    }

    #[test]
    fn tool_uses_preserve_order() {
        let response = ConverseResponse {
            stop_reason: StopReason::ToolUse,
            output: Some(ModelMessage {
                role: crate::message::Role::Assistant,
                content: vec![
                    ContentBlock::text("checking"),
                    ContentBlock::ToolUse {
                        call_id: "a".into(),
                        name: "first".into(),
                        input: serde_json::json!({}),
                    },
                    ContentBlock::ToolUse {
                        call_id: "b".into(),
                        name: "second".into(),
                        input: serde_json::json!({}),
                    },
                ],
            }),
            usage: TokenUsage::default(),
            model: "m".into(),
        };
        let names: Vec<_> = response
            .tool_uses()
            .into_iter()
            .filter_map(|b| match b {
                ContentBlock::ToolUse { name, .. } => Some(name.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(names, vec!["first", "second"]);
    }
}

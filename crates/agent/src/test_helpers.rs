//! Shared fixtures for turn-loop tests: a scripted model client and a
//! harness wiring it to an in-memory store and a small tool registry.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use swerve_core::cancel::CancellationToken;
use swerve_core::error::{ProviderError, ToolError};
use swerve_core::event::EventBus;
use swerve_core::message::{ContentBlock, ModelMessage, NewMessage, Role, SessionId};
use swerve_core::provider::{
    ConverseRequest, ConverseResponse, ModelClient, StopReason, TokenUsage,
};
use swerve_core::store::ConversationStore;
use swerve_core::tool::{Tool, ToolContext, ToolOutput, ToolProvider, ToolRegistry};
use swerve_store::InMemoryStore;
use swerve_telemetry::CostAccountant;

use crate::dispatcher::{ToolCall, ToolDispatcher, Toolset};
use crate::prompt::PromptBuilder;
use crate::turn::TurnLoop;

pub const TEST_MODEL: &str = "claude-sonnet-4-20250514";

/// One recorded `converse` call.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub request: ConverseRequest,
    pub expansion: u32,
}

/// A model client that returns scripted responses in order and records what
/// it was asked. Panics when the script runs out.
pub struct ScriptedModel {
    responses: Mutex<Vec<Result<ConverseResponse, ProviderError>>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl ScriptedModel {
    pub fn new(mut responses: Vec<Result<ConverseResponse, ProviderError>>) -> Self {
        responses.reverse();
        Self {
            responses: Mutex::new(responses),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ModelClient for ScriptedModel {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn converse(
        &self,
        _session_id: &SessionId,
        _models: &[String],
        request: &ConverseRequest,
        expansion: u32,
    ) -> Result<ConverseResponse, ProviderError> {
        self.requests.lock().unwrap().push(RecordedRequest {
            request: request.clone(),
            expansion,
        });
        self.responses
            .lock()
            .unwrap()
            .pop()
            .expect("ScriptedModel: no more responses")
    }
}

pub fn usage(input: u64, output: u64) -> TokenUsage {
    TokenUsage {
        input_tokens: input,
        output_tokens: output,
        cache_read_tokens: 0,
        cache_write_tokens: 0,
    }
}

pub fn text_response(text: &str, usage: TokenUsage) -> ConverseResponse {
    ConverseResponse {
        stop_reason: StopReason::EndTurn,
        output: Some(ModelMessage {
            role: Role::Assistant,
            content: vec![ContentBlock::text(text)],
        }),
        usage,
        model: TEST_MODEL.into(),
    }
}

pub fn tool_use_response(calls: Vec<(&str, &str)>, usage: TokenUsage) -> ConverseResponse {
    let content = calls
        .into_iter()
        .map(|(call_id, name)| ContentBlock::ToolUse {
            call_id: call_id.into(),
            name: name.into(),
            input: serde_json::json!({}),
        })
        .collect();
    ConverseResponse {
        stop_reason: StopReason::ToolUse,
        output: Some(ModelMessage {
            role: Role::Assistant,
            content,
        }),
        usage,
        model: TEST_MODEL.into(),
    }
}

pub fn truncated_response(usage: TokenUsage) -> ConverseResponse {
    ConverseResponse {
        stop_reason: StopReason::MaxTokens,
        output: Some(ModelMessage {
            role: Role::Assistant,
            content: vec![ContentBlock::text("partial")],
        }),
        usage,
        model: TEST_MODEL.into(),
    }
}

pub fn tool_call(call_id: &str, name: &str) -> ToolCall {
    ToolCall {
        call_id: call_id.into(),
        name: name.into(),
        input: serde_json::json!({}),
    }
}

/// `runTests`: always reports three passing tests.
struct RunTestsTool;

#[async_trait]
impl Tool for RunTestsTool {
    fn name(&self) -> &str {
        "runTests"
    }
    fn description(&self) -> &str {
        "Runs the test suite"
    }
    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({"type": "object"})
    }
    async fn execute(
        &self,
        _input: serde_json::Value,
        _ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        Ok("3 passed".into())
    }
}

/// `cancelTurn`: sets the token, as a user pressing stop mid-turn would.
struct CancelTool {
    token: CancellationToken,
}

#[async_trait]
impl Tool for CancelTool {
    fn name(&self) -> &str {
        "cancelTurn"
    }
    fn description(&self) -> &str {
        "Cancels the running turn"
    }
    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({"type": "object"})
    }
    async fn execute(
        &self,
        _input: serde_json::Value,
        _ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        self.token.cancel();
        Ok("stopping".into())
    }
}

pub struct Harness {
    pub store: Arc<InMemoryStore>,
    pub model: Arc<ScriptedModel>,
    pub events: Arc<EventBus>,
    registry: Arc<ToolRegistry>,
}

impl Harness {
    pub fn new(script: Vec<Result<ConverseResponse, ProviderError>>) -> Self {
        Self::build(script, ToolRegistry::new().with(Arc::new(RunTestsTool)))
    }

    pub fn with_cancel_tool(
        script: Vec<Result<ConverseResponse, ProviderError>>,
        token: CancellationToken,
    ) -> Self {
        Self::build(
            script,
            ToolRegistry::new()
                .with(Arc::new(RunTestsTool))
                .with(Arc::new(CancelTool { token })),
        )
    }

    fn build(script: Vec<Result<ConverseResponse, ProviderError>>, registry: ToolRegistry) -> Self {
        Self {
            store: Arc::new(InMemoryStore::new()),
            model: Arc::new(ScriptedModel::new(script)),
            events: Arc::new(EventBus::default()),
            registry: Arc::new(registry),
        }
    }

    /// Create a session holding one user message.
    pub async fn seed(&self, text: &str) -> SessionId {
        let session = SessionId::new();
        self.store
            .append(&session, NewMessage::user_text(text))
            .await
            .unwrap();
        session
    }

    pub fn turn(&self) -> TurnLoop {
        let local: Arc<dyn ToolProvider> = self.registry.clone();
        let dispatcher = ToolDispatcher::new(
            Toolset::from_providers(vec![local]),
            self.events.clone(),
        );
        TurnLoop::new(
            self.store.clone(),
            self.model.clone(),
            dispatcher,
            PromptBuilder::new(self.store.clone()).with_base("You are a test agent."),
            CostAccountant::new(self.store.clone()),
            self.events.clone(),
        )
    }
}

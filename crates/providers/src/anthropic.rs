//! Anthropic native provider implementation.
//!
//! Uses Anthropic's Messages API directly.
//!
//! Features:
//! - `x-api-key` header authentication (not Bearer)
//! - `anthropic-version` header
//! - System prompt as a top-level block list with optional `cache_control`
//! - Cache points mapped onto `cache_control: ephemeral` of the preceding block
//! - Native tool use with `tool_use` / `tool_result` content blocks
//! - Output budget doubled per expansion step, up to a cap
//! - Model preference list with fall-through on throttling

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use swerve_core::error::ProviderError;
use swerve_core::message::{ContentBlock, ModelMessage, Role, SessionId};
use swerve_core::provider::*;
use tracing::{debug, warn};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const DEFAULT_MAX_TOKENS: u32 = 8192;
const DEFAULT_MAX_TOKENS_CAP: u32 = 64000;
const DEFAULT_RETRY_AFTER_SECS: u64 = 5;

/// Anthropic native Messages API provider.
pub struct AnthropicProvider {
    name: String,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
    max_output_tokens: u32,
    max_output_tokens_cap: u32,
    temperature: f32,
}

impl AnthropicProvider {
    /// Create a new Anthropic provider.
    pub fn new(api_key: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(600)) // long generations
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            name: "anthropic".into(),
            base_url: DEFAULT_BASE_URL.into(),
            api_key: api_key.into(),
            client,
            max_output_tokens: DEFAULT_MAX_TOKENS,
            max_output_tokens_cap: DEFAULT_MAX_TOKENS_CAP,
            temperature: 0.0,
        }
    }

    /// Create with a custom base URL (e.g., for testing or proxies).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Output budget before expansion, and the ceiling expansion stops at.
    pub fn with_output_budget(mut self, base: u32, cap: u32) -> Self {
        self.max_output_tokens = base;
        self.max_output_tokens_cap = cap.max(base);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// `base * 2^expansion`, capped.
    fn max_tokens_for(&self, expansion: u32) -> u32 {
        let factor = 1u64.checked_shl(expansion).unwrap_or(u64::MAX);
        let tokens = (self.max_output_tokens as u64).saturating_mul(factor);
        tokens.min(self.max_output_tokens_cap as u64) as u32
    }

    /// Convert one content block. Cache points are handled by the caller.
    fn to_api_block(block: &ContentBlock) -> Option<ApiBlock> {
        match block {
            ContentBlock::Text { text } if text.trim().is_empty() => None,
            ContentBlock::Text { text } => Some(ApiBlock::Text {
                text: text.clone(),
                cache_control: None,
            }),
            ContentBlock::Image { format, data } => Some(ApiBlock::Image {
                source: ImageSource {
                    kind: "base64",
                    media_type: format!("image/{format}"),
                    data: STANDARD.encode(data),
                },
                cache_control: None,
            }),
            ContentBlock::ToolUse {
                call_id,
                name,
                input,
            } => Some(ApiBlock::ToolUse {
                id: call_id.clone(),
                name: name.clone(),
                input: input.clone(),
                cache_control: None,
            }),
            ContentBlock::ToolResult { call_id, content } => Some(ApiBlock::ToolResult {
                tool_use_id: call_id.clone(),
                content: content.iter().filter_map(Self::to_api_block).collect(),
                cache_control: None,
            }),
            ContentBlock::CachePoint => None,
        }
    }

    /// Convert a block list, turning each cache point into `cache_control`
    /// on the block before it.
    fn to_api_blocks(content: &[ContentBlock]) -> Vec<ApiBlock> {
        let mut blocks: Vec<ApiBlock> = Vec::new();
        for block in content {
            if matches!(block, ContentBlock::CachePoint) {
                if let Some(last) = blocks.last_mut() {
                    last.mark_cached();
                }
                continue;
            }
            if let Some(api_block) = Self::to_api_block(block) {
                blocks.push(api_block);
            }
        }
        blocks
    }

    /// Convert messages to Anthropic API format, merging consecutive
    /// messages of the same role.
    fn to_api_messages(messages: &[ModelMessage]) -> Vec<ApiMessage> {
        let mut result: Vec<ApiMessage> = Vec::new();

        for msg in messages {
            let role = msg.role.as_str();
            let blocks = Self::to_api_blocks(&msg.content);
            if blocks.is_empty() {
                continue;
            }
            match result.last_mut() {
                Some(prev) if prev.role == role => prev.content.extend(blocks),
                _ => result.push(ApiMessage {
                    role: role.to_string(),
                    content: blocks,
                }),
            }
        }

        result
    }

    fn to_api_system(system: &SystemPrompt) -> Vec<ApiBlock> {
        if system.text.is_empty() {
            return Vec::new();
        }
        vec![ApiBlock::Text {
            text: system.text.clone(),
            cache_control: system.cache_point.then_some(CacheControl::EPHEMERAL),
        }]
    }

    /// Convert tool definitions to Anthropic format.
    fn to_api_tools(config: &ToolConfig) -> Vec<ApiTool> {
        let mut tools: Vec<ApiTool> = config
            .tools
            .iter()
            .map(|t| ApiTool {
                name: t.name.clone(),
                description: t.description.clone(),
                input_schema: t.input_schema.clone(),
                cache_control: None,
            })
            .collect();
        if config.cache_point {
            if let Some(last) = tools.last_mut() {
                last.cache_control = Some(CacheControl::EPHEMERAL);
            }
        }
        tools
    }

    fn build_body(&self, model: &str, request: &ConverseRequest, expansion: u32) -> ApiRequest {
        let system = Self::to_api_system(&request.system);
        ApiRequest {
            model: model.to_string(),
            max_tokens: self.max_tokens_for(expansion),
            temperature: self.temperature,
            system: (!system.is_empty()).then_some(system),
            messages: Self::to_api_messages(&request.messages),
            tools: Self::to_api_tools(&request.tool_config),
        }
    }

    async fn send(
        &self,
        model: &str,
        body: &ApiRequest,
    ) -> std::result::Result<ConverseResponse, ProviderError> {
        let url = format!("{}/v1/messages", self.base_url);

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout(e.to_string())
                } else {
                    ProviderError::Network(e.to_string())
                }
            })?;

        let status = response.status().as_u16();

        // 529 is Anthropic's "overloaded", throttling by another name
        if status == 429 || status == 529 {
            let retry_after_secs = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(DEFAULT_RETRY_AFTER_SECS);
            return Err(ProviderError::RateLimited { retry_after_secs });
        }
        if status == 401 || status == 403 {
            return Err(ProviderError::AuthenticationFailed(
                "Invalid Anthropic API key".into(),
            ));
        }
        if status == 404 {
            return Err(ProviderError::ModelNotFound(model.to_string()));
        }
        if status != 200 {
            let error_body = response.text().await.unwrap_or_default();
            warn!(status, body = %error_body, "Anthropic API error");
            return Err(ProviderError::ApiError {
                status_code: status,
                message: error_body,
            });
        }

        let api_resp: ApiResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::ApiError {
                status_code: 200,
                message: format!("Failed to parse Anthropic response: {e}"),
            })?;

        Ok(Self::parse_response(api_resp))
    }

    fn parse_response(resp: ApiResponse) -> ConverseResponse {
        let content: Vec<ContentBlock> = resp
            .content
            .into_iter()
            .filter_map(|block| match block {
                ResponseBlock::Text { text } => Some(ContentBlock::Text { text }),
                ResponseBlock::ToolUse { id, name, input } => Some(ContentBlock::ToolUse {
                    call_id: id,
                    name,
                    input,
                }),
                // Reasoning blocks are not carried into the log
                ResponseBlock::Other => None,
            })
            .collect();

        let usage = TokenUsage {
            input_tokens: resp.usage.input_tokens,
            output_tokens: resp.usage.output_tokens,
            cache_read_tokens: resp.usage.cache_read_input_tokens.unwrap_or(0),
            cache_write_tokens: resp.usage.cache_creation_input_tokens.unwrap_or(0),
        };

        ConverseResponse {
            stop_reason: StopReason::parse(resp.stop_reason.as_deref().unwrap_or("end_turn")),
            output: Some(ModelMessage {
                role: Role::Assistant,
                content,
            }),
            usage,
            model: resp.model,
        }
    }
}

#[async_trait]
impl ModelClient for AnthropicProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn converse(
        &self,
        session_id: &SessionId,
        models: &[String],
        request: &ConverseRequest,
        expansion: u32,
    ) -> std::result::Result<ConverseResponse, ProviderError> {
        if models.is_empty() {
            return Err(ProviderError::NotConfigured(
                "no model in the preference list".into(),
            ));
        }

        let mut last_error = None;
        for (i, model) in models.iter().enumerate() {
            let body = self.build_body(model, request, expansion);
            debug!(
                provider = "anthropic",
                session_id = %session_id,
                model = %model,
                max_tokens = body.max_tokens,
                messages = body.messages.len(),
                "Sending converse request"
            );

            match self.send(model, &body).await {
                Err(e @ ProviderError::RateLimited { .. }) if i + 1 < models.len() => {
                    warn!(model = %model, next = %models[i + 1], "Model throttled, trying next preference");
                    last_error = Some(e);
                }
                other => return other,
            }
        }

        Err(last_error.unwrap_or(ProviderError::RateLimited {
            retry_after_secs: DEFAULT_RETRY_AFTER_SECS,
        }))
    }
}

// --- Anthropic API types ---

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
struct CacheControl {
    #[serde(rename = "type")]
    kind: &'static str,
}

impl CacheControl {
    const EPHEMERAL: CacheControl = CacheControl { kind: "ephemeral" };
}

#[derive(Debug, Serialize)]
struct ApiRequest {
    model: String,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<Vec<ApiBlock>>,
    messages: Vec<ApiMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ApiTool>,
}

#[derive(Debug, Serialize)]
struct ApiMessage {
    role: String,
    content: Vec<ApiBlock>,
}

#[derive(Debug, Serialize)]
struct ImageSource {
    #[serde(rename = "type")]
    kind: &'static str,
    media_type: String,
    data: String,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ApiBlock {
    Text {
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        cache_control: Option<CacheControl>,
    },
    Image {
        source: ImageSource,
        #[serde(skip_serializing_if = "Option::is_none")]
        cache_control: Option<CacheControl>,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        cache_control: Option<CacheControl>,
    },
    ToolResult {
        tool_use_id: String,
        content: Vec<ApiBlock>,
        #[serde(skip_serializing_if = "Option::is_none")]
        cache_control: Option<CacheControl>,
    },
}

impl ApiBlock {
    fn mark_cached(&mut self) {
        match self {
            ApiBlock::Text { cache_control, .. }
            | ApiBlock::Image { cache_control, .. }
            | ApiBlock::ToolUse { cache_control, .. }
            | ApiBlock::ToolResult { cache_control, .. } => {
                *cache_control = Some(CacheControl::EPHEMERAL)
            }
        }
    }

    #[cfg(test)]
    fn is_cached(&self) -> bool {
        match self {
            ApiBlock::Text { cache_control, .. }
            | ApiBlock::Image { cache_control, .. }
            | ApiBlock::ToolUse { cache_control, .. }
            | ApiBlock::ToolResult { cache_control, .. } => cache_control.is_some(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ApiTool {
    name: String,
    description: String,
    input_schema: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    cache_control: Option<CacheControl>,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    model: String,
    content: Vec<ResponseBlock>,
    stop_reason: Option<String>,
    usage: ApiUsage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResponseBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    input_tokens: u64,
    output_tokens: u64,
    #[serde(default)]
    cache_read_input_tokens: Option<u64>,
    #[serde(default)]
    cache_creation_input_tokens: Option<u64>,
}

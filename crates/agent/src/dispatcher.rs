//! Tool dispatch for one model response.
//!
//! Resolves each requested call against the external tool servers first and
//! the local registry second, runs the calls, and turns every outcome
//! (success, invalid input, error, panic) into a `toolResult` block. Nothing
//! escapes this boundary as an error.

use chrono::Utc;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use swerve_core::error::ToolError;
use swerve_core::event::{EventBus, TurnEvent};
use swerve_core::message::{ContentBlock, SessionId};
use swerve_core::provider::{ToolConfig, ToolDefinition};
use swerve_core::tool::{ToolContext, ToolOutput, ToolProvider};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

const PROGRESS_NUDGE: &str = "Long time has passed since you sent the last message. \
Please use sendMessageToUser tool to send a response asap.";

/// One requested call, taken from a `toolUse` block.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub call_id: String,
    pub name: String,
    pub input: serde_json::Value,
}

impl ToolCall {
    /// The calls of a model message, in request order.
    pub fn from_blocks(blocks: &[ContentBlock]) -> Vec<ToolCall> {
        blocks
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolUse {
                    call_id,
                    name,
                    input,
                } => Some(ToolCall {
                    call_id: call_id.clone(),
                    name: name.clone(),
                    input: input.clone(),
                }),
                _ => None,
            })
            .collect()
    }
}

/// The tool providers visible to a turn, in resolution order.
#[derive(Clone)]
pub struct Toolset {
    providers: Vec<Arc<dyn ToolProvider>>,
}

impl Toolset {
    /// External tools shadow local tools of the same name.
    pub fn new(external: Arc<dyn ToolProvider>, local: Arc<dyn ToolProvider>) -> Self {
        Self {
            providers: vec![external, local],
        }
    }

    pub fn from_providers(providers: Vec<Arc<dyn ToolProvider>>) -> Self {
        Self { providers }
    }

    /// The provider that answers `name`.
    pub fn resolve(&self, name: &str) -> Option<&Arc<dyn ToolProvider>> {
        self.providers
            .iter()
            .find(|p| p.definitions().iter().any(|d| d.name == name))
    }

    /// One definition per tool name, from the provider that resolves it.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut seen = std::collections::HashSet::new();
        self.providers
            .iter()
            .flat_map(|p| p.definitions())
            .filter(|d| seen.insert(d.name.clone()))
            .collect()
    }

    /// The catalogue for a request, closed by a cache marker.
    pub fn tool_config(&self) -> ToolConfig {
        ToolConfig {
            tools: self.definitions(),
            cache_point: true,
        }
    }
}

/// When the agent last reported progress during this turn.
#[derive(Debug, Default)]
pub struct ProgressClock {
    last_report: Mutex<Option<Instant>>,
}

impl ProgressClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&self) {
        *self
            .last_report
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Instant::now());
    }

    /// Never having reported counts as overdue.
    pub fn is_overdue(&self, idle: Duration) -> bool {
        match *self
            .last_report
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
        {
            Some(at) => at.elapsed() > idle,
            None => true,
        }
    }
}

/// What a dispatch round produced.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    /// One `toolResult` block per call, in request order
    pub results: Vec<ContentBlock>,
    /// A tool changed something the system prompt depends on
    pub refresh_prompt: bool,
}

struct CallOutcome {
    result: Result<ToolOutput, String>,
    reports_progress: bool,
    refreshes_prompt: bool,
}

/// Runs the tool calls of one model response.
pub struct ToolDispatcher {
    toolset: Toolset,
    events: Arc<EventBus>,
    progress_idle: Duration,
    parallel: bool,
}

impl ToolDispatcher {
    pub fn new(toolset: Toolset, events: Arc<EventBus>) -> Self {
        Self {
            toolset,
            events,
            progress_idle: Duration::from_secs(300),
            parallel: true,
        }
    }

    pub fn with_progress_idle(mut self, idle: Duration) -> Self {
        self.progress_idle = idle;
        self
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn toolset(&self) -> &Toolset {
        &self.toolset
    }

    /// Run every call and wait for all of them.
    pub async fn dispatch(
        &self,
        session_id: &SessionId,
        calls: &[ToolCall],
        progress: &ProgressClock,
    ) -> DispatchOutcome {
        for call in calls {
            self.events.publish(TurnEvent::ToolRequested {
                session_id: session_id.clone(),
                tool_name: call.name.clone(),
                call_id: call.call_id.clone(),
                input: call.input.clone(),
                timestamp: Utc::now(),
            });
        }

        let outcomes: Vec<CallOutcome> = if self.parallel && calls.len() > 1 {
            futures::future::join_all(calls.iter().map(|c| self.run_one(session_id, c))).await
        } else {
            let mut outcomes = Vec::with_capacity(calls.len());
            for call in calls {
                outcomes.push(self.run_one(session_id, call).await);
            }
            outcomes
        };

        let mut results = Vec::with_capacity(calls.len());
        let mut refresh_prompt = false;
        for (call, outcome) in calls.iter().zip(outcomes) {
            if outcome.result.is_ok() {
                if outcome.reports_progress {
                    progress.mark();
                }
                refresh_prompt |= outcome.refreshes_prompt;
            }

            let nudge = progress.is_overdue(self.progress_idle);
            let preview = match &outcome.result {
                Ok(output) => output.preview(),
                Err(message) => message.clone(),
            };
            let content = match outcome.result {
                Ok(ToolOutput::Blocks(blocks)) => blocks,
                Ok(ToolOutput::Text(text)) | Err(text) => {
                    vec![ContentBlock::text(render_result(&text, nudge))]
                }
            };

            self.events.publish(TurnEvent::ToolCompleted {
                session_id: session_id.clone(),
                tool_name: call.name.clone(),
                call_id: call.call_id.clone(),
                output: preview,
                timestamp: Utc::now(),
            });

            results.push(ContentBlock::ToolResult {
                call_id: call.call_id.clone(),
                content,
            });
        }

        DispatchOutcome {
            results,
            refresh_prompt,
        }
    }

    async fn run_one(&self, session_id: &SessionId, call: &ToolCall) -> CallOutcome {
        let Some(provider) = self.toolset.resolve(&call.name) else {
            warn!(tool = %call.name, "Model requested an unknown tool");
            return CallOutcome {
                result: Err(render_error(&call.name, &ToolError::NotFound(call.name.clone()))),
                reports_progress: false,
                refreshes_prompt: false,
            };
        };

        let ctx = ToolContext {
            tool_call_id: call.call_id.clone(),
            session_id: session_id.clone(),
        };
        info!(
            session_id = %session_id,
            tool = %call.name,
            call_id = %call.call_id,
            provider = %provider.name(),
            "Using tool"
        );

        let start = Instant::now();
        let result = AssertUnwindSafe(provider.invoke(&call.name, call.input.clone(), &ctx))
            .catch_unwind()
            .await;
        let duration_ms = start.elapsed().as_millis() as u64;

        let result = match result {
            Ok(Ok(output)) => {
                debug!(tool = %call.name, duration_ms, "Tool finished");
                Ok(output)
            }
            Ok(Err(e)) => {
                warn!(tool = %call.name, duration_ms, error = %e, "Tool failed");
                Err(render_error(&call.name, &e))
            }
            Err(panic) => {
                let message = panic_message(&panic);
                error!(tool = %call.name, panic = %message, "Tool panicked");
                Err(format!(
                    "Error occurred when using tool {}: {message}",
                    call.name
                ))
            }
        };

        CallOutcome {
            result,
            reports_progress: provider.reports_progress(&call.name),
            refreshes_prompt: provider.refreshes_prompt(&call.name),
        }
    }
}

fn render_error(tool_name: &str, error: &ToolError) -> String {
    match error {
        ToolError::InvalidArguments(reason) => format!("Invalid input: {reason}"),
        other => format!("Error occurred when using tool {tool_name}: {other}"),
    }
}

/// Wrap a textual result, adding the progress nudge when overdue.
pub fn render_result(result: &str, nudge: bool) -> String {
    let command = if nudge { PROGRESS_NUDGE } else { "" };
    format!("<result>\n{result}\n</result>\n<command>\n{command}\n</command>")
        .trim()
        .to_string()
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    panic
        .downcast_ref::<String>()
        .map(|s| s.as_str())
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic")
        .to_string()
}

//! sendMessageToUser: interim progress reports.
//!
//! The message goes out on the event bus; the dispatcher notices the call
//! and resets its progress clock.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use swerve_core::error::ToolError;
use swerve_core::event::{EventBus, TurnEvent};
use swerve_core::tool::{Tool, ToolContext, ToolOutput};

pub struct SendMessageTool {
    events: Arc<EventBus>,
}

impl SendMessageTool {
    pub fn new(events: Arc<EventBus>) -> Self {
        Self { events }
    }
}

#[async_trait]
impl Tool for SendMessageTool {
    fn name(&self) -> &str {
        "sendMessageToUser"
    }

    fn description(&self) -> &str {
        "Send any message to the user. This is especially valuable if the message contains \
         any information the user want to know, such as how you are solving the problem now. \
         Without this tool, a user cannot know your progress because message is only sent when \
         you finished using tools and end your turn."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "message": {
                    "type": "string",
                    "description": "The message to send"
                }
            },
            "required": ["message"]
        })
    }

    async fn execute(
        &self,
        input: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let message = input["message"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'message' argument".into()))?;

        self.events.publish(TurnEvent::ProgressReported {
            session_id: ctx.session_id.clone(),
            message: message.to_string(),
            timestamp: Utc::now(),
        });

        Ok("Successfully sent a message.".into())
    }

    fn reports_progress(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use swerve_core::message::SessionId;

    #[tokio::test]
    async fn publishes_progress_event() {
        let bus = Arc::new(EventBus::default());
        let mut rx = bus.subscribe();
        let tool = SendMessageTool::new(bus.clone());

        let ctx = ToolContext {
            tool_call_id: "t1".into(),
            session_id: SessionId::from("s1"),
        };
        let out = tool
            .execute(serde_json::json!({"message": "Cloning now"}), &ctx)
            .await
            .unwrap();
        assert_eq!(out, ToolOutput::Text("Successfully sent a message.".into()));
        assert!(tool.reports_progress());

        let event = rx.recv().await.unwrap();
        match event.as_ref() {
            TurnEvent::ProgressReported { message, session_id, .. } => {
                assert_eq!(message, "Cloning now");
                assert_eq!(session_id.as_str(), "s1");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}

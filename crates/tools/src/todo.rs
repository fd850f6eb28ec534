//! todoInit / todoUpdate: the agent's execution plan.
//!
//! The list lives in session metadata under `todo-list`, so it survives a
//! restarted worker and is visible to anything reading the session.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use swerve_core::error::ToolError;
use swerve_core::message::SessionId;
use swerve_core::store::MetadataStore;
use swerve_core::tool::{Tool, ToolContext, ToolOutput};

pub const TODO_METADATA_KEY: &str = "todo-list";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    Pending,
    InProgress,
    Completed,
    Cancelled,
}

impl TodoStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TodoStatus::Pending => "pending",
            TodoStatus::InProgress => "in_progress",
            TodoStatus::Completed => "completed",
            TodoStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TodoItem {
    pub id: String,
    pub description: String,
    pub status: TodoStatus,
    /// Milliseconds since the epoch
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TodoList {
    pub items: Vec<TodoItem>,
    pub last_updated: i64,
}

impl TodoList {
    pub fn new(descriptions: Vec<String>, now_ms: i64) -> Self {
        let items = descriptions
            .into_iter()
            .enumerate()
            .map(|(i, description)| TodoItem {
                id: format!("task-{}", i + 1),
                description,
                status: TodoStatus::Pending,
                created_at: now_ms,
                updated_at: now_ms,
            })
            .collect();
        Self {
            items,
            last_updated: now_ms,
        }
    }

    /// Apply one status change, returning the updated list or why it was refused.
    pub fn update(
        &self,
        id: &str,
        status: TodoStatus,
        description: Option<&str>,
        now_ms: i64,
    ) -> Result<TodoList, String> {
        if !self.items.iter().any(|item| item.id == id) {
            return Err(format!("Task {id} not found."));
        }

        let items: Vec<TodoItem> = self
            .items
            .iter()
            .map(|item| {
                if item.id != id {
                    return item.clone();
                }
                TodoItem {
                    status,
                    description: description
                        .filter(|d| !d.is_empty())
                        .map_or_else(|| item.description.clone(), str::to_string),
                    updated_at: now_ms,
                    ..item.clone()
                }
            })
            .collect();

        let in_progress = items
            .iter()
            .filter(|item| item.status == TodoStatus::InProgress)
            .count();
        if in_progress > 1 {
            return Err("Only one task can be in progress at a time.".into());
        }

        Ok(TodoList {
            items,
            last_updated: now_ms,
        })
    }

    pub fn to_markdown(&self) -> String {
        if self.items.is_empty() {
            return String::new();
        }
        let mut markdown = String::from("## Todo List\n");
        for item in &self.items {
            let checked = if item.status == TodoStatus::Completed {
                'x'
            } else {
                ' '
            };
            markdown.push_str(&format!(
                "- [{checked}] {}: {} ({})\n",
                item.id,
                item.description,
                item.status.as_str()
            ));
        }
        markdown
    }
}

async fn load(
    metadata: &dyn MetadataStore,
    session_id: &SessionId,
) -> Result<Option<TodoList>, ToolError> {
    let Some(value) = metadata
        .read_metadata(session_id, TODO_METADATA_KEY)
        .await
        .map_err(|e| failed(e.to_string()))?
    else {
        return Ok(None);
    };
    serde_json::from_value(value)
        .map(Some)
        .map_err(|e| failed(format!("stored todo list is unreadable: {e}")))
}

async fn save(
    metadata: &dyn MetadataStore,
    session_id: &SessionId,
    list: &TodoList,
) -> Result<(), ToolError> {
    let value = serde_json::to_value(list).map_err(|e| failed(e.to_string()))?;
    metadata
        .write_metadata(session_id, TODO_METADATA_KEY, value)
        .await
        .map_err(|e| failed(e.to_string()))
}

fn failed(reason: String) -> ToolError {
    ToolError::ExecutionFailed {
        tool_name: "todo".into(),
        reason,
    }
}

// ── todoInit ──────────────────────────────────────────────────────────────

pub struct TodoInitTool {
    metadata: Arc<dyn MetadataStore>,
}

impl TodoInitTool {
    pub fn new(metadata: Arc<dyn MetadataStore>) -> Self {
        Self { metadata }
    }
}

#[async_trait]
impl Tool for TodoInitTool {
    fn name(&self) -> &str {
        "todoInit"
    }

    fn description(&self) -> &str {
        "Create a todo list for the current task, replacing any existing one. Use it to plan \
         multi-step work and track progress with todoUpdate."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "items": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Task descriptions in execution order"
                }
            },
            "required": ["items"]
        })
    }

    async fn execute(
        &self,
        input: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let items: Vec<String> = serde_json::from_value(input["items"].clone())
            .map_err(|e| ToolError::InvalidArguments(format!("items: {e}")))?;

        let list = TodoList::new(items, Utc::now().timestamp_millis());
        save(self.metadata.as_ref(), &ctx.session_id, &list).await?;

        Ok(format!("Todo list created.\n\n{}", list.to_markdown())
            .trim()
            .to_string()
            .into())
    }
}

// ── todoUpdate ────────────────────────────────────────────────────────────

pub struct TodoUpdateTool {
    metadata: Arc<dyn MetadataStore>,
}

impl TodoUpdateTool {
    pub fn new(metadata: Arc<dyn MetadataStore>) -> Self {
        Self { metadata }
    }
}

#[async_trait]
impl Tool for TodoUpdateTool {
    fn name(&self) -> &str {
        "todoUpdate"
    }

    fn description(&self) -> &str {
        "Update the status (and optionally the description) of one task in the todo list. \
         Only one task may be in progress at a time."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "id": {
                    "type": "string",
                    "description": "Task id, e.g. task-1"
                },
                "status": {
                    "type": "string",
                    "enum": ["pending", "in_progress", "completed", "cancelled"]
                },
                "description": {
                    "type": "string",
                    "description": "Replacement description"
                }
            },
            "required": ["id", "status"]
        })
    }

    async fn execute(
        &self,
        input: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let id = input["id"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'id' argument".into()))?;
        let status: TodoStatus = serde_json::from_value(input["status"].clone())
            .map_err(|e| ToolError::InvalidArguments(format!("status: {e}")))?;
        let description = input["description"].as_str();

        let Some(current) = load(self.metadata.as_ref(), &ctx.session_id).await? else {
            return Ok("Update failed: No todo list exists. Please create one first.".into());
        };

        match current.update(id, status, description, Utc::now().timestamp_millis()) {
            Ok(updated) => {
                save(self.metadata.as_ref(), &ctx.session_id, &updated).await?;
                Ok(format!(
                    "Task {id} updated to status: {}\n\n{}",
                    status.as_str(),
                    updated.to_markdown()
                )
                .trim()
                .to_string()
                .into())
            }
            Err(reason) => Ok(format!(
                "Update failed: {reason}\n\nCurrent todo list:\n{}",
                current.to_markdown()
            )
            .trim()
            .to_string()
            .into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use swerve_store::InMemoryStore;

    fn ctx() -> ToolContext {
        ToolContext {
            tool_call_id: "t1".into(),
            session_id: SessionId::from("s1"),
        }
    }

    #[test]
    fn markdown_marks_completed_items() {
        let list = TodoList::new(vec!["read code".into(), "fix bug".into()], 0)
            .update("task-1", TodoStatus::Completed, None, 1)
            .unwrap();
        assert_eq!(
            list.to_markdown(),
            "## Todo List\n- [x] task-1: read code (completed)\n- [ ] task-2: fix bug (pending)\n"
        );
        assert_eq!(list.last_updated, 1);
        assert_eq!(list.items[1].updated_at, 0);
    }

    #[test]
    fn two_in_progress_is_refused() {
        let list = TodoList::new(vec!["a".into(), "b".into()], 0)
            .update("task-1", TodoStatus::InProgress, None, 1)
            .unwrap();
        let err = list
            .update("task-2", TodoStatus::InProgress, None, 2)
            .unwrap_err();
        assert_eq!(err, "Only one task can be in progress at a time.");
        assert!(list.update("task-9", TodoStatus::Completed, None, 2).is_err());
    }

    #[tokio::test]
    async fn init_then_update_persists() {
        let store = Arc::new(InMemoryStore::new());
        let init = TodoInitTool::new(store.clone());
        let update = TodoUpdateTool::new(store.clone());

        init.execute(serde_json::json!({"items": ["clone", "test"]}), &ctx())
            .await
            .unwrap();
        let out = update
            .execute(
                serde_json::json!({"id": "task-2", "status": "in_progress", "description": "run tests"}),
                &ctx(),
            )
            .await
            .unwrap();
        assert!(out.preview().starts_with("Task task-2 updated to status: in_progress"));

        let stored = store
            .read_metadata(&SessionId::from("s1"), TODO_METADATA_KEY)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored["items"][1]["description"], "run tests");
        assert_eq!(stored["items"][1]["status"], "in_progress");
        assert!(stored["lastUpdated"].is_i64());
    }

    #[tokio::test]
    async fn update_without_list_explains() {
        let update = TodoUpdateTool::new(Arc::new(InMemoryStore::new()));
        let out = update
            .execute(serde_json::json!({"id": "task-1", "status": "completed"}), &ctx())
            .await
            .unwrap();
        assert_eq!(
            out.preview(),
            "Update failed: No todo list exists. Please create one first."
        );
    }

    #[tokio::test]
    async fn refused_update_shows_current_list() {
        let store = Arc::new(InMemoryStore::new());
        TodoInitTool::new(store.clone())
            .execute(serde_json::json!({"items": ["a", "b"]}), &ctx())
            .await
            .unwrap();
        let update = TodoUpdateTool::new(store);
        update
            .execute(serde_json::json!({"id": "task-1", "status": "in_progress"}), &ctx())
            .await
            .unwrap();
        let out = update
            .execute(serde_json::json!({"id": "task-2", "status": "in_progress"}), &ctx())
            .await
            .unwrap();
        let text = out.preview();
        assert!(text.starts_with("Update failed: Only one task"));
        assert!(text.contains("Current todo list:\n## Todo List"));
        assert!(text.contains("task-1: a (in_progress)"));
    }
}

//! Built-in tool implementations for swerve.
//!
//! Tools give the agent the ability to act in its sandbox: run shell
//! commands, clone the repository it works on, keep a todo list, and tell
//! the user how it is getting on. External tools come from MCP servers
//! started by [`mcp::connect_all`].

pub mod command;
pub mod mcp;
pub mod progress;
pub mod repository;
pub mod todo;

use std::sync::Arc;
use std::time::Duration;
use swerve_config::ToolsConfig;
use swerve_core::event::EventBus;
use swerve_core::store::MetadataStore;
use swerve_core::tool::ToolRegistry;

pub use command::ExecuteCommandTool;
pub use mcp::{StdioMcpClient, connect_all};
pub use progress::SendMessageTool;
pub use repository::CloneRepositoryTool;
pub use todo::{TodoInitTool, TodoUpdateTool};

/// Create a registry with every built-in tool.
pub fn default_registry(
    config: &ToolsConfig,
    metadata: Arc<dyn MetadataStore>,
    events: Arc<EventBus>,
) -> ToolRegistry {
    let timeout = Duration::from_secs(config.shell_timeout_secs);
    ToolRegistry::new()
        .with(Arc::new(ExecuteCommandTool::new(
            config.working_directory.clone(),
            timeout,
        )))
        .with(Arc::new(CloneRepositoryTool::new(
            config.working_directory.clone(),
            metadata.clone(),
            timeout,
        )))
        .with(Arc::new(SendMessageTool::new(events)))
        .with(Arc::new(TodoInitTool::new(metadata.clone())))
        .with(Arc::new(TodoUpdateTool::new(metadata)))
}

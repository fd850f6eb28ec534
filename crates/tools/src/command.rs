//! executeCommand: run a shell command in the working directory.
//!
//! Output is returned as text even when the command fails, so the model can
//! read the error and react. A few commands get a follow-up suggestion
//! appended (e.g. check CI after pushing).

use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use swerve_core::error::ToolError;
use swerve_core::tool::{Tool, ToolContext, ToolOutput};
use tokio::process::Command;
use tracing::{debug, warn};

/// Characters kept from each end of an oversized output.
const MAX_OUTPUT_CHARS: usize = 40_000;

/// Execute shell commands with a timeout.
pub struct ExecuteCommandTool {
    working_directory: PathBuf,
    timeout: Duration,
}

impl ExecuteCommandTool {
    pub fn new(working_directory: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            working_directory: working_directory.into(),
            timeout,
        }
    }

    fn resolve_cwd(&self, cwd: Option<&str>) -> PathBuf {
        match cwd {
            Some(dir) if !dir.is_empty() => {
                let path = PathBuf::from(dir);
                if path.is_absolute() {
                    path
                } else {
                    self.working_directory.join(path)
                }
            }
            _ => self.working_directory.clone(),
        }
    }
}

#[async_trait]
impl Tool for ExecuteCommandTool {
    fn name(&self) -> &str {
        "executeCommand"
    }

    fn description(&self) -> &str {
        "Execute a shell command and return stdout/stderr. Use this for running programs, \
         inspecting and editing files, git and gh operations, building and testing."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute"
                },
                "cwd": {
                    "type": "string",
                    "description": "Directory to run in, absolute or relative to the working directory"
                }
            },
            "required": ["command"]
        })
    }

    async fn execute(
        &self,
        input: serde_json::Value,
        _ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let command = input["command"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'command' argument".into()))?;
        let cwd = self.resolve_cwd(input["cwd"].as_str());

        debug!(command = %command, cwd = %cwd.display(), "Executing shell command");

        let child = Command::new("sh")
            .args(["-c", command])
            .current_dir(&cwd)
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(self.timeout, child).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(ToolError::ExecutionFailed {
                    tool_name: self.name().into(),
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                warn!(command = %command, "Command timed out");
                return Err(ToolError::Timeout {
                    tool_name: self.name().into(),
                    timeout_secs: self.timeout.as_secs(),
                });
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let success = output.status.success();

        let mut text = if success {
            if stderr.is_empty() {
                stdout.to_string()
            } else {
                format!("{stdout}\n[stderr]: {stderr}")
            }
        } else {
            let code = output.status.code().unwrap_or(-1);
            warn!(command = %command, exit_code = code, "Command failed");
            format!("[exit code: {code}]\n{stdout}\n{stderr}")
        };
        text = truncate_middle(text.trim(), MAX_OUTPUT_CHARS);

        if let Some(suggestion) = generate_suggestion(command, success) {
            text = format!("{text}\n\n{suggestion}");
        }

        Ok(ToolOutput::Text(text))
    }
}

/// Follow-up reminders for commands whose success implies more work.
pub fn generate_suggestion(command: &str, success: bool) -> Option<String> {
    if !success {
        return None;
    }

    let mut suggestions = Vec::new();
    if command.contains("gh pr create") {
        suggestions.push(
            "Remember, when you successfully created a PR, make sure you report its URL to the \
             user. Also check the CI status and fix the code until it passes.",
        );
    }
    if command.contains("git push") {
        suggestions.push(
            "Remember, when you pushed commits to a git pull request, make sure you check the \
             CI status and fix the code until it passes.",
        );
    }

    if suggestions.is_empty() {
        None
    } else {
        Some(suggestions.join("\n"))
    }
}

/// Keep the head and tail of `text` when it exceeds `max` characters.
fn truncate_middle(text: &str, max: usize) -> String {
    let count = text.chars().count();
    if count <= max {
        return text.to_string();
    }
    let half = max / 2;
    let head: String = text.chars().take(half).collect();
    let tail: String = text.chars().skip(count - half).collect();
    format!(
        "{head}\n\n... ({} characters omitted) ...\n\n{tail}",
        count - 2 * half
    )
}

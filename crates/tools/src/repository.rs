//! cloneRepository: check out the repository the session works on.
//!
//! On success the clone location is written to the session's `repo`
//! metadata, which the prompt builder reads to load repository knowledge.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use swerve_core::error::ToolError;
use swerve_core::store::MetadataStore;
use swerve_core::tool::{Tool, ToolContext, ToolOutput};
use tokio::process::Command;
use tracing::info;

/// Metadata key holding `{repository, repoDirectory}`.
pub const REPO_METADATA_KEY: &str = "repo";

pub struct CloneRepositoryTool {
    working_directory: PathBuf,
    metadata: Arc<dyn MetadataStore>,
    timeout: Duration,
}

impl CloneRepositoryTool {
    pub fn new(
        working_directory: impl Into<PathBuf>,
        metadata: Arc<dyn MetadataStore>,
        timeout: Duration,
    ) -> Self {
        Self {
            working_directory: working_directory.into(),
            metadata,
            timeout,
        }
    }
}

/// The URL to hand to `git clone`. `owner/repo` shorthand means GitHub.
pub fn clone_url(repository: &str) -> String {
    let repository = repository.trim();
    let is_shorthand = !repository.contains("://")
        && !repository.starts_with("git@")
        && !repository.starts_with('/')
        && !repository.starts_with('.')
        && repository.split('/').count() == 2;

    if is_shorthand {
        format!("https://github.com/{repository}.git")
    } else {
        repository.to_string()
    }
}

/// The directory name a clone of `repository` lands in.
pub fn directory_name(repository: &str) -> String {
    let trimmed = repository.trim().trim_end_matches('/');
    let last = trimmed
        .rsplit(['/', ':'])
        .next()
        .unwrap_or(trimmed);
    last.strip_suffix(".git").unwrap_or(last).to_string()
}

#[async_trait]
impl Tool for CloneRepositoryTool {
    fn name(&self) -> &str {
        "cloneRepository"
    }

    fn description(&self) -> &str {
        "Clone a git repository into the working directory. Accepts `owner/repo` for GitHub \
         repositories or any URL git understands. Call this before working on a repository."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "repository": {
                    "type": "string",
                    "description": "`owner/repo` or a clone URL"
                },
                "branch": {
                    "type": "string",
                    "description": "Branch to check out (defaults to the remote HEAD)"
                }
            },
            "required": ["repository"]
        })
    }

    async fn execute(
        &self,
        input: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let repository = input["repository"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'repository' argument".into()))?;
        let name = directory_name(repository);
        if name.is_empty() {
            return Err(ToolError::InvalidArguments(format!(
                "cannot derive a directory name from '{repository}'"
            )));
        }

        let target = self.working_directory.join(&name);
        if target.exists() {
            return Err(self.failed(format!(
                "{} already exists; work in it or remove it first",
                target.display()
            )));
        }
        tokio::fs::create_dir_all(&self.working_directory)
            .await
            .map_err(|e| self.failed(e.to_string()))?;

        let mut cmd = Command::new("git");
        cmd.arg("clone");
        if let Some(branch) = input["branch"].as_str().filter(|b| !b.is_empty()) {
            cmd.args(["--branch", branch]);
        }
        cmd.arg(clone_url(repository))
            .arg(&target)
            .current_dir(&self.working_directory)
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| ToolError::Timeout {
                tool_name: self.name().into(),
                timeout_secs: self.timeout.as_secs(),
            })?
            .map_err(|e| self.failed(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(self.failed(stderr.trim().to_string()));
        }

        self.record(ctx, repository, &target).await?;
        info!(
            session_id = %ctx.session_id,
            repository = %repository,
            directory = %target.display(),
            "Repository cloned"
        );

        Ok(format!(
            "Successfully cloned {repository} into {}",
            target.display()
        )
        .into())
    }

    fn refreshes_prompt(&self) -> bool {
        true
    }
}

impl CloneRepositoryTool {
    fn failed(&self, reason: String) -> ToolError {
        ToolError::ExecutionFailed {
            tool_name: "cloneRepository".into(),
            reason,
        }
    }

    async fn record(
        &self,
        ctx: &ToolContext,
        repository: &str,
        directory: &Path,
    ) -> Result<(), ToolError> {
        self.metadata
            .write_metadata(
                &ctx.session_id,
                REPO_METADATA_KEY,
                serde_json::json!({
                    "repository": repository,
                    "repoDirectory": directory.to_string_lossy(),
                }),
            )
            .await
            .map_err(|e| self.failed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use swerve_core::message::SessionId;
    use swerve_store::InMemoryStore;

    fn ctx() -> ToolContext {
        ToolContext {
            tool_call_id: "t1".into(),
            session_id: SessionId::from("s1"),
        }
    }

    #[test]
    fn shorthand_expands_to_github() {
        assert_eq!(clone_url("acme/widgets"), "https://github.com/acme/widgets.git");
        assert_eq!(
            clone_url("https://gitlab.com/acme/widgets.git"),
            "https://gitlab.com/acme/widgets.git"
        );
        assert_eq!(clone_url("git@github.com:acme/widgets.git"), "git@github.com:acme/widgets.git");
        assert_eq!(clone_url("/srv/git/widgets"), "/srv/git/widgets");
    }

    #[test]
    fn directory_from_any_form() {
        assert_eq!(directory_name("acme/widgets"), "widgets");
        assert_eq!(directory_name("https://github.com/acme/widgets.git"), "widgets");
        assert_eq!(directory_name("git@github.com:acme/widgets.git"), "widgets");
        assert_eq!(directory_name("/srv/git/widgets/"), "widgets");
    }

    #[tokio::test]
    async fn failed_clone_writes_no_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(InMemoryStore::new());
        let tool = CloneRepositoryTool::new(dir.path(), store.clone(), Duration::from_secs(30));

        let missing = dir.path().join("does-not-exist");
        let err = tool
            .execute(
                serde_json::json!({"repository": missing.to_string_lossy()}),
                &ctx(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::ExecutionFailed { .. }));
        assert!(store
            .read_metadata(&SessionId::from("s1"), REPO_METADATA_KEY)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn existing_target_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("widgets")).unwrap();
        let tool = CloneRepositoryTool::new(
            dir.path(),
            Arc::new(InMemoryStore::new()),
            Duration::from_secs(30),
        );
        let err = tool
            .execute(serde_json::json!({"repository": "acme/widgets"}), &ctx())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("already exists"));
        assert!(tool.refreshes_prompt());
    }
}

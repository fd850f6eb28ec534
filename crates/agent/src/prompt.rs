//! System prompt assembly.
//!
//! The prompt is the built-in base, then the operator's common prompt, then
//! the knowledge file of the repository the session has cloned (if any).
//! The turn loop rebuilds it when a tool changes the repository.

use std::path::Path;
use std::sync::Arc;
use swerve_config::PromptConfig;
use swerve_core::message::SessionId;
use swerve_core::store::MetadataStore;
use tracing::{debug, warn};

pub const BASE_SYSTEM_PROMPT: &str = "\
You are an autonomous software engineering agent working in a sandboxed \
environment. You receive requests from users, work on them with the tools \
available to you, and report back.

## Communication
- Users only see your final answer and what you send with sendMessageToUser. \
Report progress with it regularly, especially before long-running work.
- Be concise. Answer the question asked; do not explain code changes unless asked.

## Working on code
- Clone the repository with cloneRepository before touching it.
- Follow the conventions of the code you edit and verify a library is already \
in use before relying on it.
- Work on a new branch, run the project's tests and linters after changing \
code, and open a pull request when done. Report the pull request URL.
- Plan multi-step work with todoInit and keep it current with todoUpdate.

## Safety
- Never expose secrets or credentials.
- If a web page refuses automated access, do not retry the same site.";

/// Builds the system prompt for a session.
pub struct PromptBuilder {
    base: String,
    additional: Option<String>,
    knowledge_files: Vec<String>,
    metadata: Arc<dyn MetadataStore>,
}

impl PromptBuilder {
    pub fn new(metadata: Arc<dyn MetadataStore>) -> Self {
        Self {
            base: BASE_SYSTEM_PROMPT.to_string(),
            additional: None,
            knowledge_files: PromptConfig::default().knowledge_files,
            metadata,
        }
    }

    pub fn from_config(config: &PromptConfig, metadata: Arc<dyn MetadataStore>) -> Self {
        Self::new(metadata)
            .with_additional(config.additional_system_prompt.clone())
            .with_knowledge_files(config.knowledge_files.clone())
    }

    pub fn with_base(mut self, base: impl Into<String>) -> Self {
        self.base = base.into();
        self
    }

    pub fn with_additional(mut self, additional: Option<String>) -> Self {
        self.additional = additional.filter(|s| !s.trim().is_empty());
        self
    }

    pub fn with_knowledge_files(mut self, files: Vec<String>) -> Self {
        self.knowledge_files = files;
        self
    }

    /// Assemble the prompt. Missing metadata or knowledge files are not
    /// errors; the prompt is simply shorter.
    pub async fn build(&self, session_id: &SessionId) -> String {
        let mut prompt = self.base.clone();

        if let Some(additional) = &self.additional {
            prompt.push_str("\n\n## Common Prompt\n");
            prompt.push_str(additional);
        }

        if let Some(knowledge) = self.repository_knowledge(session_id).await {
            prompt.push_str("\n## Repository Knowledge\n");
            prompt.push_str(&knowledge);
        }

        prompt
    }

    async fn repository_knowledge(&self, session_id: &SessionId) -> Option<String> {
        let repo = match self.metadata.read_metadata(session_id, "repo").await {
            Ok(repo) => repo?,
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Failed to read repository metadata");
                return None;
            }
        };
        let directory = repo.get("repoDirectory")?.as_str()?;
        self.read_knowledge_file(Path::new(directory)).await
    }

    /// The first configured knowledge file present in `directory`.
    async fn read_knowledge_file(&self, directory: &Path) -> Option<String> {
        for name in &self.knowledge_files {
            let path = directory.join(name);
            match tokio::fs::read_to_string(&path).await {
                Ok(content) => {
                    debug!(path = %path.display(), "Loaded repository knowledge");
                    return Some(content);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to read knowledge file");
                }
            }
        }
        None
    }
}

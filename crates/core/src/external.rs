//! External tool servers.
//!
//! An [`ExternalToolProvider`] is a connection to an out-of-process tool
//! server (e.g. an MCP server over stdio). [`ExternalTools`] aggregates the
//! servers that connected successfully and exposes their tools as a single
//! [`ToolProvider`].

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::ToolError;
use crate::message::ContentBlock;
use crate::provider::ToolDefinition;
use crate::tool::{ToolContext, ToolOutput, ToolProvider};

/// A connected external tool server.
#[async_trait]
pub trait ExternalToolProvider: Send + Sync {
    /// Server name as configured.
    fn name(&self) -> &str;

    async fn list_tools(&self) -> std::result::Result<Vec<ToolDefinition>, ToolError>;

    async fn call_tool(
        &self,
        tool_name: &str,
        input: serde_json::Value,
    ) -> std::result::Result<Vec<ContentBlock>, ToolError>;

    /// Release the connection. Must be safe to call more than once.
    async fn shutdown(&self);
}

/// The discovered tools of every connected external server.
#[derive(Default)]
pub struct ExternalTools {
    servers: Vec<Arc<dyn ExternalToolProvider>>,
    definitions: Vec<ToolDefinition>,
    /// tool name -> index into `servers`
    owners: HashMap<String, usize>,
}

impl ExternalTools {
    pub fn empty() -> Self {
        Self::default()
    }

    /// List the tools of each server. A server whose listing fails is shut
    /// down and skipped; it never fails the whole discovery.
    pub async fn discover(providers: Vec<Arc<dyn ExternalToolProvider>>) -> Self {
        let mut tools = Self::default();

        for provider in providers {
            match provider.list_tools().await {
                Ok(definitions) => {
                    let index = tools.servers.len();
                    info!(
                        server = %provider.name(),
                        tools = definitions.len(),
                        "External tool server ready"
                    );
                    for def in definitions {
                        if tools.owners.contains_key(&def.name) {
                            warn!(
                                server = %provider.name(),
                                tool = %def.name,
                                "Duplicate external tool name, keeping first"
                            );
                            continue;
                        }
                        tools.owners.insert(def.name.clone(), index);
                        tools.definitions.push(def);
                    }
                    tools.servers.push(provider);
                }
                Err(e) => {
                    warn!(server = %provider.name(), error = %e, "Skipping external tool server");
                    provider.shutdown().await;
                }
            }
        }

        tools
    }

    pub fn find(&self, tool_name: &str) -> Option<&Arc<dyn ExternalToolProvider>> {
        self.owners.get(tool_name).map(|&i| &self.servers[i])
    }

    pub fn server_count(&self) -> usize {
        self.servers.len()
    }

    pub async fn shutdown(&self) {
        for server in &self.servers {
            server.shutdown().await;
        }
    }
}

#[async_trait]
impl ToolProvider for ExternalTools {
    fn name(&self) -> &str {
        "external"
    }

    fn definitions(&self) -> Vec<ToolDefinition> {
        self.definitions.clone()
    }

    async fn invoke(
        &self,
        tool_name: &str,
        input: serde_json::Value,
        _ctx: &ToolContext,
    ) -> std::result::Result<ToolOutput, ToolError> {
        let server = self
            .find(tool_name)
            .ok_or_else(|| ToolError::NotFound(tool_name.to_string()))?;
        let blocks = server.call_tool(tool_name, input).await?;
        Ok(ToolOutput::Blocks(blocks))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::SessionId;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeServer {
        name: String,
        tools: Option<Vec<&'static str>>,
        shutdowns: AtomicUsize,
    }

    impl FakeServer {
        fn new(name: &str, tools: Option<Vec<&'static str>>) -> Arc<Self> {
            Arc::new(Self {
                name: name.into(),
                tools,
                shutdowns: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ExternalToolProvider for FakeServer {
        fn name(&self) -> &str {
            &self.name
        }

        async fn list_tools(&self) -> std::result::Result<Vec<ToolDefinition>, ToolError> {
            match &self.tools {
                Some(names) => Ok(names
                    .iter()
                    .map(|n| ToolDefinition {
                        name: n.to_string(),
                        description: String::new(),
                        input_schema: serde_json::json!({"type": "object"}),
                    })
                    .collect()),
                None => Err(ToolError::External {
                    server: self.name.clone(),
                    reason: "boom".into(),
                }),
            }
        }

        async fn call_tool(
            &self,
            tool_name: &str,
            _input: serde_json::Value,
        ) -> std::result::Result<Vec<ContentBlock>, ToolError> {
            Ok(vec![ContentBlock::text(format!("{}:{tool_name}", self.name))])
        }

        async fn shutdown(&self) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn failing_server_is_skipped() {
        let good = FakeServer::new("good", Some(vec!["search"]));
        let bad = FakeServer::new("bad", None);
        let tools = ExternalTools::discover(vec![good.clone(), bad.clone()]).await;

        assert_eq!(tools.server_count(), 1);
        assert_eq!(tools.definitions().len(), 1);
        assert_eq!(bad.shutdowns.load(Ordering::SeqCst), 1);

        let ctx = ToolContext {
            tool_call_id: "c".into(),
            session_id: SessionId::from("s"),
        };
        let out = tools
            .invoke("search", serde_json::json!({}), &ctx)
            .await
            .unwrap();
        assert_eq!(out, ToolOutput::Blocks(vec![ContentBlock::text("good:search")]));
    }

    #[tokio::test]
    async fn first_server_wins_on_name_clash() {
        let a = FakeServer::new("a", Some(vec!["lookup"]));
        let b = FakeServer::new("b", Some(vec!["lookup", "other"]));
        let tools = ExternalTools::discover(vec![a, b]).await;

        assert_eq!(tools.definitions().len(), 2);
        assert_eq!(tools.find("lookup").unwrap().name(), "a");
        assert_eq!(tools.find("other").unwrap().name(), "b");
    }
}

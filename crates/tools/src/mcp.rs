//! Stdio MCP client: external tools served by child processes.
//!
//! Each configured server is spawned with a scrubbed environment and spoken
//! to with newline-delimited JSON-RPC 2.0 over its stdin/stdout.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use swerve_config::{McpServerConfig, McpServersFile};
use swerve_core::error::ToolError;
use swerve_core::external::ExternalToolProvider;
use swerve_core::message::ContentBlock;
use swerve_core::provider::ToolDefinition;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const PROTOCOL_VERSION: &str = "2024-11-05";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Tool calls may do real work; they get longer than protocol requests.
const CALL_TIMEOUT: Duration = Duration::from_secs(600);

// ── JSON-RPC framing ──────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<u64>,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    id: Option<u64>,
    result: Option<serde_json::Value>,
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct McpTool {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default = "default_schema")]
    input_schema: serde_json::Value,
}

fn default_schema() -> serde_json::Value {
    serde_json::json!({"type": "object"})
}

#[derive(Debug, Deserialize)]
struct ToolsListResult {
    #[serde(default)]
    tools: Vec<McpTool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToolCallResult {
    #[serde(default)]
    content: Vec<McpContent>,
    #[serde(default)]
    is_error: bool,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum McpContent {
    Text {
        text: String,
    },
    Image {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    #[serde(other)]
    Unsupported,
}

impl McpContent {
    fn into_block(self) -> Option<ContentBlock> {
        match self {
            McpContent::Text { text } => Some(ContentBlock::Text { text }),
            McpContent::Image { data, mime_type } => {
                let bytes = STANDARD.decode(data.as_bytes()).ok()?;
                let format = mime_type
                    .strip_prefix("image/")
                    .unwrap_or(&mime_type)
                    .to_string();
                Some(ContentBlock::Image {
                    format,
                    data: bytes,
                })
            }
            McpContent::Unsupported => None,
        }
    }
}

// ── Client ────────────────────────────────────────────────────────────────

/// Callers waiting for a response, keyed by request id.
#[derive(Default)]
struct Pending {
    waiters: HashMap<u64, oneshot::Sender<JsonRpcResponse>>,
    closed: bool,
}

type SharedPending = Arc<Mutex<Pending>>;

/// One running MCP server.
///
/// A single reader task owns the server's stdout and routes every response
/// to the caller that sent the matching id, so concurrent calls to one
/// server may be answered in any order.
pub struct StdioMcpClient {
    name: String,
    next_id: AtomicU64,
    stdin: Mutex<ChildStdin>,
    pending: SharedPending,
    reader: JoinHandle<()>,
    child: Mutex<Option<Child>>,
}

impl StdioMcpClient {
    /// Spawn the server and complete the initialize handshake.
    pub async fn spawn(
        name: &str,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> Result<Self, ToolError> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true);

        // Only essentials plus what the server config names
        cmd.env_clear();
        for key in ["PATH", "HOME", "USER", "LANG", "TERM"] {
            if let Ok(value) = std::env::var(key) {
                cmd.env(key, value);
            }
        }
        cmd.envs(env);

        let mut child = cmd
            .spawn()
            .map_err(|e| external(name, format!("failed to spawn '{command}': {e}")))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| external(name, "failed to capture stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| external(name, "failed to capture stdout".into()))?;

        let pending: SharedPending = Arc::new(Mutex::new(Pending::default()));
        let reader = tokio::spawn(route_responses(
            name.to_string(),
            BufReader::new(stdout),
            pending.clone(),
        ));

        let client = Self {
            name: name.to_string(),
            next_id: AtomicU64::new(1),
            stdin: Mutex::new(stdin),
            pending,
            reader,
            child: Mutex::new(Some(child)),
        };

        if let Err(e) = client.initialize().await {
            client.shutdown().await;
            return Err(e);
        }
        Ok(client)
    }

    async fn initialize(&self) -> Result<(), ToolError> {
        let params = serde_json::json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": "swerve",
                "version": env!("CARGO_PKG_VERSION"),
            }
        });
        let response = self
            .request("initialize", Some(params), REQUEST_TIMEOUT)
            .await?;
        debug!(server = %self.name, response = %response, "MCP server initialized");

        self.write_line(&JsonRpcRequest {
            jsonrpc: "2.0",
            id: None,
            method: "notifications/initialized",
            params: None,
        })
        .await
    }

    async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Result<serde_json::Value, ToolError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        // Register before writing so a fast reply cannot slip past
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            if pending.closed {
                return Err(external(&self.name, "server closed stdout".into()));
            }
            pending.waiters.insert(id, tx);
        }

        if let Err(e) = self
            .write_line(&JsonRpcRequest {
                jsonrpc: "2.0",
                id: Some(id),
                method,
                params,
            })
            .await
        {
            self.pending.lock().await.waiters.remove(&id);
            return Err(e);
        }

        let response = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => return Err(external(&self.name, "server closed stdout".into())),
            Err(_) => {
                self.pending.lock().await.waiters.remove(&id);
                return Err(external(
                    &self.name,
                    format!("no response to {method} within {}s", timeout.as_secs()),
                ));
            }
        };

        match response.error {
            Some(err) => Err(external(
                &self.name,
                format!("{method} failed ({}): {}", err.code, err.message),
            )),
            None => Ok(response.result.unwrap_or(serde_json::Value::Null)),
        }
    }

    async fn write_line(&self, message: &JsonRpcRequest<'_>) -> Result<(), ToolError> {
        let mut line =
            serde_json::to_string(message).map_err(|e| external(&self.name, e.to_string()))?;
        line.push('\n');

        let mut stdin = self.stdin.lock().await;
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| external(&self.name, e.to_string()))?;
        stdin
            .flush()
            .await
            .map_err(|e| external(&self.name, e.to_string()))
    }
}

/// Read stdout until it closes, handing each response to its waiter and
/// skipping notifications and log noise. Waiters still pending when the
/// stream ends are dropped, which fails their calls.
async fn route_responses(
    name: String,
    mut stdout: BufReader<ChildStdout>,
    pending: SharedPending,
) {
    let mut buf = String::new();
    loop {
        buf.clear();
        match stdout.read_line(&mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(server = %name, error = %e, "Failed to read from MCP server");
                break;
            }
        }
        let trimmed = buf.trim();
        if trimmed.is_empty() {
            continue;
        }
        match serde_json::from_str::<JsonRpcResponse>(trimmed) {
            Ok(response) => match response.id {
                Some(id) => {
                    let waiter = pending.lock().await.waiters.remove(&id);
                    match waiter {
                        Some(waiter) => {
                            let _ = waiter.send(response);
                        }
                        None => debug!(server = %name, id, "Response for unknown request id"),
                    }
                }
                None => debug!(server = %name, "Skipping notification"),
            },
            Err(_) => debug!(server = %name, line = trimmed, "Ignoring non-JSON-RPC line"),
        }
    }

    let mut pending = pending.lock().await;
    pending.closed = true;
    pending.waiters.clear();
    debug!(server = %name, "MCP server stdout closed");
}

#[async_trait]
impl ExternalToolProvider for StdioMcpClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_tools(&self) -> Result<Vec<ToolDefinition>, ToolError> {
        let result = self.request("tools/list", None, REQUEST_TIMEOUT).await?;
        let listed: ToolsListResult = serde_json::from_value(result)
            .map_err(|e| external(&self.name, format!("bad tools/list result: {e}")))?;

        Ok(listed
            .tools
            .into_iter()
            .map(|t| ToolDefinition {
                name: t.name,
                description: t.description,
                input_schema: t.input_schema,
            })
            .collect())
    }

    async fn call_tool(
        &self,
        tool_name: &str,
        input: serde_json::Value,
    ) -> Result<Vec<ContentBlock>, ToolError> {
        let params = serde_json::json!({ "name": tool_name, "arguments": input });
        let result = self
            .request("tools/call", Some(params), CALL_TIMEOUT)
            .await?;
        let call: ToolCallResult = serde_json::from_value(result)
            .map_err(|e| external(&self.name, format!("bad tools/call result: {e}")))?;

        let blocks: Vec<ContentBlock> = call
            .content
            .into_iter()
            .filter_map(McpContent::into_block)
            .collect();

        if call.is_error {
            let text = blocks
                .iter()
                .filter_map(ContentBlock::as_text)
                .collect::<Vec<_>>()
                .join("\n");
            return Err(external(&self.name, text));
        }
        Ok(blocks)
    }

    async fn shutdown(&self) {
        self.reader.abort();
        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(e) = child.kill().await {
                debug!(server = %self.name, error = %e, "MCP server already gone");
            }
            let _ = child.wait().await;
            info!(server = %self.name, "MCP server stopped");
        }
    }
}

fn external(server: &str, reason: String) -> ToolError {
    ToolError::External {
        server: server.to_string(),
        reason,
    }
}

/// Start every enabled stdio server in `file`. Servers that fail to start
/// are logged and skipped.
pub async fn connect_all(file: &McpServersFile) -> Vec<Arc<dyn ExternalToolProvider>> {
    let mut providers: Vec<Arc<dyn ExternalToolProvider>> = Vec::new();
    for (name, config) in file.enabled_servers() {
        match config {
            McpServerConfig::Stdio {
                command, args, env, ..
            } => match StdioMcpClient::spawn(name, command, args, env).await {
                Ok(client) => providers.push(Arc::new(client)),
                Err(e) => warn!(server = %name, error = %e, "Failed to start MCP server"),
            },
            McpServerConfig::Http { url, .. } => {
                warn!(server = %name, url = %url, "HTTP MCP servers are not supported, skipping");
            }
        }
    }
    providers
}

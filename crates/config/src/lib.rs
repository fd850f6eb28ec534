//! Configuration loading, validation, and management for swerve.
//!
//! Loads configuration from `~/.swerve/config.toml` with environment
//! variable overrides. Validates all settings at startup. External tool
//! servers are declared separately in an `mcp.json` file.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `~/.swerve/config.toml`.
#[derive(Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Anthropic API key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Messages API base URL
    #[serde(default = "default_api_url")]
    pub api_url: String,

    #[serde(default)]
    pub model: ModelConfig,

    #[serde(default)]
    pub compaction: CompactionConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub tools: ToolsConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub prompt: PromptConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

fn default_api_url() -> String {
    "https://api.anthropic.com".into()
}

/// Redact a secret string for Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("api_key", &redact(&self.api_key))
            .field("api_url", &self.api_url)
            .field("model", &self.model)
            .field("compaction", &self.compaction)
            .field("retry", &self.retry)
            .field("tools", &self.tools)
            .field("store", &self.store)
            .field("prompt", &self.prompt)
            .field("telemetry", &self.telemetry)
            .finish()
    }
}

/// Which models to call and with what output budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Ordered preference list; later entries are used when earlier ones
    /// are throttled.
    #[serde(default = "default_preferences")]
    pub preferences: Vec<String>,

    /// Output-token budget before any expansion
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,

    /// Upper bound for the expanded output-token budget
    #[serde(default = "default_max_output_tokens_cap")]
    pub max_output_tokens_cap: u32,

    #[serde(default)]
    pub temperature: f32,
}

fn default_preferences() -> Vec<String> {
    vec![
        "claude-sonnet-4-20250514".into(),
        "claude-3-7-sonnet-20250219".into(),
    ]
}
fn default_max_output_tokens() -> u32 {
    8192
}
fn default_max_output_tokens_cap() -> u32 {
    64000
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            preferences: default_preferences(),
            max_output_tokens: default_max_output_tokens(),
            max_output_tokens_cap: default_max_output_tokens_cap(),
            temperature: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionConfig {
    /// Above this many tokens the log is elided middle-out
    #[serde(default = "default_token_threshold")]
    pub token_threshold: u64,

    /// Fraction of the threshold an elided log aims for
    #[serde(default = "default_target_ratio")]
    pub target_ratio: f64,
}

fn default_token_threshold() -> u64 {
    190_000
}
fn default_target_ratio() -> f64 {
    0.5
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            token_threshold: default_token_threshold(),
            target_ratio: default_target_ratio(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_min_delay_ms")]
    pub min_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Re-reads of the log while it does not yet end in a user-side record
    #[serde(default = "default_lag_read_attempts")]
    pub lag_read_attempts: u32,

    #[serde(default = "default_lag_min_delay_ms")]
    pub lag_min_delay_ms: u64,

    #[serde(default = "default_lag_max_delay_ms")]
    pub lag_max_delay_ms: u64,
}

fn default_max_retries() -> u32 {
    100
}
fn default_min_delay_ms() -> u64 {
    1000
}
fn default_max_delay_ms() -> u64 {
    5000
}
fn default_lag_read_attempts() -> u32 {
    5
}
fn default_lag_min_delay_ms() -> u64 {
    100
}
fn default_lag_max_delay_ms() -> u64 {
    1000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            min_delay_ms: default_min_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            lag_read_attempts: default_lag_read_attempts(),
            lag_min_delay_ms: default_lag_min_delay_ms(),
            lag_max_delay_ms: default_lag_max_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Seconds without a progress report before tool results nudge the model
    #[serde(default = "default_progress_idle_secs")]
    pub progress_idle_secs: u64,

    /// Run the tool calls of one response concurrently
    #[serde(default = "default_true")]
    pub parallel: bool,

    /// Where commands run and repositories are cloned
    #[serde(default = "default_working_directory")]
    pub working_directory: PathBuf,

    #[serde(default = "default_shell_timeout_secs")]
    pub shell_timeout_secs: u64,

    /// Path to the `mcp.json` server list
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mcp_config: Option<PathBuf>,
}

fn default_progress_idle_secs() -> u64 {
    300
}
fn default_true() -> bool {
    true
}
fn default_working_directory() -> PathBuf {
    AppConfig::workspace_dir()
}
fn default_shell_timeout_secs() -> u64 {
    600
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            progress_idle_secs: default_progress_idle_secs(),
            parallel: true,
            working_directory: default_working_directory(),
            shell_timeout_secs: default_shell_timeout_secs(),
            mcp_config: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_backend")]
    pub backend: StoreBackend,

    /// SQLite database file
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

fn default_store_backend() -> StoreBackend {
    StoreBackend::Sqlite
}
fn default_store_path() -> PathBuf {
    AppConfig::config_dir().join("swerve.db")
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
            path: default_store_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptConfig {
    /// Appended to the base prompt under a "Common Prompt" heading
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_system_prompt: Option<String>,

    /// Knowledge files looked up in the cloned repository, first match wins
    #[serde(default = "default_knowledge_files")]
    pub knowledge_files: Vec<String>,
}

fn default_knowledge_files() -> Vec<String> {
    vec!["AGENTS.md".into(), "CLAUDE.md".into()]
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            additional_system_prompt: None,
            knowledge_files: default_knowledge_files(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Per-model price overrides keyed by model-id substring
    #[serde(default)]
    pub custom_pricing: HashMap<String, PricingOverrideConfig>,
}

/// Custom per-1k-token pricing for a model family.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingOverrideConfig {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
    #[serde(default)]
    pub cache_read_per_1k: f64,
    #[serde(default)]
    pub cache_write_per_1k: f64,
}

impl AppConfig {
    /// Load configuration from the default path (~/.swerve/config.toml).
    ///
    /// Also checks environment variables for the API key:
    /// - `SWERVE_API_KEY` (highest priority)
    /// - `ANTHROPIC_API_KEY`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;

        if config.api_key.is_none() {
            config.api_key = std::env::var("SWERVE_API_KEY")
                .ok()
                .or_else(|| std::env::var("ANTHROPIC_API_KEY").ok());
        }

        // A single model from the environment replaces the preference list
        if let Ok(model) = std::env::var("SWERVE_MODEL") {
            config.model.preferences = vec![model];
        }

        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".swerve")
    }

    /// Default sandbox directory for commands and clones.
    pub fn workspace_dir() -> PathBuf {
        Self::config_dir().join("workspace")
    }

    /// The `mcp.json` path: configured, or `~/.swerve/mcp.json`.
    pub fn mcp_config_path(&self) -> PathBuf {
        self.tools
            .mcp_config
            .clone()
            .unwrap_or_else(|| Self::config_dir().join("mcp.json"))
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.compaction.token_threshold == 0 {
            return Err(ConfigError::ValidationError(
                "compaction.token_threshold must be > 0".into(),
            ));
        }

        let ratio = self.compaction.target_ratio;
        if !(ratio > 0.0 && ratio <= 1.0) {
            return Err(ConfigError::ValidationError(
                "compaction.target_ratio must be in (0, 1]".into(),
            ));
        }

        if self.retry.min_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::ValidationError(
                "retry.min_delay_ms must not exceed retry.max_delay_ms".into(),
            ));
        }

        if self.retry.lag_min_delay_ms > self.retry.lag_max_delay_ms {
            return Err(ConfigError::ValidationError(
                "retry.lag_min_delay_ms must not exceed retry.lag_max_delay_ms".into(),
            ));
        }

        if self.model.preferences.is_empty() {
            return Err(ConfigError::ValidationError(
                "model.preferences must name at least one model".into(),
            ));
        }

        if self.model.temperature < 0.0 || self.model.temperature > 1.0 {
            return Err(ConfigError::ValidationError(
                "model.temperature must be between 0.0 and 1.0".into(),
            ));
        }

        if self.model.max_output_tokens > self.model.max_output_tokens_cap {
            return Err(ConfigError::ValidationError(
                "model.max_output_tokens must not exceed model.max_output_tokens_cap".into(),
            ));
        }

        Ok(())
    }

    /// Check if an API key is available (from config or environment).
    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    /// Generate a default config TOML string.
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_url: default_api_url(),
            model: ModelConfig::default(),
            compaction: CompactionConfig::default(),
            retry: RetryConfig::default(),
            tools: ToolsConfig::default(),
            store: StoreConfig::default(),
            prompt: PromptConfig::default(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

// ── External tool servers (mcp.json) ─────────────────────────────────────

/// The `mcp.json` file: named external tool servers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpServersFile {
    #[serde(rename = "mcpServers", default)]
    pub servers: HashMap<String, McpServerConfig>,
}

/// One external tool server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum McpServerConfig {
    /// Child process speaking JSON-RPC over stdin/stdout
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
        #[serde(default = "default_true")]
        enabled: bool,
    },
    /// Remote server; parsed but not connected
    Http {
        url: String,
        #[serde(default = "default_true")]
        enabled: bool,
    },
}

impl McpServerConfig {
    pub fn enabled(&self) -> bool {
        match self {
            McpServerConfig::Stdio { enabled, .. } | McpServerConfig::Http { enabled, .. } => {
                *enabled
            }
        }
    }
}

impl McpServersFile {
    /// Load the server list. A missing file means no servers.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::debug!("No MCP server file at {}", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        serde_json::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Enabled servers sorted by name, so start-up order is stable.
    pub fn enabled_servers(&self) -> Vec<(&str, &McpServerConfig)> {
        let mut servers: Vec<_> = self
            .servers
            .iter()
            .filter(|(_, cfg)| cfg.enabled())
            .map(|(name, cfg)| (name.as_str(), cfg))
            .collect();
        servers.sort_by_key(|(name, _)| *name);
        servers
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.compaction.token_threshold, 190_000);
        assert_eq!(config.retry.max_retries, 100);
        assert_eq!(config.tools.progress_idle_secs, 300);
        assert_eq!(config.store.backend, StoreBackend::Sqlite);
    }

    #[test]
    fn config_roundtrip_toml() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: AppConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.model.preferences, config.model.preferences);
        assert_eq!(parsed.retry.max_delay_ms, config.retry.max_delay_ms);
    }

    #[test]
    fn zero_threshold_rejected() {
        let mut config = AppConfig::default();
        config.compaction.token_threshold = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn ratio_out_of_range_rejected() {
        let mut config = AppConfig::default();
        config.compaction.target_ratio = 0.0;
        assert!(config.validate().is_err());
        config.compaction.target_ratio = 1.5;
        assert!(config.validate().is_err());
        config.compaction.target_ratio = 1.0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn inverted_delays_rejected() {
        let mut config = AppConfig::default();
        config.retry.min_delay_ms = 10_000;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("min_delay_ms"));
    }

    #[test]
    fn missing_config_file_returns_defaults() {
        let config = AppConfig::load_from(Path::new("/nonexistent/config.toml")).unwrap();
        assert_eq!(config.api_url, "https://api.anthropic.com");
    }

    #[test]
    fn partial_file_fills_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[model]
preferences = ["claude-3-5-haiku-20241022"]

[compaction]
token_threshold = 1000

[telemetry.custom_pricing.haiku]
input_per_1k = 0.001
output_per_1k = 0.005
"#
        )
        .unwrap();

        let config = AppConfig::load_from(file.path()).unwrap();
        assert_eq!(config.model.preferences, vec!["claude-3-5-haiku-20241022"]);
        assert_eq!(config.compaction.token_threshold, 1000);
        assert_eq!(config.compaction.target_ratio, 0.5);
        let haiku = &config.telemetry.custom_pricing["haiku"];
        assert_eq!(haiku.output_per_1k, 0.005);
        assert_eq!(haiku.cache_read_per_1k, 0.0);
    }

    #[test]
    fn invalid_file_is_a_validation_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[retry]\nmin_delay_ms = 9000\nmax_delay_ms = 10").unwrap();
        let err = AppConfig::load_from(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn debug_redacts_api_key() {
        let config = AppConfig {
            api_key: Some("sk-ant-secret".into()),
            ..AppConfig::default()
        };
        let debug = format!("{config:?}");
        assert!(!debug.contains("sk-ant-secret"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn mcp_file_parsing() {
        let json = r#"{
            "mcpServers": {
                "search": { "command": "npx", "args": ["-y", "search-server"], "env": {"TOKEN": "x"} },
                "remote": { "url": "https://example.com/mcp" },
                "off": { "command": "nope", "enabled": false }
            }
        }"#;
        let file: McpServersFile = serde_json::from_str(json).unwrap();
        assert_eq!(file.servers.len(), 3);

        let enabled = file.enabled_servers();
        let names: Vec<_> = enabled.iter().map(|(n, _)| *n).collect();
        assert_eq!(names, vec!["remote", "search"]);
        assert!(matches!(enabled[0].1, McpServerConfig::Http { .. }));
        match enabled[1].1 {
            McpServerConfig::Stdio { command, args, env, .. } => {
                assert_eq!(command, "npx");
                assert_eq!(args.len(), 2);
                assert_eq!(env["TOKEN"], "x");
            }
            _ => panic!("Expected stdio server"),
        }
    }

    #[test]
    fn missing_mcp_file_is_empty() {
        let file = McpServersFile::load_from(Path::new("/nonexistent/mcp.json")).unwrap();
        assert!(file.servers.is_empty());
    }
}

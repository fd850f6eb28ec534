//! Wires configuration into a ready-to-run [`TurnLoop`].

use std::sync::Arc;
use std::time::Duration;
use swerve_agent::{Compactor, PromptBuilder, RetryPolicy, ToolDispatcher, Toolset, TurnLoop};
use swerve_config::{AppConfig, McpServersFile, StoreBackend, StoreConfig};
use swerve_core::event::EventBus;
use swerve_core::external::ExternalTools;
use swerve_core::message::SessionId;
use swerve_core::store::{ConversationStore, MetadataStore, UsageLedger};
use swerve_core::StoreError;
use swerve_providers::AnthropicProvider;
use swerve_store::{InMemoryStore, SqliteStore};
use swerve_telemetry::{CostAccountant, ModelRates, PricingTable};
use tracing::info;

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// The configured store backend.
pub enum Backend {
    Sqlite(Arc<SqliteStore>),
    Memory(Arc<InMemoryStore>),
}

impl Backend {
    pub async fn open(config: &StoreConfig) -> CliResult<Self> {
        match config.backend {
            StoreBackend::Sqlite => {
                if let Some(parent) = config.path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let path = config.path.to_string_lossy();
                Ok(Backend::Sqlite(Arc::new(SqliteStore::new(&path).await?)))
            }
            StoreBackend::Memory => Ok(Backend::Memory(Arc::new(InMemoryStore::new()))),
        }
    }

    pub fn conversation(&self) -> Arc<dyn ConversationStore> {
        match self {
            Backend::Sqlite(s) => s.clone(),
            Backend::Memory(s) => s.clone(),
        }
    }

    pub fn metadata(&self) -> Arc<dyn MetadataStore> {
        match self {
            Backend::Sqlite(s) => s.clone(),
            Backend::Memory(s) => s.clone(),
        }
    }

    pub fn ledger(&self) -> Arc<dyn UsageLedger> {
        match self {
            Backend::Sqlite(s) => s.clone(),
            Backend::Memory(s) => s.clone(),
        }
    }

    pub async fn sessions(&self) -> Result<Vec<SessionId>, StoreError> {
        match self {
            Backend::Sqlite(s) => s.sessions().await,
            Backend::Memory(s) => Ok(s.sessions().await),
        }
    }
}

/// Price table with the configured overrides in front of the defaults.
pub fn pricing(config: &AppConfig) -> PricingTable {
    PricingTable::with_overrides(config.telemetry.custom_pricing.iter().map(|(pattern, p)| {
        (
            pattern.clone(),
            ModelRates::new(
                p.input_per_1k,
                p.output_per_1k,
                p.cache_read_per_1k,
                p.cache_write_per_1k,
            ),
        )
    }))
}

/// Everything a worker needs to run turns.
pub struct Runtime {
    pub backend: Backend,
    pub events: Arc<EventBus>,
    pub turn: TurnLoop,
    external: Arc<ExternalTools>,
}

impl Runtime {
    pub async fn open(config: &AppConfig) -> CliResult<Self> {
        config.validate()?;
        let Some(api_key) = config.api_key.clone() else {
            eprintln!();
            eprintln!("  ERROR: No API key configured!");
            eprintln!();
            eprintln!("  Set SWERVE_API_KEY or ANTHROPIC_API_KEY, or add api_key to:");
            eprintln!("    {}", AppConfig::config_dir().join("config.toml").display());
            eprintln!();
            return Err("No API key found. See above for setup instructions.".into());
        };

        let backend = Backend::open(&config.store).await?;
        let events = Arc::new(EventBus::default());

        let provider = AnthropicProvider::new(api_key)
            .with_base_url(config.api_url.as_str())
            .with_output_budget(
                config.model.max_output_tokens,
                config.model.max_output_tokens_cap,
            )
            .with_temperature(config.model.temperature);

        std::fs::create_dir_all(&config.tools.working_directory)?;
        let local = Arc::new(swerve_tools::default_registry(
            &config.tools,
            backend.metadata(),
            events.clone(),
        ));

        let servers = McpServersFile::load_from(&config.mcp_config_path())?;
        let external = Arc::new(ExternalTools::discover(swerve_tools::connect_all(&servers).await).await);
        info!(servers = external.server_count(), "External tools discovered");

        let dispatcher = ToolDispatcher::new(Toolset::new(external.clone(), local), events.clone())
            .with_progress_idle(Duration::from_secs(config.tools.progress_idle_secs))
            .with_parallel(config.tools.parallel);

        let accountant =
            CostAccountant::new(backend.ledger()).with_pricing(Arc::new(pricing(config)));

        let turn = TurnLoop::new(
            backend.conversation(),
            Arc::new(provider),
            dispatcher,
            PromptBuilder::from_config(&config.prompt, backend.metadata()),
            accountant,
            events.clone(),
        )
        .with_models(config.model.preferences.clone())
        .with_compactor(Compactor::from_config(&config.compaction))
        .with_retry(RetryPolicy::from_config(&config.retry))
        .with_lag_retry(RetryPolicy::lagging_read(&config.retry));

        Ok(Self {
            backend,
            events,
            turn,
            external,
        })
    }

    /// Stop external tool servers.
    pub async fn shutdown(&self) {
        self.external.shutdown().await;
    }
}

//! # swerve core
//!
//! Domain types, boundary traits, and error definitions for the swerve
//! coding-agent turn engine. Every external collaborator of a turn (the
//! conversation store, the model endpoint, tool providers, the live-update
//! channel) is defined as a trait here. Implementations live in their
//! respective crates:
//!
//! - `swerve-store` implements [`ConversationStore`], [`MetadataStore`], [`UsageLedger`]
//! - `swerve-providers` implements [`ModelClient`]
//! - `swerve-tools` implements [`Tool`] and [`ExternalToolProvider`]
//! - `swerve-agent` drives them through the turn loop

pub mod cancel;
pub mod error;
pub mod event;
pub mod external;
pub mod message;
pub mod provider;
pub mod store;
pub mod tool;

pub use cancel::CancellationToken;
pub use error::{Error, ProviderError, Result, StoreError, ToolError};
pub use event::{AgentStatus, EventBus, TurnEvent};
pub use external::{ExternalToolProvider, ExternalTools};
pub use message::{
    ContentBlock, MessageRecord, MessageType, ModelMessage, NewMessage, RecordKey, Role, SessionId,
};
pub use provider::{
    ConverseRequest, ConverseResponse, ModelClient, StopReason, SystemPrompt, TokenUsage,
    ToolConfig, ToolDefinition,
};
pub use store::{ConversationStore, MetadataStore, UsageLedger, UsageRecord};
pub use tool::{Tool, ToolContext, ToolOutput, ToolProvider, ToolRegistry};

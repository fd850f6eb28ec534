//! Conversation store implementations for swerve.
//!
//! Both backends implement [`ConversationStore`], [`MetadataStore`] and
//! [`UsageLedger`] from `swerve-core`.
//!
//! [`ConversationStore`]: swerve_core::ConversationStore
//! [`MetadataStore`]: swerve_core::MetadataStore
//! [`UsageLedger`]: swerve_core::UsageLedger

pub mod in_memory;
pub mod keys;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use in_memory::InMemoryStore;
pub use keys::SortKeyClock;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

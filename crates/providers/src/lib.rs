//! Model endpoint implementations for swerve.
//!
//! All providers implement the `swerve_core::ModelClient` trait.

pub mod anthropic;

pub use anthropic::AnthropicProvider;

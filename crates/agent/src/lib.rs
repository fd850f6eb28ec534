//! The swerve turn engine.
//!
//! A turn runs **Invoke → Dispatch → Invoke** until the model answers
//! without requesting tools:
//!
//! 1. **Read** the session log from the conversation store
//! 2. **Compact** it to fit the context window ([`compaction`])
//! 3. **Mark** prompt-cache boundaries ([`cache`])
//! 4. **Invoke** the model under the retry policy ([`retry`])
//! 5. **If tool use**: dispatch the calls ([`dispatcher`]), persist the
//!    toolUse/toolResult pair, loop back to step 2
//! 6. **Otherwise**: persist the final answer and publish it
//!
//! [`TurnLoop`] in [`turn`] ties the steps together.

pub mod cache;
pub mod compaction;
pub mod dispatcher;
pub mod prompt;
pub mod retry;
pub mod turn;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use cache::CacheBoundaries;
pub use compaction::{CompactedInput, Compactor, Strategy};
pub use dispatcher::{DispatchOutcome, ProgressClock, ToolCall, ToolDispatcher, Toolset};
pub use prompt::{BASE_SYSTEM_PROMPT, PromptBuilder};
pub use retry::{Attempt, RetryPolicy, RetryReason};
pub use turn::{TurnLoop, TurnOutcome, strip_thinking};

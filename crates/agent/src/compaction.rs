//! Context compaction: turning the stored log into model input.
//!
//! Two strategies:
//!
//! 1. **Pass-through**: every record, 1:1, with the summed token count.
//! 2. **Middle-out**: keep the head of the conversation (up to and including
//!    the first user message) and as many of the most recent records as fit
//!    in `threshold * target_ratio`, eliding the span in between.
//!
//! Elision works on units, not records: a `toolUse` record and the
//! `toolResult` records answering it are kept or dropped together, so the
//! model never sees a dangling tool call.

use serde::{Deserialize, Serialize};
use swerve_config::CompactionConfig;
use swerve_core::message::{MessageRecord, MessageType, ModelMessage};
use tracing::{debug, info, warn};

/// How a [`CompactedInput`] was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    PassThrough,
    MiddleOut,
    /// Middle-out could not get under the threshold; only the head and the
    /// newest unit were kept.
    MinimalWindow,
}

/// Model-ready messages derived from the log. Never persisted.
#[derive(Debug, Clone)]
pub struct CompactedInput {
    pub messages: Vec<ModelMessage>,
    pub total_token_count: i64,
    /// Indices into the source records, ascending.
    pub kept: Vec<usize>,
    pub strategy: Strategy,
}

impl CompactedInput {
    /// Whether any record was dropped.
    pub fn elided(&self) -> bool {
        self.strategy != Strategy::PassThrough
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// A contiguous run of records that must be kept or dropped together.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Unit {
    start: usize,
    end: usize,
    tokens: i64,
    opens_with_user_message: bool,
}

/// Group records into units: a `toolUse` plus the `toolResult`s directly
/// after it form one unit, every other record stands alone.
fn units(records: &[MessageRecord]) -> Vec<Unit> {
    let mut units = Vec::new();
    let mut i = 0;
    while i < records.len() {
        let start = i;
        i += 1;
        if records[start].message_type == MessageType::ToolUse {
            while i < records.len() && records[i].message_type == MessageType::ToolResult {
                i += 1;
            }
        }
        units.push(Unit {
            start,
            end: i,
            tokens: records[start..i].iter().map(|r| r.token_count).sum(),
            opens_with_user_message: records[start].message_type == MessageType::UserMessage,
        });
    }
    units
}

pub fn total_tokens(records: &[MessageRecord]) -> i64 {
    records.iter().map(|r| r.token_count).sum()
}

/// Token-budgeted compaction.
#[derive(Debug, Clone, Copy)]
pub struct Compactor {
    threshold: i64,
    target_ratio: f64,
}

impl Compactor {
    pub fn new(threshold: u64, target_ratio: f64) -> Self {
        Self {
            threshold: i64::try_from(threshold).unwrap_or(i64::MAX),
            target_ratio: target_ratio.clamp(f64::MIN_POSITIVE, 1.0),
        }
    }

    pub fn from_config(config: &CompactionConfig) -> Self {
        Self::new(config.token_threshold, config.target_ratio)
    }

    pub fn threshold(&self) -> i64 {
        self.threshold
    }

    /// Tokens middle-out aims for.
    fn target(&self) -> i64 {
        (self.threshold as f64 * self.target_ratio) as i64
    }

    /// Pass-through unless the log is over the threshold.
    pub fn compact(&self, records: &[MessageRecord]) -> CompactedInput {
        let total = total_tokens(records);
        if total > self.threshold {
            info!(
                total,
                threshold = self.threshold,
                "Token count over threshold, applying middle-out"
            );
            self.middle_out(records)
        } else {
            self.pass_through(records)
        }
    }

    pub fn pass_through(&self, records: &[MessageRecord]) -> CompactedInput {
        CompactedInput {
            messages: records.iter().map(MessageRecord::to_model_message).collect(),
            total_token_count: total_tokens(records),
            kept: (0..records.len()).collect(),
            strategy: Strategy::PassThrough,
        }
    }

    /// Elide an interior span so the log fits the target budget.
    ///
    /// A log already within the target comes back unchanged.
    pub fn middle_out(&self, records: &[MessageRecord]) -> CompactedInput {
        let total = total_tokens(records);
        let target = self.target();
        if total <= target {
            return self.pass_through(records);
        }

        let units = units(records);
        let head_len = units
            .iter()
            .position(|u| u.opens_with_user_message)
            .map_or(1, |i| i + 1)
            .min(units.len());
        let head_tokens: i64 = units[..head_len].iter().map(|u| u.tokens).sum();

        // Newest units first, always at least one
        let mut tail_start = units.len();
        let mut tail_tokens = 0i64;
        let budget = target - head_tokens;
        while tail_start > head_len {
            let candidate = &units[tail_start - 1];
            let is_newest = tail_start == units.len();
            if !is_newest && tail_tokens + candidate.tokens > budget {
                break;
            }
            tail_tokens += candidate.tokens;
            tail_start -= 1;
        }

        if tail_start == head_len {
            // Nothing between head and tail
            return self.pass_through(records);
        }

        let mut strategy = Strategy::MiddleOut;
        if head_tokens + tail_tokens > self.threshold {
            tail_start = units.len() - 1;
            tail_tokens = units[tail_start].tokens;
            strategy = Strategy::MinimalWindow;
        }

        let kept: Vec<usize> = units[..head_len]
            .iter()
            .chain(&units[tail_start..])
            .flat_map(|u| u.start..u.end)
            .collect();
        let total_token_count = head_tokens + tail_tokens;

        if total_token_count > self.threshold {
            warn!(
                total = total_token_count,
                threshold = self.threshold,
                "Minimal window still exceeds the threshold"
            );
        }
        debug!(
            before = total,
            after = total_token_count,
            kept = kept.len(),
            dropped = records.len() - kept.len(),
            ?strategy,
            "Middle-out compaction"
        );

        CompactedInput {
            messages: kept.iter().map(|&i| records[i].to_model_message()).collect(),
            total_token_count,
            kept,
            strategy,
        }
    }
}

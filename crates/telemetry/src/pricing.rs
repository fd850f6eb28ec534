//! Built-in pricing table for Claude model families.
//!
//! Prices are in USD per 1 thousand tokens, with separate rates for input,
//! output, cache reads and cache writes. Models are matched by substring of
//! the model identifier; the first matching entry wins, so custom overrides
//! are placed in front of the defaults.

use serde::{Deserialize, Serialize};
use std::sync::{LazyLock, RwLock};

/// Per-1k-token pricing for a model family.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelRates {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
    pub cache_read_per_1k: f64,
    pub cache_write_per_1k: f64,
}

impl ModelRates {
    pub const fn new(input: f64, output: f64, cache_read: f64, cache_write: f64) -> Self {
        Self {
            input_per_1k: input,
            output_per_1k: output,
            cache_read_per_1k: cache_read,
            cache_write_per_1k: cache_write,
        }
    }

    /// Compute cost for the given token counts.
    pub fn cost(&self, input: u64, output: u64, cache_read: u64, cache_write: u64) -> f64 {
        (input as f64 * self.input_per_1k
            + output as f64 * self.output_per_1k
            + cache_read as f64 * self.cache_read_per_1k
            + cache_write as f64 * self.cache_write_per_1k)
            / 1000.0
    }
}

const SONNET: ModelRates = ModelRates::new(0.003, 0.015, 0.0003, 0.00375);
const HAIKU_3_5: ModelRates = ModelRates::new(0.0008, 0.004, 0.00008, 0.001);
const OPUS_4: ModelRates = ModelRates::new(0.015, 0.075, 0.0015, 0.01875);

/// Thread-safe pricing table with built-in defaults and custom overrides.
pub struct PricingTable {
    entries: RwLock<Vec<(String, ModelRates)>>,
}

impl PricingTable {
    /// Create a pricing table with built-in model prices.
    pub fn with_defaults() -> Self {
        let entries = vec![
            ("3-7-sonnet".to_string(), SONNET),
            ("3-5-sonnet".to_string(), SONNET),
            ("3-5-haiku".to_string(), HAIKU_3_5),
            ("sonnet-4".to_string(), SONNET),
            ("opus-4".to_string(), OPUS_4),
        ];
        Self {
            entries: RwLock::new(entries),
        }
    }

    /// Create an empty pricing table.
    pub fn empty() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
        }
    }

    /// Defaults plus overrides; overrides take precedence.
    pub fn with_overrides<I>(overrides: I) -> Self
    where
        I: IntoIterator<Item = (String, ModelRates)>,
    {
        let table = Self::with_defaults();
        let mut overrides: Vec<_> = overrides.into_iter().collect();
        // Longest substring first so "sonnet-4-5" beats "sonnet-4"
        overrides.sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(&b.0)));
        for (pattern, rates) in overrides.into_iter().rev() {
            table.prepend(pattern, rates);
        }
        table
    }

    /// Put an entry in front of every existing one.
    pub fn prepend(&self, pattern: impl Into<String>, rates: ModelRates) {
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.insert(0, (pattern.into(), rates));
    }

    /// The rates of the first entry whose pattern occurs in `model`.
    pub fn lookup(&self, model: &str) -> Option<ModelRates> {
        let entries = self
            .entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        entries
            .iter()
            .find(|(pattern, _)| model.contains(pattern.as_str()))
            .map(|(_, rates)| *rates)
    }

    /// Compute cost for a model call, returning 0.0 if the model is unknown.
    pub fn cost(
        &self,
        model: &str,
        input: u64,
        output: u64,
        cache_read: u64,
        cache_write: u64,
    ) -> f64 {
        match self.lookup(model) {
            Some(rates) => rates.cost(input, output, cache_read, cache_write),
            None => {
                tracing::debug!(model = %model, "No pricing for model, counting as free");
                0.0
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PricingTable {
    fn default() -> Self {
        Self::with_defaults()
    }
}

static DEFAULT_TABLE: LazyLock<PricingTable> = LazyLock::new(PricingTable::with_defaults);

/// Cost in USD of one call against the built-in table.
pub fn calculate_cost(
    model: &str,
    input_tokens: u64,
    output_tokens: u64,
    cache_read_tokens: u64,
    cache_write_tokens: u64,
) -> f64 {
    DEFAULT_TABLE.cost(
        model,
        input_tokens,
        output_tokens,
        cache_read_tokens,
        cache_write_tokens,
    )
}

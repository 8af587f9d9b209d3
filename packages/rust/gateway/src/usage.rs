//! Token and cost accounting shared across a batch.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tastebase_shared::{DEFAULT_RATE_KEY, ModelRate, TokenUsage};
use tracing::warn;

/// USD cost of `usage` for `model`, falling back to the `default` rate.
///
/// Models with no rate and no default entry cost zero.
pub fn cost_for(rates: &BTreeMap<String, ModelRate>, model: &str, usage: TokenUsage) -> f64 {
    match rates.get(model).or_else(|| rates.get(DEFAULT_RATE_KEY)) {
        Some(rate) => rate.cost(usage.input_tokens, usage.output_tokens),
        None => {
            warn!(model, "no rate configured for model, counting cost as zero");
            0.0
        }
    }
}

/// Accumulates token usage per model.
///
/// Cloning yields another handle to the same totals, so one tracker can be
/// handed to every service constructed for a batch.
#[derive(Debug, Clone, Default)]
pub struct UsageTracker {
    inner: Arc<Mutex<BTreeMap<String, TokenUsage>>>,
}

impl UsageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, TokenUsage>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add one call's usage under `model`.
    pub fn track_usage(&self, model: &str, usage: TokenUsage) {
        if usage.is_zero() {
            return;
        }
        *self.lock().entry(model.to_string()).or_default() += usage;
    }

    /// Usage summed across all models.
    pub fn total_usage(&self) -> TokenUsage {
        self.lock()
            .values()
            .fold(TokenUsage::default(), |acc, u| acc + *u)
    }

    /// Snapshot of the per-model breakdown.
    pub fn usage_by_model(&self) -> BTreeMap<String, TokenUsage> {
        self.lock().clone()
    }

    /// Total USD across models at the given rates.
    pub fn estimate_cost(&self, rates: &BTreeMap<String, ModelRate>) -> f64 {
        self.lock()
            .iter()
            .map(|(model, usage)| cost_for(rates, model, *usage))
            .sum()
    }

    /// Clear all totals. Called between batches.
    pub fn reset(&self) {
        self.lock().clear();
    }
}

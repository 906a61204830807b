//! Cost and token accounting for LLM usage.
//!
//! A controller keeps one [`Metrics`] per agent (`local_metrics`) and one
//! [`SharedMetrics`] handle that a parent controller shares with its
//! delegates. Merges are additive and commutative; accumulated cost only
//! grows.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Token counts reported for a single LLM response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(
        alias = "input_tokens",  // Anthropic
        alias = "prompt_eval_count" // Ollama
    )]
    pub prompt_tokens: u64,
    #[serde(
        alias = "output_tokens", // Anthropic
        alias = "eval_count"     // Ollama
    )]
    pub completion_tokens: u64,
    #[serde(default)]
    pub cache_read_tokens: u64,
    #[serde(default)]
    pub cache_write_tokens: u64,
    #[serde(default)]
    pub response_id: String,
}

/// Accumulated usage ledger for one LLM.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    #[serde(default)]
    pub model_name: String,
    accumulated_cost: f64,
    #[serde(default)]
    token_usages: Vec<TokenUsage>,
}

impl Metrics {
    pub fn new(model_name: impl Into<String>) -> Self {
        Self {
            model_name: model_name.into(),
            accumulated_cost: 0.0,
            token_usages: Vec::new(),
        }
    }

    pub fn accumulated_cost(&self) -> f64 {
        self.accumulated_cost
    }

    /// Add the cost of one LLM call. Negative values are rejected so the
    /// ledger stays monotonic.
    pub fn add_cost(&mut self, cost: f64) {
        if cost < 0.0 {
            log::warn!("ignoring negative cost delta {cost}");
            return;
        }
        self.accumulated_cost += cost;
    }

    pub fn add_token_usage(&mut self, usage: TokenUsage) {
        self.token_usages.push(usage);
    }

    pub fn token_usages(&self) -> &[TokenUsage] {
        &self.token_usages
    }

    pub fn latest_token_usage(&self) -> Option<&TokenUsage> {
        self.token_usages.last()
    }

    /// Fold another ledger into this one.
    pub fn merge(&mut self, other: &Metrics) {
        self.accumulated_cost += other.accumulated_cost;
        self.token_usages.extend(other.token_usages.iter().cloned());
    }

    /// The portion of this ledger that `seen` has not accounted for yet:
    /// the cost added and the token usages recorded since `seen` was
    /// captured. `seen` must be an earlier snapshot of this same ledger.
    /// Merging the delta instead of the full ledger keeps repeated sync
    /// points from counting the same spend twice.
    pub fn delta_since(&self, seen: &Metrics) -> Metrics {
        let mut delta = Metrics::new(self.model_name.clone());
        let cost = self.accumulated_cost - seen.accumulated_cost;
        if cost > 0.0 {
            delta.accumulated_cost = cost;
        }
        delta.token_usages = self
            .token_usages
            .iter()
            .skip(seen.token_usages.len())
            .cloned()
            .collect();
        delta
    }

    /// A lightweight copy for attaching to outgoing actions: the current
    /// total cost plus only the latest token usage. Long conversations
    /// would otherwise drag the full usage history through every event.
    pub fn display_snapshot(&self) -> Metrics {
        let mut snapshot = Metrics::new(self.model_name.clone());
        snapshot.accumulated_cost = self.accumulated_cost;
        if let Some(latest) = self.token_usages.last() {
            snapshot.token_usages.push(latest.clone());
        }
        snapshot
    }
}

/// A metrics ledger shared between a parent controller and its delegates.
///
/// The parent owns the aggregate; delegates hold clones of the handle and
/// merge into it. Cloning shares the underlying ledger.
#[derive(Debug, Clone, Default)]
pub struct SharedMetrics(Arc<Mutex<Metrics>>);

impl SharedMetrics {
    pub fn new(metrics: Metrics) -> Self {
        Self(Arc::new(Mutex::new(metrics)))
    }

    pub fn accumulated_cost(&self) -> f64 {
        self.0.lock().accumulated_cost()
    }

    pub fn merge(&self, other: &Metrics) {
        self.0.lock().merge(other);
    }

    pub fn snapshot(&self) -> Metrics {
        self.0.lock().clone()
    }

    /// Whether two handles share the same underlying ledger.
    pub fn shares_with(&self, other: &SharedMetrics) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl From<Metrics> for SharedMetrics {
    fn from(metrics: Metrics) -> Self {
        Self::new(metrics)
    }
}

impl Serialize for SharedMetrics {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.lock().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for SharedMetrics {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Metrics::deserialize(deserializer).map(SharedMetrics::new)
    }
}

//! LLM and agent configuration.

use serde::{Deserialize, Serialize};

/// Configuration for the LLM backing an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub model: String,
    /// Observations longer than this are truncated before logging.
    pub max_message_chars: usize,
    pub temperature: Option<f64>,
    pub max_output_tokens: Option<u64>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: String::new(),
            max_message_chars: 30_000,
            temperature: None,
            max_output_tokens: None,
        }
    }
}

impl LlmConfig {
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }
}

/// Per-agent behavior switches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Whether the controller may halve history on a context-window error
    /// instead of failing the run.
    pub enable_history_truncation: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            enable_history_truncation: true,
        }
    }
}

/// Shorten oversized content for log output, keeping both ends.
pub fn truncate_content(content: &str, max_chars: usize) -> String {
    if content.len() <= max_chars {
        return content.to_string();
    }
    let half = max_chars / 2;
    // cut on char boundaries
    let head: String = content.chars().take(half).collect();
    let tail_len = content.chars().count().saturating_sub(half);
    let tail: String = content.chars().skip(tail_len).collect();
    format!(
        "{head}\n[... {} chars omitted ...]\n{tail}",
        content.chars().count().saturating_sub(half * 2)
    )
}

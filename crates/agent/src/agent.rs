//! The agent capability consumed by the controller.
//!
//! The controller treats the agent as an opaque `step(state) -> action`
//! capability that may fail; action selection and the LLM client live
//! behind this trait.

use crate::error::ControllerError;
use crate::state::State;
use async_trait::async_trait;
use stride::config::{AgentConfig, LlmConfig};
use stride::error::LlmError;
use stride::events::Action;
use stride::metrics::Metrics;

#[async_trait]
pub trait Agent: Send {
    /// Human-readable agent name; surfaces in delegate observations.
    fn name(&self) -> &str;

    fn config(&self) -> &AgentConfig;

    fn llm_config(&self) -> &LlmConfig;

    /// The ledger accumulated by this agent's LLM so far.
    fn metrics(&self) -> &Metrics;

    /// Mutable access to the ledger, for folding in usage reported by
    /// observations.
    fn metrics_mut(&mut self) -> &mut Metrics;

    /// Choose the next action given the controller's state. May block on
    /// LLM I/O.
    async fn step(&mut self, state: &State) -> Result<Action, LlmError>;

    /// Drop per-task caches; called when the controller stops or errors.
    fn reset(&mut self);
}

/// Source of delegate agents, looked up by the name carried on a delegate
/// action.
pub trait AgentRegistry: Send + Sync {
    fn create(
        &self,
        name: &str,
        llm_config: &LlmConfig,
        agent_config: &AgentConfig,
    ) -> Result<Box<dyn Agent>, ControllerError>;
}

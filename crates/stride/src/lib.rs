//! Shared protocol layer for the stride agent controller.
//!
//! This crate holds everything both sides of the event stream agree on:
//!
//! - The event model: actions authored by the user or the agent, and
//!   observations reporting their results ([`events`]).
//! - The metrics ledger accumulated across LLM calls ([`metrics`]).
//! - The LLM failure taxonomy the controller classifies against ([`error`]).
//! - LLM and agent configuration ([`config`]).
//!
//! The controller itself lives in the `stride-agent` crate.

pub mod config;
pub mod error;
pub mod events;
pub mod metrics;

pub use config::{AgentConfig, LlmConfig};
pub use error::LlmError;
pub use events::{
    Action, ActionKind, AgentState, ConfirmationState, Event, EventKind, EventSource, Observation,
    ObservationKind, RecallType, ToolCallMetadata,
};
pub use metrics::{Metrics, SharedMetrics, TokenUsage};

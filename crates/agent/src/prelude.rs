//! Convenience re-exports for embedding the controller.

pub use crate::agent::{Agent, AgentRegistry};
pub use crate::controller::{AgentController, ControllerBuilder, ControllerConfig};
pub use crate::error::{ControllerError, StatusCallback, StatusLevel, TrafficLimit, status};
pub use crate::event_stream::{EventFilter, EventHandler, EventStream, EventSubscriber};
pub use crate::state::{State, TrafficControlState};
pub use stride::config::{AgentConfig, LlmConfig};
pub use stride::error::LlmError;
pub use stride::events::{
    Action, ActionKind, AgentState, ConfirmationState, Event, EventKind, EventSource, Observation,
    ObservationKind, RecallType, ToolCallMetadata,
};
pub use stride::metrics::{Metrics, SharedMetrics, TokenUsage};

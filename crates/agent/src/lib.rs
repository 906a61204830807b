//! The stride execution controller.
//!
//! Drives a single LLM-backed agent through an iterative perceive–decide–act
//! loop against an ordered in-memory event stream: event ingest, step
//! scheduling, nested delegates, iteration/budget traffic control, stuck
//! detection, failure classification, context-window trimming, and
//! rehydration of controller history from the event log.

pub mod agent;
pub mod condenser;
pub mod controller;
pub mod error;
pub mod event_stream;
pub mod history;
pub mod prelude;
pub mod replay;
pub mod state;
pub mod stuck;


pub use agent::{Agent, AgentRegistry};
pub use controller::{AgentController, ControllerBuilder, ControllerConfig};
pub use error::{ControllerError, StatusCallback, StatusLevel, TrafficLimit, status};
pub use event_stream::{EventFilter, EventHandler, EventStream, EventSubscriber};
pub use replay::ReplayManager;
pub use state::{State, TrafficControlState};
pub use stuck::StuckDetector;

// The agent-state enum lives with the event model; re-export it next to the
// controller that drives it.
pub use stride::events::AgentState;

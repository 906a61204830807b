//! The authoritative record of one controller's run.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use stride::events::{AgentState, Event};
use stride::metrics::{Metrics, SharedMetrics};

/// Iteration/budget throttle machinery state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrafficControlState {
    /// Default state, no rate limiting.
    #[default]
    Normal,
    /// Hit a limit and is waiting for the user.
    Throttling,
    /// The user resumed past a limit; one breach is forgiven.
    Paused,
}

/// Everything a controller owns about its run. Created at construction
/// (fresh or restored), mutated only by the owning controller, frozen by a
/// final range query at close.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct State {
    pub session_id: String,
    /// 0 at the root; each delegate is one deeper.
    pub delegate_level: u32,

    /// Global step counter, shared down the delegate chain.
    pub iteration: u64,
    /// Steps taken by this controller alone.
    pub local_iteration: u64,
    pub max_iterations: u64,
    /// The cap as originally configured; extensions add this amount.
    pub initial_max_iterations: u64,
    pub max_budget: Option<f64>,
    pub initial_max_budget: Option<f64>,

    pub agent_state: AgentState,
    pub traffic_control_state: TrafficControlState,
    pub confirmation_mode: bool,

    /// Inclusive slice of stream ids this controller considers its history.
    pub start_id: u64,
    /// None means "up to latest".
    pub end_id: Option<u64>,
    pub history: Vec<Event>,

    /// At most one in-flight action awaiting its observation, confirmation,
    /// or recall result. Not persisted: a restored session re-derives any
    /// dangling action from history.
    #[serde(skip)]
    pub pending_action: Option<Event>,

    /// Shared with delegates; cost only grows.
    pub metrics: SharedMetrics,
    /// This controller's own ledger; never shared.
    pub local_metrics: Metrics,

    pub last_error: String,
    pub inputs: serde_json::Map<String, Value>,
    pub outputs: serde_json::Map<String, Value>,

    #[serde(skip)]
    pub(crate) cached_first_user_message: Option<Event>,
}

impl Default for State {
    fn default() -> Self {
        Self {
            session_id: String::new(),
            delegate_level: 0,
            iteration: 0,
            local_iteration: 0,
            max_iterations: 100,
            initial_max_iterations: 100,
            max_budget: None,
            initial_max_budget: None,
            agent_state: AgentState::Loading,
            traffic_control_state: TrafficControlState::Normal,
            confirmation_mode: false,
            start_id: 0,
            end_id: None,
            history: Vec::new(),
            pending_action: None,
            metrics: SharedMetrics::default(),
            local_metrics: Metrics::default(),
            last_error: String::new(),
            inputs: serde_json::Map::new(),
            outputs: serde_json::Map::new(),
            cached_first_user_message: None,
        }
    }
}

impl State {
    pub fn new(session_id: impl Into<String>, max_iterations: u64) -> Self {
        Self {
            session_id: session_id.into(),
            max_iterations,
            initial_max_iterations: max_iterations,
            ..Default::default()
        }
    }
}

//! The event model: actions, observations, and the published event envelope.
//!
//! An [`Event`] only exists once the stream has accepted it; the stream
//! assigns the id and timestamp. Before that point code passes around an
//! [`EventKind`] (an [`Action`] or an [`Observation`] payload).

use crate::metrics::Metrics;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Who authored an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    User,
    Agent,
    Environment,
}

/// Lifecycle state of a single agent controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Loading,
    Running,
    Paused,
    AwaitingUserInput,
    AwaitingUserConfirmation,
    UserConfirmed,
    UserRejected,
    Finished,
    Rejected,
    Error,
    Stopped,
    RateLimited,
}

impl AgentState {
    /// States that end a delegate's run as seen by its parent.
    pub fn is_terminal_for_delegate(self) -> bool {
        matches!(self, Self::Finished | Self::Rejected | Self::Error)
    }
}

/// Confirmation status stamped onto runnable actions when confirmation
/// mode is on. Absence means no confirmation is involved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationState {
    AwaitingConfirmation,
    Confirmed,
    Rejected,
}

/// What a recall action is asking the knowledge layer for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecallType {
    /// Workspace-wide context, fetched for the first user message.
    WorkspaceContext,
    /// Targeted knowledge lookup for follow-up messages.
    Knowledge,
}

/// Correlation token linking an action to the tool call that produced it,
/// and to the observation that answers it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallMetadata {
    pub tool_call_id: String,
    pub function_name: String,
}

/// An action requested by the user or chosen by the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ActionKind {
    Message {
        content: String,
        #[serde(default)]
        wait_for_response: bool,
    },
    /// Hand a subtask to a named delegate agent.
    Delegate {
        agent: String,
        #[serde(default)]
        inputs: serde_json::Map<String, Value>,
    },
    Finish {
        #[serde(default)]
        outputs: serde_json::Map<String, Value>,
    },
    Reject {
        #[serde(default)]
        outputs: serde_json::Map<String, Value>,
    },
    ChangeAgentState {
        agent_state: AgentState,
    },
    /// Marker recording the id range of events dropped by a history trim.
    Condensation {
        forgotten_events_start_id: u64,
        forgotten_events_end_id: u64,
    },
    Recall {
        query: String,
        recall_type: RecallType,
    },
    CmdRun {
        command: String,
    },
    IPythonRun {
        code: String,
    },
    Null,
}

impl ActionKind {
    /// Whether the action is executed by the environment and therefore
    /// expects an observation in response.
    pub fn runnable(&self) -> bool {
        matches!(self, Self::CmdRun { .. } | Self::IPythonRun { .. })
    }
}

/// An action payload with its cross-cutting attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Action {
    pub kind: ActionKind,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub thought: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmation_state: Option<ConfirmationState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_metadata: Option<ToolCallMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_metrics: Option<Metrics>,
}

impl Default for ActionKind {
    fn default() -> Self {
        Self::Null
    }
}

impl Action {
    pub fn new(kind: ActionKind) -> Self {
        Self {
            kind,
            ..Default::default()
        }
    }

    pub fn with_thought(mut self, thought: impl Into<String>) -> Self {
        self.thought = thought.into();
        self
    }

    pub fn runnable(&self) -> bool {
        self.kind.runnable()
    }
}

/// What an observation reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "observation", rename_all = "snake_case")]
pub enum ObservationKind {
    AgentStateChanged {
        agent_state: AgentState,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        reason: String,
    },
    /// A delegate finished; carries whatever it produced.
    DelegateDone {
        #[serde(default)]
        outputs: serde_json::Map<String, Value>,
    },
    Error,
    Null,
    /// Result of a runnable action.
    CmdOutput {
        #[serde(default)]
        exit_code: i32,
    },
}

/// An observation payload with its cross-cutting attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub kind: ObservationKind,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_metadata: Option<ToolCallMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_metrics: Option<Metrics>,
}

impl Observation {
    pub fn new(kind: ObservationKind, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
            tool_call_metadata: None,
            llm_metrics: None,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self::new(ObservationKind::Error, content)
    }
}

/// The two halves of the event stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    Action(Action),
    Observation(Observation),
}

impl From<Action> for EventKind {
    fn from(action: Action) -> Self {
        Self::Action(action)
    }
}

impl From<ActionKind> for EventKind {
    fn from(kind: ActionKind) -> Self {
        Self::Action(Action::new(kind))
    }
}

impl From<Observation> for EventKind {
    fn from(observation: Observation) -> Self {
        Self::Observation(observation)
    }
}

/// A published event. Ids increase monotonically in publication order;
/// both id and timestamp are assigned by the stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: u64,
    pub timestamp: i64,
    pub source: EventSource,
    #[serde(default)]
    pub hidden: bool,
    /// For observations: id of the action this answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<u64>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl Event {
    pub fn is_action(&self) -> bool {
        matches!(self.kind, EventKind::Action(_))
    }

    pub fn is_observation(&self) -> bool {
        matches!(self.kind, EventKind::Observation(_))
    }

    pub fn as_action(&self) -> Option<&Action> {
        match &self.kind {
            EventKind::Action(action) => Some(action),
            EventKind::Observation(_) => None,
        }
    }

    pub fn as_action_mut(&mut self) -> Option<&mut Action> {
        match &mut self.kind {
            EventKind::Action(action) => Some(action),
            EventKind::Observation(_) => None,
        }
    }

    pub fn as_observation(&self) -> Option<&Observation> {
        match &self.kind {
            EventKind::Action(_) => None,
            EventKind::Observation(observation) => Some(observation),
        }
    }

    /// True for a user-authored message action.
    pub fn is_user_message(&self) -> bool {
        self.source == EventSource::User
            && matches!(
                self.kind,
                EventKind::Action(Action {
                    kind: ActionKind::Message { .. },
                    ..
                })
            )
    }

    /// Backend bookkeeping events that never enter controller history.
    pub fn filtered_out(&self) -> bool {
        match &self.kind {
            EventKind::Action(action) => matches!(
                action.kind,
                ActionKind::Null | ActionKind::ChangeAgentState { .. }
            ),
            EventKind::Observation(observation) => matches!(
                observation.kind,
                ObservationKind::Null | ObservationKind::AgentStateChanged { .. }
            ),
        }
    }
}

/// Render a delegate's outputs the way they are reported to the parent.
pub fn format_outputs(outputs: &serde_json::Map<String, Value>) -> String {
    outputs
        .iter()
        .map(|(key, value)| match value {
            Value::String(s) => format!("{}: {}", key, s),
            other => format!("{}: {}", key, other),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

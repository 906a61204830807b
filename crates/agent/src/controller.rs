//! The agent execution controller.
//!
//! One controller owns one [`State`] and drives one agent. The root
//! controller subscribes to the event stream; delegates receive events
//! forwarded by their parent. All state mutation happens under a single
//! async mutex, and events reach a controller in stream order, so handlers
//! never observe a half-applied transition.

use crate::agent::{Agent, AgentRegistry};
use crate::condenser::apply_conversation_window;
use crate::error::{
    ControllerError, StatusCallback, StatusLevel, TrafficLimit, status,
};
use crate::event_stream::{EventFilter, EventHandler, EventStream, EventSubscriber};
use crate::history::init_history;
use crate::replay::ReplayManager;
use crate::state::{State, TrafficControlState};
use crate::stuck::StuckDetector;
use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use stride::config::{AgentConfig, LlmConfig, truncate_content};
use stride::error::LlmError;
use stride::events::{
    Action, ActionKind, AgentState, ConfirmationState, Event, EventKind, EventSource, Observation,
    ObservationKind, RecallType, format_outputs,
};
use tokio::sync::Mutex as TokioMutex;

const DELEGATE_SUFFIX: &str = "-delegate";

/// Static configuration for one controller.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Defaults to the stream's session id.
    pub session_id: Option<String>,
    pub max_iterations: u64,
    pub max_budget_per_task: Option<f64>,
    /// Hold runnable actions until the user confirms them.
    pub confirmation_mode: bool,
    /// No user is watching: limits are fatal and stuck detection is strict.
    pub headless: bool,
    /// Per-delegate-name LLM config overrides.
    pub agent_llm_configs: HashMap<String, LlmConfig>,
    /// Per-delegate-name agent config overrides.
    pub agent_configs: HashMap<String, AgentConfig>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            session_id: None,
            max_iterations: 100,
            max_budget_per_task: None,
            confirmation_mode: false,
            headless: true,
            agent_llm_configs: HashMap::new(),
            agent_configs: HashMap::new(),
        }
    }
}

impl ControllerConfig {
    pub fn max_iterations(mut self, max_iterations: u64) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn max_budget_per_task(mut self, max_budget: f64) -> Self {
        self.max_budget_per_task = Some(max_budget);
        self
    }

    pub fn confirmation_mode(mut self, enabled: bool) -> Self {
        self.confirmation_mode = enabled;
        self
    }

    pub fn headless(mut self, headless: bool) -> Self {
        self.headless = headless;
        self
    }

    pub fn from_toml(raw: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(raw)?)
    }
}

/// Builder for [`AgentController`]; `build` rehydrates history and, for a
/// root controller, subscribes to the stream.
pub struct ControllerBuilder {
    agent: Box<dyn Agent>,
    stream: Arc<EventStream>,
    config: ControllerConfig,
    initial_state: Option<State>,
    is_delegate: bool,
    status_callback: Option<StatusCallback>,
    replay_events: Option<Vec<Event>>,
    registry: Option<Arc<dyn AgentRegistry>>,
}

impl ControllerBuilder {
    pub fn config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn session_id(mut self, session_id: impl Into<String>) -> Self {
        self.config.session_id = Some(session_id.into());
        self
    }

    pub fn max_iterations(mut self, max_iterations: u64) -> Self {
        self.config.max_iterations = max_iterations;
        self
    }

    pub fn max_budget_per_task(mut self, max_budget: f64) -> Self {
        self.config.max_budget_per_task = Some(max_budget);
        self
    }

    pub fn confirmation_mode(mut self, enabled: bool) -> Self {
        self.config.confirmation_mode = enabled;
        self
    }

    pub fn headless(mut self, headless: bool) -> Self {
        self.config.headless = headless;
        self
    }

    /// State from a previous session or from a parent controller.
    pub fn initial_state(mut self, state: State) -> Self {
        self.initial_state = Some(state);
        self
    }

    /// Delegates do not subscribe to the stream; the parent forwards.
    pub fn delegate(mut self, is_delegate: bool) -> Self {
        self.is_delegate = is_delegate;
        self
    }

    pub fn status_callback(mut self, callback: StatusCallback) -> Self {
        self.status_callback = Some(callback);
        self
    }

    /// Prerecorded actions that substitute for the LLM until drained.
    pub fn replay_events(mut self, events: Vec<Event>) -> Self {
        self.replay_events = Some(events);
        self
    }

    pub fn registry(mut self, registry: Arc<dyn AgentRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn agent_llm_configs(mut self, configs: HashMap<String, LlmConfig>) -> Self {
        self.config.agent_llm_configs = configs;
        self
    }

    pub fn agent_configs(mut self, configs: HashMap<String, AgentConfig>) -> Self {
        self.config.agent_configs = configs;
        self
    }

    pub fn build(self) -> AgentController {
        let id = self
            .config
            .session_id
            .clone()
            .unwrap_or_else(|| self.stream.session_id().to_string());

        let mut state = match self.initial_state {
            Some(state) => state,
            None => {
                let mut state = State::new(
                    id.strip_suffix(DELEGATE_SUFFIX).unwrap_or(&id),
                    self.config.max_iterations,
                );
                state.confirmation_mode = self.config.confirmation_mode;
                state.max_budget = self.config.max_budget_per_task;
                log::debug!("[controller {id}] created new state, start_id 0");
                state
            }
        };
        // Caps come from the construction site even on a restored state, so
        // a resumed session picks up current limits.
        state.initial_max_iterations = self.config.max_iterations;
        state.initial_max_budget = self.config.max_budget_per_task;
        if state.max_budget.is_none() {
            state.max_budget = self.config.max_budget_per_task;
        }

        init_history(&self.stream, &mut state);
        log::debug!(
            "[controller {id}] initialized history from event {} ({} events)",
            state.start_id,
            state.history.len()
        );

        let controller = AgentController {
            inner: Arc::new(Inner {
                id: id.clone(),
                agent_name: self.agent.name().to_string(),
                stream: self.stream,
                is_delegate: self.is_delegate,
                headless: self.config.headless,
                status_callback: self.status_callback,
                registry: self.registry,
                agent_llm_configs: self.config.agent_llm_configs,
                agent_configs: self.config.agent_configs,
                mutable: TokioMutex::new(Mutable {
                    agent: self.agent,
                    state,
                    delegate: None,
                    stuck: StuckDetector::new(),
                    replay: ReplayManager::new(self.replay_events),
                    closed: false,
                }),
            }),
        };

        if !controller.inner.is_delegate {
            controller.inner.stream.subscribe(
                EventSubscriber::AgentController,
                id,
                Arc::new(StreamCallback {
                    controller: controller.clone(),
                }),
            );
        }
        controller
    }
}

struct Inner {
    id: String,
    agent_name: String,
    stream: Arc<EventStream>,
    is_delegate: bool,
    headless: bool,
    status_callback: Option<StatusCallback>,
    registry: Option<Arc<dyn AgentRegistry>>,
    agent_llm_configs: HashMap<String, LlmConfig>,
    agent_configs: HashMap<String, AgentConfig>,
    mutable: TokioMutex<Mutable>,
}

struct Mutable {
    agent: Box<dyn Agent>,
    state: State,
    delegate: Option<AgentController>,
    stuck: StuckDetector,
    replay: ReplayManager,
    closed: bool,
}

struct StreamCallback {
    controller: AgentController,
}

#[async_trait]
impl EventHandler for StreamCallback {
    async fn handle_event(&self, event: Event) {
        self.controller.on_event(event).await;
    }
}

/// Handle to one controller. Clones share the controller.
#[derive(Clone)]
pub struct AgentController {
    inner: Arc<Inner>,
}

impl AgentController {
    pub fn builder(agent: Box<dyn Agent>, stream: Arc<EventStream>) -> ControllerBuilder {
        ControllerBuilder {
            agent,
            stream,
            config: ControllerConfig::default(),
            initial_state: None,
            is_delegate: false,
            status_callback: None,
            replay_events: None,
            registry: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub async fn get_state(&self) -> State {
        self.inner.mutable.lock().await.state.clone()
    }

    pub async fn get_agent_state(&self) -> AgentState {
        self.inner.mutable.lock().await.state.agent_state
    }

    pub async fn set_agent_state(&self, new_state: AgentState) {
        let mut m = self.inner.mutable.lock().await;
        self.transition(&mut m, new_state);
    }

    /// Forward an LLM retry notification to the status callback.
    pub fn notify_llm_retry(&self, retries: usize, max: usize) {
        if let Some(callback) = &self.inner.status_callback {
            callback(
                StatusLevel::Info,
                status::LLM_RETRY,
                &format!("Retrying LLM request, {retries} / {max}"),
            );
        }
    }

    /// Stream callback entry point; also the forwarding target when this
    /// controller is a delegate. Routes to the active delegate when one is
    /// running.
    pub fn on_event<'a>(&'a self, event: Event) -> BoxFuture<'a, ()> {
        async move {
            let delegate = self.inner.mutable.lock().await.delegate.clone();
            if let Some(delegate) = delegate {
                if !delegate.get_agent_state().await.is_terminal_for_delegate() {
                    delegate.on_event(event).await;
                } else {
                    // The delegate wrapped up; this event is consumed by the
                    // supervisor itself.
                    self.end_delegate().await;
                }
                return;
            }
            self.handle_event_locally(event).await;
        }
        .boxed()
    }

    async fn handle_event_locally(&self, event: Event) {
        if event.hidden {
            return;
        }
        // Let other tasks make progress before taking the lock.
        tokio::task::yield_now().await;

        let mut m = self.inner.mutable.lock().await;
        if m.closed {
            // History was frozen by close; late events no longer belong to
            // this controller.
            return;
        }
        if !event.filtered_out() {
            m.state.history.push(event.clone());
        }

        match &event.kind {
            EventKind::Action(_) => self.handle_action(&mut m, &event).await,
            EventKind::Observation(_) => self.handle_observation(&mut m, &event),
        }

        if self.should_step(&m, &event) {
            self.spawn_step();
        }
    }

    async fn handle_action(&self, m: &mut Mutable, event: &Event) {
        let Some(action) = event.as_action() else {
            return;
        };
        match &action.kind {
            ActionKind::ChangeAgentState { agent_state } => {
                self.transition(m, *agent_state);
            }
            ActionKind::Message { .. } => self.handle_message_action(m, event),
            ActionKind::Delegate { agent, inputs } => {
                self.start_delegate(m, agent, inputs.clone());
                if m.delegate.is_some() {
                    if let Some(task) = inputs.get("task") {
                        let task = match task.as_str() {
                            Some(task) => task.to_string(),
                            None => task.to_string(),
                        };
                        self.inner.stream.add_event(
                            ActionKind::Message {
                                content: format!("TASK: {task}"),
                                wait_for_response: false,
                            },
                            EventSource::User,
                        );
                        if let Some(delegate) = &m.delegate {
                            delegate.set_agent_state(AgentState::Running).await;
                        }
                    }
                }
            }
            ActionKind::Finish { outputs } => {
                m.state.outputs = outputs.clone();
                self.sync_shared_metrics(m);
                self.transition(m, AgentState::Finished);
            }
            ActionKind::Reject { outputs } => {
                m.state.outputs = outputs.clone();
                self.sync_shared_metrics(m);
                self.transition(m, AgentState::Rejected);
            }
            _ => {}
        }
    }

    fn handle_observation(&self, m: &mut Mutable, event: &Event) {
        let Some(observation) = event.as_observation() else {
            return;
        };
        log::debug!(
            "[controller {}] observation: {}",
            self.inner.id,
            truncate_content(
                &observation.content,
                m.agent.llm_config().max_message_chars
            )
        );

        if let Some(llm_metrics) = &observation.llm_metrics {
            m.agent.metrics_mut().merge(llm_metrics);
        }

        // Runnable actions and recalls resolve through their observation.
        let pending_id = m.state.pending_action.as_ref().map(|pending| pending.id);
        if pending_id.is_some() && pending_id == event.cause {
            if m.state.agent_state == AgentState::AwaitingUserConfirmation {
                return;
            }
            m.state.pending_action = None;
            if m.state.agent_state == AgentState::UserConfirmed {
                self.transition(m, AgentState::Running);
            }
            if m.state.agent_state == AgentState::UserRejected {
                self.transition(m, AgentState::AwaitingUserInput);
            }
            return;
        }

        if matches!(observation.kind, ObservationKind::Error)
            && m.state.agent_state == AgentState::Error
        {
            self.sync_shared_metrics(m);
        }
    }

    /// Refresh `local_metrics` from the agent's ledger and flow the
    /// not-yet-counted remainder into the shared ledger. Safe to call at
    /// every sync point: each unit of spend is counted exactly once.
    fn sync_shared_metrics(&self, m: &mut Mutable) {
        let delta = m.agent.metrics().delta_since(&m.state.local_metrics);
        m.state.metrics.merge(&delta);
        m.state.local_metrics = m.agent.metrics().clone();
    }

    fn handle_message_action(&self, m: &mut Mutable, event: &Event) {
        match event.source {
            EventSource::User => {
                log::debug!("[controller {}] user message {}", self.inner.id, event.id);
                // A user message buys the agent a fresh iteration allowance
                // when someone is around to watch it spend it.
                if !self.inner.headless {
                    m.state.max_iterations = m.state.iteration + m.state.initial_max_iterations;
                    if m.state.traffic_control_state != TrafficControlState::Normal {
                        m.state.traffic_control_state = TrafficControlState::Normal;
                    }
                    log::debug!(
                        "[controller {}] extended max iterations to {} after user message",
                        self.inner.id,
                        m.state.max_iterations
                    );
                }

                let first_user_message = self.first_user_message(m);
                let is_first_user_message = first_user_message
                    .map(|first| first.id == event.id)
                    .unwrap_or(false);
                let recall_type = if is_first_user_message {
                    RecallType::WorkspaceContext
                } else {
                    RecallType::Knowledge
                };

                let query = match &event.kind {
                    EventKind::Action(Action {
                        kind: ActionKind::Message { content, .. },
                        ..
                    }) => content.clone(),
                    _ => String::new(),
                };
                // The user message is the trigger, so the recall goes out as
                // the user's.
                let recall = self.inner.stream.add_event(
                    ActionKind::Recall { query, recall_type },
                    EventSource::User,
                );
                m.state.pending_action = Some(recall);

                if m.state.agent_state != AgentState::Running {
                    self.transition(m, AgentState::Running);
                }
            }
            EventSource::Agent => {
                if let Some(Action {
                    kind: ActionKind::Message {
                        wait_for_response: true,
                        ..
                    },
                    ..
                }) = event.as_action()
                {
                    self.transition(m, AgentState::AwaitingUserInput);
                }
            }
            EventSource::Environment => {}
        }
    }

    fn should_step(&self, m: &Mutable, event: &Event) -> bool {
        // While a delegate runs, only the delegate steps.
        if m.delegate.is_some() {
            return false;
        }
        match &event.kind {
            EventKind::Action(action) => match &action.kind {
                ActionKind::Message { .. } if event.source == EventSource::User => true,
                ActionKind::Message { .. } => {
                    m.state.agent_state != AgentState::AwaitingUserInput
                }
                ActionKind::Delegate { .. } => true,
                ActionKind::Condensation { .. } => true,
                _ => false,
            },
            EventKind::Observation(observation) => match &observation.kind {
                // A null observation answers a recall (cause > 0); the one
                // caused by the very first user message carries cause 0.
                ObservationKind::Null => event.cause.is_some_and(|cause| cause > 0),
                ObservationKind::AgentStateChanged { .. } => false,
                _ => true,
            },
        }
    }

    fn spawn_step(&self) {
        let controller = self.clone();
        tokio::spawn(async move {
            controller.step().await;
        });
    }

    /// Run one step, classifying anything the step throws.
    pub async fn step(&self) {
        let mut m = self.inner.mutable.lock().await;
        if let Err(error) = self.run_step(&mut m).await {
            log::error!(
                "[controller {}] error while running the agent: {error}",
                self.inner.id
            );
            let reported = if matches!(
                error,
                ControllerError::Llm(_) | ControllerError::ContextWindowExceeded
            ) {
                error
            } else {
                log::warn!(
                    "[controller {}] unknown error kind while running the agent: {}",
                    self.inner.id,
                    error.class_name()
                );
                ControllerError::Internal(format!(
                    "There was an unexpected error while running the agent: {}. \
                     You can refresh the page or ask the agent to try again.",
                    error.class_name()
                ))
            };
            self.react_to_error(&mut m, reported);
        }
    }

    async fn run_step(&self, m: &mut Mutable) -> Result<(), ControllerError> {
        if m.state.agent_state != AgentState::Running {
            return Ok(());
        }
        if m.state.pending_action.is_some() {
            return Ok(());
        }

        log::debug!(
            "[controller {}] LEVEL {} LOCAL STEP {} GLOBAL STEP {}",
            self.inner.id,
            m.state.delegate_level,
            m.state.local_iteration,
            m.state.iteration
        );

        let mut stop_step = false;
        let iteration = m.state.iteration;
        let max_iterations = m.state.max_iterations;
        if iteration >= max_iterations {
            stop_step = self.handle_traffic_control(
                m,
                TrafficLimit::Iteration,
                iteration as f64,
                max_iterations as f64,
            );
        }
        if let Some(max_budget) = m.state.max_budget {
            let current_cost = m.state.metrics.accumulated_cost();
            if current_cost > max_budget {
                stop_step =
                    self.handle_traffic_control(m, TrafficLimit::Budget, current_cost, max_budget);
            }
        }
        if stop_step {
            log::warn!("[controller {}] stopping agent due to traffic control", self.inner.id);
            return Ok(());
        }

        if m.stuck.is_stuck(&m.state.history, self.inner.headless) {
            self.react_to_error(m, ControllerError::StuckInLoop);
            return Ok(());
        }

        m.state.iteration += 1;
        m.state.local_iteration += 1;

        let mut action = if m.replay.should_replay() {
            // In replay mode the agent does not get a say; the recorded
            // trajectory does.
            match m.replay.next_action() {
                Some(action) => action,
                None => Action::new(ActionKind::Null),
            }
        } else {
            match m.agent.step(&m.state).await {
                Ok(action) => action,
                Err(error) if error.is_transient_output_error() => {
                    self.inner
                        .stream
                        .add_event(Observation::error(error.to_string()), EventSource::Agent);
                    return Ok(());
                }
                Err(error) if error.looks_like_context_window_error() => {
                    if m.agent.config().enable_history_truncation {
                        return self.handle_long_context(m);
                    }
                    return Err(ControllerError::ContextWindowExceeded);
                }
                Err(error) => return Err(error.into()),
            }
        };

        if action.runnable()
            && m.state.confirmation_mode
            && matches!(
                action.kind,
                ActionKind::CmdRun { .. } | ActionKind::IPythonRun { .. }
            )
        {
            action.confirmation_state = Some(ConfirmationState::AwaitingConfirmation);
        }

        if !matches!(action.kind, ActionKind::Null) {
            if action.confirmation_state == Some(ConfirmationState::AwaitingConfirmation) {
                self.transition(m, AgentState::AwaitingUserConfirmation);
            }

            // A lightweight snapshot rides on the action for display; the
            // full ledger would grow with the conversation.
            action.llm_metrics = Some(m.agent.metrics().display_snapshot());

            let runnable = action.runnable();
            let published = self
                .inner
                .stream
                .add_event(action.clone(), EventSource::Agent);
            if runnable {
                m.state.pending_action = Some(published);
            }
            log::debug!(
                "[controller {}] published action {:?}",
                self.inner.id,
                action.kind
            );
        }

        // Flow this step's spend into the shared ledger so budget control
        // sees it before the next step starts.
        self.sync_shared_metrics(m);
        Ok(())
    }

    /// Returns true when the step must stop here.
    fn handle_traffic_control(
        &self,
        m: &mut Mutable,
        limit: TrafficLimit,
        current: f64,
        max: f64,
    ) -> bool {
        if m.state.traffic_control_state == TrafficControlState::Paused {
            // The user resumed past this limit once; forgive the breach.
            log::debug!(
                "[controller {}] hitting traffic control, temporarily resumed on user request",
                self.inner.id
            );
            m.state.traffic_control_state = TrafficControlState::Normal;
            return false;
        }
        m.state.traffic_control_state = TrafficControlState::Throttling;
        self.react_to_error(
            m,
            ControllerError::TrafficControl {
                limit,
                current,
                max,
                headless: self.inner.headless,
            },
        );
        true
    }

    /// Record the failure, tell the operator, transition to Error (or
    /// RateLimited).
    fn react_to_error(&self, m: &mut Mutable, error: ControllerError) {
        m.state.last_error = format!("{}: {}", error.class_name(), error);

        let mut code = "";
        if let ControllerError::Llm(llm_error) = &error {
            match llm_error {
                LlmError::Authentication(_) => code = status::ERROR_LLM_AUTHENTICATION,
                LlmError::ServiceUnavailable(_)
                | LlmError::ApiConnection(_)
                | LlmError::Api(_) => code = status::ERROR_LLM_SERVICE_UNAVAILABLE,
                LlmError::InternalServer(_) => code = status::ERROR_LLM_INTERNAL_SERVER_ERROR,
                LlmError::BadRequest(message) if message.contains("ExceededBudget") => {
                    code = status::ERROR_LLM_OUT_OF_CREDITS;
                }
                LlmError::RateLimit(_) => {
                    self.transition(m, AgentState::RateLimited);
                    return;
                }
                _ => {}
            }
        }
        if !code.is_empty() {
            m.state.last_error = code.to_string();
        }
        if let Some(callback) = &self.inner.status_callback {
            callback(StatusLevel::Error, code, &m.state.last_error);
        }

        self.transition(m, AgentState::Error);
    }

    /// Apply a state transition with its side effects and announce it.
    fn transition(&self, m: &mut Mutable, new_state: AgentState) {
        log::info!(
            "[controller {}] setting agent({}) state from {:?} to {:?}",
            self.inner.id,
            self.inner.agent_name,
            m.state.agent_state,
            new_state
        );
        if new_state == m.state.agent_state {
            return;
        }

        if matches!(new_state, AgentState::Stopped | AgentState::Error) {
            // Sync metrics before the reset wipes the agent.
            self.sync_shared_metrics(m);
            self.reset(m);
        } else if new_state == AgentState::Running
            && m.state.agent_state == AgentState::Paused
            && m.state.traffic_control_state == TrafficControlState::Throttling
        {
            // The user chose to push past a limit: forgive one breach and
            // raise the caps by their initial amounts.
            m.state.traffic_control_state = TrafficControlState::Paused;
            if !self.inner.headless && m.state.iteration >= m.state.max_iterations {
                m.state.max_iterations += m.state.initial_max_iterations;
            }
            if let (Some(max_budget), Some(initial_budget)) =
                (m.state.max_budget, m.state.initial_max_budget)
            {
                if m.state.metrics.accumulated_cost() >= max_budget {
                    m.state.max_budget = Some(max_budget + initial_budget);
                }
            }
        } else if m.state.pending_action.is_some()
            && matches!(
                new_state,
                AgentState::UserConfirmed | AgentState::UserRejected
            )
        {
            if let Some(mut pending) = m.state.pending_action.take() {
                if let Some(action) = pending.as_action_mut() {
                    action.thought.clear();
                    action.confirmation_state = Some(if new_state == AgentState::UserConfirmed {
                        ConfirmationState::Confirmed
                    } else {
                        ConfirmationState::Rejected
                    });
                }
                // Republished under a fresh id; the new event stays pending
                // so its observation can still resolve it.
                if let EventKind::Action(action) = pending.kind {
                    let republished = self.inner.stream.add_event(action, EventSource::Agent);
                    m.state.pending_action = Some(republished);
                }
            }
        }

        m.state.agent_state = new_state;

        let reason = if new_state == AgentState::Error {
            m.state.last_error.clone()
        } else {
            String::new()
        };
        self.inner.stream.add_event(
            Observation::new(
                ObservationKind::AgentStateChanged {
                    agent_state: new_state,
                    reason,
                },
                "",
            ),
            EventSource::Environment,
        );
    }

    /// Clear the pending action, leaving the agent a correlatable error
    /// observation when the action was never answered, then reset the agent.
    fn reset(&self, m: &mut Mutable) {
        if let Some(pending) = &m.state.pending_action {
            if let Some(metadata) = pending
                .as_action()
                .and_then(|action| action.tool_call_metadata.as_ref())
            {
                let answered = m.state.history.iter().any(|event| {
                    event
                        .as_observation()
                        .is_some_and(|observation| {
                            observation.tool_call_metadata.as_ref() == Some(metadata)
                        })
                });
                if !answered {
                    let mut observation = Observation::error("The action has not been executed.");
                    observation.tool_call_metadata = Some(metadata.clone());
                    self.inner.stream.add_event_full(
                        observation,
                        EventSource::Agent,
                        Some(pending.id),
                        false,
                    );
                }
            }
        }
        m.state.pending_action = None;
        m.agent.reset();
        m.stuck.reset();
    }

    /// Spin up a nested controller for a delegate action.
    fn start_delegate(
        &self,
        m: &mut Mutable,
        agent_name: &str,
        inputs: serde_json::Map<String, serde_json::Value>,
    ) {
        let Some(registry) = &self.inner.registry else {
            log::warn!(
                "[controller {}] delegate '{agent_name}' requested but no agent registry is configured",
                self.inner.id
            );
            self.inner.stream.add_event(
                Observation::error(format!(
                    "Cannot start delegate '{agent_name}': no agent registry is configured."
                )),
                EventSource::Agent,
            );
            return;
        };

        let llm_config = self
            .inner
            .agent_llm_configs
            .get(agent_name)
            .unwrap_or_else(|| m.agent.llm_config())
            .clone();
        let agent_config = self
            .inner
            .agent_configs
            .get(agent_name)
            .unwrap_or_else(|| m.agent.config())
            .clone();

        let delegate_agent = match registry.create(agent_name, &llm_config, &agent_config) {
            Ok(agent) => agent,
            Err(error) => {
                log::warn!(
                    "[controller {}] failed to create delegate '{agent_name}': {error}",
                    self.inner.id
                );
                self.inner.stream.add_event(
                    Observation::error(format!("Cannot start delegate '{agent_name}': {error}")),
                    EventSource::Agent,
                );
                return;
            }
        };

        let mut child_state = State::new(
            self.inner
                .id
                .strip_suffix(DELEGATE_SUFFIX)
                .unwrap_or(&self.inner.id),
            m.state.max_iterations,
        );
        child_state.inputs = inputs;
        child_state.iteration = m.state.iteration;
        child_state.delegate_level = m.state.delegate_level + 1;
        // One ledger across the whole delegation chain.
        child_state.metrics = m.state.metrics.clone();
        child_state.max_budget = m.state.max_budget;
        // The child's history window opens past everything published so far.
        child_state.start_id = self
            .inner
            .stream
            .latest_event_id()
            .map_or(0, |latest| latest + 1);

        log::debug!(
            "[controller {}] starting delegate, agent {} at level {}",
            self.inner.id,
            delegate_agent.name(),
            child_state.delegate_level
        );

        let mut builder = AgentController::builder(delegate_agent, self.inner.stream.clone())
            .session_id(format!("{}{DELEGATE_SUFFIX}", self.inner.id))
            .max_iterations(m.state.max_iterations)
            .headless(self.inner.headless)
            .initial_state(child_state)
            .delegate(true)
            .registry(registry.clone())
            .agent_llm_configs(self.inner.agent_llm_configs.clone())
            .agent_configs(self.inner.agent_configs.clone());
        if let Some(max_budget) = m.state.max_budget {
            builder = builder.max_budget_per_task(max_budget);
        }
        m.delegate = Some(builder.build());
    }

    /// Close the finished delegate and report its result. Safe to call
    /// twice: the second call finds no delegate.
    pub async fn end_delegate(&self) {
        let mut m = self.inner.mutable.lock().await;
        let Some(delegate) = m.delegate.take() else {
            return;
        };

        let delegate_state = delegate.get_agent_state().await;
        delegate.close().await;
        let child_state = delegate.get_state().await;

        // The global step counter kept ticking inside the delegate.
        m.state.iteration = child_state.iteration;

        let observation = if matches!(delegate_state, AgentState::Finished | AgentState::Rejected)
        {
            let content = format!(
                "{} finishes task with {}",
                delegate.inner.agent_name,
                format_outputs(&child_state.outputs)
            );
            Observation::new(
                ObservationKind::DelegateDone {
                    outputs: child_state.outputs,
                },
                content,
            )
        } else {
            Observation::new(
                ObservationKind::DelegateDone {
                    outputs: child_state.outputs,
                },
                format!(
                    "{} encountered an error during execution.",
                    delegate.inner.agent_name
                ),
            )
        };
        self.inner.stream.add_event(observation, EventSource::Agent);
    }

    /// Halve history and publish the condensation marker. Errors when
    /// nothing can be dropped.
    fn handle_long_context(&self, m: &mut Mutable) -> Result<(), ControllerError> {
        let window = apply_conversation_window(&m.state.history);
        let kept_ids: HashSet<u64> = window.kept.iter().map(|event| event.id).collect();
        let forgotten: Vec<u64> = m
            .state
            .history
            .iter()
            .map(|event| event.id)
            .filter(|id| !kept_ids.contains(id))
            .collect();

        let (Some(&first_forgotten), Some(&last_forgotten)) =
            (forgotten.iter().min(), forgotten.iter().max())
        else {
            // Nothing left to drop; the window genuinely does not fit.
            return Err(ControllerError::ContextWindowExceeded);
        };

        m.state.history = window.kept;
        if let Some(start_id) = window.new_start_id {
            m.state.start_id = start_id;
        }
        log::info!(
            "[controller {}] context window exceeded, dropped events {first_forgotten}..={last_forgotten}",
            self.inner.id
        );

        // Re-steps the agent against the pruned history.
        self.inner.stream.add_event(
            ActionKind::Condensation {
                forgotten_events_start_id: first_forgotten,
                forgotten_events_end_id: last_forgotten,
            },
            EventSource::Agent,
        );
        Ok(())
    }

    fn first_user_message(&self, m: &mut Mutable) -> Option<Event> {
        if m.state.cached_first_user_message.is_none() {
            m.state.cached_first_user_message = self
                .inner
                .stream
                .get_events(m.state.start_id, None, false, EventFilter::default())
                .into_iter()
                .find(Event::is_user_message);
        }
        m.state.cached_first_user_message.clone()
    }

    /// Stop the controller and freeze its history with one final range
    /// query. Idempotent.
    pub async fn close(&self) {
        self.close_with(true).await;
    }

    pub async fn close_with(&self, set_stopped: bool) {
        {
            let mut m = self.inner.mutable.lock().await;
            if m.closed {
                return;
            }
            if set_stopped {
                self.transition(&mut m, AgentState::Stopped);
            }

            // The final history is complete, delegate events included; it
            // still excludes hidden and backend events.
            let start_id = m.state.start_id;
            let end_id = m.state.end_id.or_else(|| self.inner.stream.latest_event_id());
            m.state.history = match end_id {
                Some(end_id) if start_id <= end_id => self.inner.stream.get_events(
                    start_id,
                    Some(end_id),
                    false,
                    EventFilter::history(),
                ),
                _ => Vec::new(),
            };
            m.closed = true;
        }

        if !self.inner.is_delegate {
            self.inner
                .stream
                .unsubscribe(EventSubscriber::AgentController, &self.inner.id);
        }
    }

    /// The final history as serialized events. Only available after
    /// [`close`](Self::close).
    pub async fn get_trajectory(&self) -> Result<Vec<serde_json::Value>, ControllerError> {
        let m = self.inner.mutable.lock().await;
        if !m.closed {
            return Err(ControllerError::NotClosed);
        }
        m.state
            .history
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|error| ControllerError::Internal(error.to_string()))
    }
}

impl std::fmt::Debug for AgentController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentController")
            .field("id", &self.inner.id)
            .field("agent", &self.inner.agent_name)
            .field("is_delegate", &self.inner.is_delegate)
            .finish()
    }
}

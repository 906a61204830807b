//! Replay of prerecorded agent actions.
//!
//! While the queue is non-empty the controller takes its next action from
//! here instead of calling the agent, but publishes through the normal
//! path, so replayed runs produce the same event shapes as live ones.

use std::collections::VecDeque;
use stride::events::{Action, ActionKind, Event, EventKind, EventSource};

#[derive(Debug, Default)]
pub struct ReplayManager {
    actions: VecDeque<Action>,
}

impl ReplayManager {
    /// Build from a recorded trajectory. Only agent-authored actions are
    /// replayable; state plumbing and null actions are skipped.
    pub fn new(replay_events: Option<Vec<Event>>) -> Self {
        let actions = replay_events
            .unwrap_or_default()
            .into_iter()
            .filter(|event| event.source == EventSource::Agent)
            .filter_map(|event| match event.kind {
                EventKind::Action(action) => Some(action),
                EventKind::Observation(_) => None,
            })
            .filter(|action| {
                !matches!(
                    action.kind,
                    ActionKind::Null | ActionKind::ChangeAgentState { .. }
                )
            })
            .collect();
        Self { actions }
    }

    pub fn should_replay(&self) -> bool {
        !self.actions.is_empty()
    }

    /// Pop the next prerecorded action.
    pub fn next_action(&mut self) -> Option<Action> {
        self.actions.pop_front()
    }

    pub fn remaining(&self) -> usize {
        self.actions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent_action(kind: ActionKind, id: u64) -> Event {
        Event {
            id,
            timestamp: 0,
            source: EventSource::Agent,
            hidden: false,
            cause: None,
            kind: EventKind::Action(Action::new(kind)),
        }
    }

    #[test]
    fn keeps_only_replayable_agent_actions() {
        let events = vec![
            agent_action(
                ActionKind::Message {
                    content: "thinking".into(),
                    wait_for_response: false,
                },
                0,
            ),
            agent_action(ActionKind::Null, 1),
            agent_action(
                ActionKind::ChangeAgentState {
                    agent_state: stride::events::AgentState::Running,
                },
                2,
            ),
            Event {
                id: 3,
                timestamp: 0,
                source: EventSource::User,
                hidden: false,
                cause: None,
                kind: EventKind::Action(Action::new(ActionKind::Message {
                    content: "user".into(),
                    wait_for_response: false,
                })),
            },
            agent_action(
                ActionKind::CmdRun {
                    command: "ls".into(),
                },
                4,
            ),
        ];

        let mut replay = ReplayManager::new(Some(events));
        assert_eq!(replay.remaining(), 2);
        assert!(replay.should_replay());

        assert!(matches!(
            replay.next_action().unwrap().kind,
            ActionKind::Message { .. }
        ));
        assert!(matches!(
            replay.next_action().unwrap().kind,
            ActionKind::CmdRun { .. }
        ));
        assert!(!replay.should_replay());
        assert!(replay.next_action().is_none());
    }

    #[test]
    fn empty_input_never_replays() {
        assert!(!ReplayManager::new(None).should_replay());
        assert!(!ReplayManager::new(Some(Vec::new())).should_replay());
    }
}

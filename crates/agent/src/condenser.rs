//! History trimming for context-window recovery.
//!
//! When the model reports its context window exceeded, the controller keeps
//! roughly the newest half of its history. Two rules keep the remainder
//! coherent: a slice never starts with an orphan observation, and the first
//! user message (the task statement) is never evicted.

use stride::events::{Event, EventKind};

/// The result of halving a history slice.
pub(crate) struct ConversationWindow {
    pub kept: Vec<Event>,
    /// The id history should be considered to start from: the first user
    /// message when one exists, otherwise the first kept event.
    pub new_start_id: Option<u64>,
}

pub(crate) fn apply_conversation_window(events: &[Event]) -> ConversationWindow {
    if events.is_empty() {
        return ConversationWindow {
            kept: Vec::new(),
            new_start_id: None,
        };
    }

    let first_user_message = events.iter().find(|event| event.is_user_message()).cloned();

    let mid_point = std::cmp::max(1, events.len() / 2);
    let mut kept: Vec<Event> = events[mid_point..].to_vec();

    // Never start a slice with an observation whose action was dropped.
    if kept
        .first()
        .is_some_and(|event| matches!(event.kind, EventKind::Observation(_)))
    {
        kept.remove(0);
    }

    let mut new_start_id = kept.first().map(|event| event.id);
    if let Some(first_user_message) = first_user_message {
        if !kept.iter().any(|event| event.id == first_user_message.id) {
            kept.insert(0, first_user_message.clone());
        }
        new_start_id = Some(first_user_message.id);
    }

    ConversationWindow { kept, new_start_id }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stride::events::{Action, ActionKind, EventSource, Observation, ObservationKind};

    fn user_message(id: u64) -> Event {
        Event {
            id,
            timestamp: 0,
            source: EventSource::User,
            hidden: false,
            cause: None,
            kind: EventKind::Action(Action::new(ActionKind::Message {
                content: "do the task".into(),
                wait_for_response: false,
            })),
        }
    }

    fn action(id: u64) -> Event {
        Event {
            id,
            timestamp: 0,
            source: EventSource::Agent,
            hidden: false,
            cause: None,
            kind: EventKind::Action(Action::new(ActionKind::CmdRun {
                command: format!("cmd {id}"),
            })),
        }
    }

    fn observation(id: u64) -> Event {
        Event {
            id,
            timestamp: 0,
            source: EventSource::Environment,
            hidden: false,
            cause: Some(id - 1),
            kind: EventKind::Observation(Observation::new(
                ObservationKind::CmdOutput { exit_code: 0 },
                format!("output {id}"),
            )),
        }
    }

    /// user message followed by n (action, observation) pairs
    fn conversation(pairs: u64) -> Vec<Event> {
        let mut events = vec![user_message(0)];
        for i in 0..pairs {
            events.push(action(1 + i * 2));
            events.push(observation(2 + i * 2));
        }
        events
    }

    // ── Halving ────────────────────────────────────────────────────────────

    #[test]
    fn keeps_roughly_the_newest_half() {
        let events = conversation(10); // 21 events
        let window = apply_conversation_window(&events);
        assert!(window.kept.len() <= events.len() / 2 + 2);
        assert!(window.kept.len() >= events.len() / 4);
        // newest event always survives
        assert_eq!(
            window.kept.last().unwrap().id,
            events.last().unwrap().id
        );
    }

    #[test]
    fn never_starts_with_an_observation() {
        let events = conversation(10);
        let window = apply_conversation_window(&events);
        let first_non_user = window
            .kept
            .iter()
            .find(|event| !event.is_user_message())
            .unwrap();
        assert!(first_non_user.is_action());
    }

    // ── First user message ─────────────────────────────────────────────────

    #[test]
    fn first_user_message_is_preserved() {
        let events = conversation(10);
        let window = apply_conversation_window(&events);
        assert!(window.kept.iter().any(|event| event.id == 0));
        assert_eq!(window.new_start_id, Some(0));
    }

    #[test]
    fn first_user_message_is_not_duplicated_when_already_kept() {
        let events = vec![action(1), user_message(2), action(3)];
        let window = apply_conversation_window(&events);
        let user_count = window
            .kept
            .iter()
            .filter(|event| event.is_user_message())
            .count();
        assert_eq!(user_count, 1);
        assert_eq!(window.new_start_id, Some(2));
    }

    #[test]
    fn without_user_message_start_is_first_kept_event() {
        let events: Vec<Event> = vec![action(1), observation(2), action(3), observation(4)];
        let window = apply_conversation_window(&events);
        assert_eq!(window.new_start_id, Some(window.kept[0].id));
        assert!(window.kept[0].is_action());
    }

    #[test]
    fn empty_history_stays_empty() {
        let window = apply_conversation_window(&[]);
        assert!(window.kept.is_empty());
        assert_eq!(window.new_start_id, None);
    }
}

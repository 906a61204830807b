//! Rebuilding controller history from the event stream.
//!
//! On (re)start a controller does not trust any in-memory history: it
//! range-queries the stream over `[start_id, end_id]` with the backend and
//! hidden filters applied, then collapses delegate sub-ranges so the parent
//! sees each delegation as a single action/observation bracket.

use crate::event_stream::{EventFilter, EventStream};
use crate::state::State;
use stride::events::{ActionKind, Event, EventKind, ObservationKind};

/// Initialize `state.history` from the stream and pin `state.start_id`.
pub(crate) fn init_history(stream: &EventStream, state: &mut State) {
    let start_id = state.start_id;
    let end_id = state.end_id.or_else(|| stream.latest_event_id());

    let Some(end_id) = end_id else {
        // Empty stream: normal for a fresh root or a delegate starting at
        // the top of the stream.
        state.history = Vec::new();
        return;
    };

    if start_id > end_id + 1 {
        log::warn!(
            "[controller {}] start_id {} is greater than end_id + 1 ({}); history will be empty",
            state.session_id,
            start_id,
            end_id + 1
        );
        state.history = Vec::new();
        return;
    }

    let events = stream.get_events(start_id, Some(end_id), false, EventFilter::history());
    state.history = collapse_delegate_ranges(events, &state.session_id);
    state.start_id = start_id;
}

/// Drop every event strictly inside a `(Delegate, DelegateDone)` bracket.
///
/// Brackets are matched like parentheses: a done-observation pairs with the
/// most recent unmatched delegate action. Anything inside an outer bracket
/// (including nested brackets, which belong to descendants) is omitted; the
/// bracketing events themselves are kept.
pub(crate) fn collapse_delegate_ranges(events: Vec<Event>, session_id: &str) -> Vec<Event> {
    let mut unmatched: Vec<u64> = Vec::new();
    let mut ranges: Vec<(u64, u64)> = Vec::new();

    for event in &events {
        match &event.kind {
            EventKind::Action(action) if matches!(action.kind, ActionKind::Delegate { .. }) => {
                unmatched.push(event.id);
            }
            EventKind::Observation(observation)
                if matches!(observation.kind, ObservationKind::DelegateDone { .. }) =>
            {
                match unmatched.pop() {
                    Some(action_id) => ranges.push((action_id, event.id)),
                    None => log::warn!(
                        "[controller {}] delegate-done observation without matching action at id={}",
                        session_id,
                        event.id
                    ),
                }
            }
            _ => {}
        }
    }

    if ranges.is_empty() {
        return events;
    }

    events
        .into_iter()
        .filter(|event| {
            !ranges
                .iter()
                .any(|&(start, end)| event.id > start && event.id < end)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_stream::EventStream;
    use stride::events::{EventSource, Observation};

    fn message(content: &str) -> ActionKind {
        ActionKind::Message {
            content: content.into(),
            wait_for_response: false,
        }
    }

    fn delegate(agent: &str) -> ActionKind {
        ActionKind::Delegate {
            agent: agent.into(),
            inputs: serde_json::Map::new(),
        }
    }

    fn delegate_done() -> Observation {
        Observation::new(
            ObservationKind::DelegateDone {
                outputs: serde_json::Map::new(),
            },
            "done",
        )
    }

    // ── Range setup ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn fresh_root_loads_full_stream() {
        let stream = EventStream::new("sess");
        stream.add_event(message("a"), EventSource::User);
        stream.add_event(message("b"), EventSource::Agent);

        let mut state = State::new("sess", 10);
        init_history(&stream, &mut state);
        assert_eq!(state.history.len(), 2);
        assert_eq!(state.start_id, 0);
    }

    #[tokio::test]
    async fn delegate_window_starts_empty() {
        let stream = EventStream::new("sess");
        stream.add_event(message("before"), EventSource::User);

        let mut state = State::new("sess", 10);
        state.start_id = stream.latest_event_id().unwrap() + 1;
        init_history(&stream, &mut state);
        assert!(state.history.is_empty());
    }

    #[tokio::test]
    async fn degenerate_range_is_empty() {
        let stream = EventStream::new("sess");
        stream.add_event(message("a"), EventSource::User);

        let mut state = State::new("sess", 10);
        state.start_id = 5;
        init_history(&stream, &mut state);
        assert!(state.history.is_empty());
    }

    #[tokio::test]
    async fn explicit_end_id_bounds_the_slice() {
        let stream = EventStream::new("sess");
        for i in 0..4 {
            stream.add_event(message(&format!("m{i}")), EventSource::User);
        }
        let mut state = State::new("sess", 10);
        state.end_id = Some(1);
        init_history(&stream, &mut state);
        assert_eq!(state.history.len(), 2);
    }

    // ── Delegate collapse ──────────────────────────────────────────────────

    #[tokio::test]
    async fn delegate_interior_is_collapsed() {
        let stream = EventStream::new("sess");
        stream.add_event(message("task"), EventSource::User); // 0
        stream.add_event(delegate("Sub"), EventSource::Agent); // 1
        stream.add_event(message("TASK: inner"), EventSource::User); // 2
        stream.add_event(message("working"), EventSource::Agent); // 3
        stream.add_event(delegate_done(), EventSource::Agent); // 4
        stream.add_event(message("after"), EventSource::Agent); // 5

        let mut state = State::new("sess", 10);
        init_history(&stream, &mut state);
        let ids: Vec<u64> = state.history.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![0, 1, 4, 5]);
    }

    #[tokio::test]
    async fn nested_delegates_collapse_to_outer_bracket() {
        let stream = EventStream::new("sess");
        stream.add_event(delegate("Outer"), EventSource::Agent); // 0
        stream.add_event(delegate("Inner"), EventSource::Agent); // 1
        stream.add_event(message("deep"), EventSource::Agent); // 2
        stream.add_event(delegate_done(), EventSource::Agent); // 3, ends Inner
        stream.add_event(delegate_done(), EventSource::Agent); // 4, ends Outer
        stream.add_event(message("after"), EventSource::Agent); // 5

        let mut state = State::new("sess", 10);
        init_history(&stream, &mut state);
        let ids: Vec<u64> = state.history.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![0, 4, 5]);
    }

    #[tokio::test]
    async fn unmatched_delegate_done_is_skipped_but_kept() {
        let stream = EventStream::new("sess");
        stream.add_event(delegate_done(), EventSource::Agent); // 0, no opener
        stream.add_event(message("after"), EventSource::Agent); // 1

        let mut state = State::new("sess", 10);
        init_history(&stream, &mut state);
        let ids: Vec<u64> = state.history.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![0, 1]);
    }

    #[tokio::test]
    async fn open_delegate_without_done_keeps_interior() {
        let stream = EventStream::new("sess");
        stream.add_event(delegate("Sub"), EventSource::Agent); // 0
        stream.add_event(message("inner"), EventSource::Agent); // 1

        let mut state = State::new("sess", 10);
        init_history(&stream, &mut state);
        assert_eq!(state.history.len(), 2);
    }
}

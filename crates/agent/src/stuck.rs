//! Loop-stuck detection over recent controller history.
//!
//! Read-only analysis: the detector never mutates history. Two patterns
//! count as stuck, both scoped to events after the most recent user message
//! (a user message is a chance to make progress):
//!
//! 1. The last N (action, observation) pairs are identical.
//! 2. The last N error observations are identical.
//!
//! N is stricter in headless mode, where nobody can intervene. Once stuck,
//! the verdict latches until [`StuckDetector::reset`].

use stride::events::{Action, Event, EventKind, Observation, ObservationKind};

const HEADLESS_REPEAT_THRESHOLD: usize = 3;
const INTERACTIVE_REPEAT_THRESHOLD: usize = 4;

#[derive(Debug, Default)]
pub struct StuckDetector {
    latched: bool,
}

impl StuckDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_stuck(&mut self, history: &[Event], headless: bool) -> bool {
        if self.latched {
            return true;
        }
        let threshold = if headless {
            HEADLESS_REPEAT_THRESHOLD
        } else {
            INTERACTIVE_REPEAT_THRESHOLD
        };

        let last_user_message = history.iter().rposition(|event| event.is_user_message());
        let tail = match last_user_message {
            Some(index) => &history[index + 1..],
            None => history,
        };

        if repeating_action_observation_cycle(tail, threshold) || repeating_error(tail, threshold) {
            self.latched = true;
        }
        self.latched
    }

    /// Clear the latch; called when the controller resets.
    pub fn reset(&mut self) {
        self.latched = false;
    }
}

/// True when the tail ends in `threshold` identical (action, observation)
/// pairs in strict alternation. Any differing event in between counts as
/// progress.
fn repeating_action_observation_cycle(tail: &[Event], threshold: usize) -> bool {
    let needed = threshold * 2;
    if tail.len() < needed {
        return false;
    }
    let window = &tail[tail.len() - needed..];

    let mut first_action: Option<&Action> = None;
    let mut first_observation: Option<&Observation> = None;
    for (index, event) in window.iter().enumerate() {
        match (&event.kind, index % 2) {
            (EventKind::Action(action), 0) => match first_action {
                None => first_action = Some(action),
                Some(reference) if reference.kind == action.kind => {}
                Some(_) => return false,
            },
            (EventKind::Observation(observation), 1) => match first_observation {
                None => first_observation = Some(observation),
                Some(reference)
                    if reference.kind == observation.kind
                        && reference.content == observation.content => {}
                Some(_) => return false,
            },
            _ => return false,
        }
    }
    true
}

/// True when the last `threshold` observations in the tail are identical
/// errors.
fn repeating_error(tail: &[Event], threshold: usize) -> bool {
    let mut errors = tail
        .iter()
        .rev()
        .filter_map(|event| event.as_observation());
    let Some(reference) = errors.next() else {
        return false;
    };
    if !matches!(reference.kind, ObservationKind::Error) {
        return false;
    }
    let mut seen = 1;
    for observation in errors {
        if !matches!(observation.kind, ObservationKind::Error)
            || observation.content != reference.content
        {
            break;
        }
        seen += 1;
        if seen >= threshold {
            return true;
        }
    }
    seen >= threshold
}

#[cfg(test)]
mod tests {
    use super::*;
    use stride::events::{ActionKind, EventSource};

    fn action(command: &str, id: u64) -> Event {
        Event {
            id,
            timestamp: 0,
            source: EventSource::Agent,
            hidden: false,
            cause: None,
            kind: EventKind::Action(Action::new(ActionKind::CmdRun {
                command: command.into(),
            })),
        }
    }

    fn observation(content: &str, id: u64) -> Event {
        Event {
            id,
            timestamp: 0,
            source: EventSource::Environment,
            hidden: false,
            cause: Some(id.saturating_sub(1)),
            kind: EventKind::Observation(Observation::new(
                ObservationKind::CmdOutput { exit_code: 1 },
                content,
            )),
        }
    }

    fn error(content: &str, id: u64) -> Event {
        Event {
            id,
            timestamp: 0,
            source: EventSource::Agent,
            hidden: false,
            cause: None,
            kind: EventKind::Observation(Observation::error(content)),
        }
    }

    fn user_message(id: u64) -> Event {
        Event {
            id,
            timestamp: 0,
            source: EventSource::User,
            hidden: false,
            cause: None,
            kind: EventKind::Action(Action::new(ActionKind::Message {
                content: "try again".into(),
                wait_for_response: false,
            })),
        }
    }

    fn repeated_pair(n: usize) -> Vec<Event> {
        let mut events = Vec::new();
        for i in 0..n {
            events.push(action("make test", (i * 2) as u64));
            events.push(observation("error: nope", (i * 2 + 1) as u64));
        }
        events
    }

    // ── Repeating pairs ────────────────────────────────────────────────────

    #[test]
    fn identical_pairs_trip_headless_threshold() {
        let mut detector = StuckDetector::new();
        assert!(detector.is_stuck(&repeated_pair(3), true));
    }

    #[test]
    fn headless_threshold_is_stricter() {
        let history = repeated_pair(3);
        assert!(!StuckDetector::new().is_stuck(&history, false));
        assert!(StuckDetector::new().is_stuck(&history, true));
        assert!(StuckDetector::new().is_stuck(&repeated_pair(4), false));
    }

    #[test]
    fn progressing_commands_are_not_stuck() {
        let mut events = Vec::new();
        for i in 0..6 {
            events.push(action(&format!("step {i}"), (i * 2) as u64));
            events.push(observation(&format!("output {i}"), (i * 2 + 1) as u64));
        }
        assert!(!StuckDetector::new().is_stuck(&events, true));
    }

    #[test]
    fn user_message_resets_the_window() {
        let mut events = repeated_pair(3);
        events.push(user_message(100));
        assert!(!StuckDetector::new().is_stuck(&events, true));
    }

    // ── Repeating errors ───────────────────────────────────────────────────

    #[test]
    fn identical_errors_trip_threshold() {
        let events: Vec<Event> = (0..3).map(|i| error("timeout talking to llm", i)).collect();
        assert!(StuckDetector::new().is_stuck(&events, true));
    }

    #[test]
    fn differing_errors_are_not_stuck() {
        let events = vec![error("a", 0), error("b", 1), error("c", 2)];
        assert!(!StuckDetector::new().is_stuck(&events, true));
    }

    // ── Latching ───────────────────────────────────────────────────────────

    #[test]
    fn verdict_latches_until_reset() {
        let mut detector = StuckDetector::new();
        assert!(detector.is_stuck(&repeated_pair(3), true));
        // Even an empty history keeps the verdict until reset.
        assert!(detector.is_stuck(&[], true));
        detector.reset();
        assert!(!detector.is_stuck(&[], true));
    }

    #[test]
    fn short_history_is_never_stuck() {
        assert!(!StuckDetector::new().is_stuck(&repeated_pair(1), true));
        assert!(!StuckDetector::new().is_stuck(&[], true));
    }
}

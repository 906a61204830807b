//! In-memory ordered event stream.
//!
//! The stream is the only shared mutable collaborator between controllers:
//! it assigns dense monotonic ids at publication, stores every event, and
//! fans events out to subscribers. Each subscriber drains its own queue on a
//! dedicated task, so a subscriber always observes events in id order and
//! never handles two events concurrently.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use stride::events::{Event, EventKind, EventSource};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Well-known subscriber topics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventSubscriber {
    AgentController,
    Server,
    Runtime,
    Main,
}

/// A callback attached to the stream. Invoked once per event, in order.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle_event(&self, event: Event);
}

/// Server-side filters for range queries.
#[derive(Debug, Clone, Copy, Default)]
pub struct EventFilter {
    /// Drop backend bookkeeping events (null actions/observations, agent
    /// state plumbing).
    pub exclude_backend: bool,
    /// Drop events published with `hidden = true`.
    pub exclude_hidden: bool,
}

impl EventFilter {
    /// The filter controllers use for their history.
    pub fn history() -> Self {
        Self {
            exclude_backend: true,
            exclude_hidden: true,
        }
    }
}

struct Subscription {
    sender: mpsc::UnboundedSender<Event>,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct StreamStore {
    events: Vec<Event>,
    subscriptions: HashMap<(EventSubscriber, String), Subscription>,
}

/// The ordered event log plus its fan-out machinery.
pub struct EventStream {
    sid: String,
    store: Mutex<StreamStore>,
}

impl EventStream {
    pub fn new(sid: impl Into<String>) -> Self {
        Self {
            sid: sid.into(),
            store: Mutex::new(StreamStore::default()),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.sid
    }

    /// Publish an event. Assigns the id and timestamp, appends to the log,
    /// and enqueues the event for every subscriber. Returns the stored
    /// event.
    pub fn add_event(&self, kind: impl Into<EventKind>, source: EventSource) -> Event {
        self.add_event_full(kind, source, None, false)
    }

    /// Publish with an explicit cause and hidden flag.
    pub fn add_event_full(
        &self,
        kind: impl Into<EventKind>,
        source: EventSource,
        cause: Option<u64>,
        hidden: bool,
    ) -> Event {
        let mut store = self.store.lock();
        let event = Event {
            id: store.events.len() as u64,
            timestamp: time::OffsetDateTime::now_utc().unix_timestamp(),
            source,
            hidden,
            cause,
            kind: kind.into(),
        };
        store.events.push(event.clone());
        // Enqueue while holding the lock so queue order matches id order.
        store
            .subscriptions
            .retain(|_, subscription| subscription.sender.send(event.clone()).is_ok());
        event
    }

    /// Attach a handler under `(subscriber, callback_id)`. A dedicated task
    /// drains the handler's queue sequentially. Re-subscribing under the
    /// same key replaces the previous handler.
    pub fn subscribe(
        &self,
        subscriber: EventSubscriber,
        callback_id: impl Into<String>,
        handler: Arc<dyn EventHandler>,
    ) {
        let callback_id = callback_id.into();
        let (sender, mut receiver) = mpsc::unbounded_channel::<Event>();
        let task = tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                handler.handle_event(event).await;
            }
        });

        let mut store = self.store.lock();
        let key = (subscriber, callback_id);
        if let Some(previous) = store
            .subscriptions
            .insert(key.clone(), Subscription { sender, task })
        {
            log::warn!(
                "EventStream {}: replacing subscriber {:?}/{}",
                self.sid,
                key.0,
                key.1
            );
            previous.task.abort();
        }
    }

    /// Detach a handler. Events already queued are still delivered.
    pub fn unsubscribe(&self, subscriber: EventSubscriber, callback_id: &str) {
        let removed = self
            .store
            .lock()
            .subscriptions
            .remove(&(subscriber, callback_id.to_string()));
        if removed.is_none() {
            log::warn!(
                "EventStream {}: unsubscribe for unknown {:?}/{}",
                self.sid,
                subscriber,
                callback_id
            );
        }
    }

    /// Inclusive range query over the log, filters applied before returning.
    pub fn get_events(
        &self,
        start_id: u64,
        end_id: Option<u64>,
        reverse: bool,
        filter: EventFilter,
    ) -> Vec<Event> {
        let store = self.store.lock();
        let len = store.events.len() as u64;
        if len == 0 || start_id >= len {
            return Vec::new();
        }
        let end = end_id.map_or(len - 1, |id| id.min(len - 1));
        if start_id > end {
            return Vec::new();
        }

        let mut events: Vec<Event> = store.events[start_id as usize..=end as usize]
            .iter()
            .filter(|event| !(filter.exclude_hidden && event.hidden))
            .filter(|event| !(filter.exclude_backend && event.filtered_out()))
            .cloned()
            .collect();
        if reverse {
            events.reverse();
        }
        events
    }

    /// Look up a single event by id.
    pub fn get_event(&self, id: u64) -> Option<Event> {
        self.store.lock().events.get(id as usize).cloned()
    }

    /// Id of the most recently published event, if any.
    pub fn latest_event_id(&self) -> Option<u64> {
        let store = self.store.lock();
        (store.events.len() as u64).checked_sub(1)
    }
}

impl Default for EventStream {
    /// A stream with a random session id.
    fn default() -> Self {
        Self::new(uuid::Uuid::new_v4().to_string())
    }
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let store = self.store.lock();
        f.debug_struct("EventStream")
            .field("sid", &self.sid)
            .field("events", &store.events.len())
            .field("subscriptions", &store.subscriptions.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stride::events::{ActionKind, Observation, ObservationKind};
    use tokio::sync::Mutex as TokioMutex;

    struct RecordingHandler {
        received: Arc<TokioMutex<Vec<Event>>>,
    }

    impl RecordingHandler {
        fn new() -> (Arc<Self>, Arc<TokioMutex<Vec<Event>>>) {
            let received = Arc::new(TokioMutex::new(Vec::new()));
            (
                Arc::new(Self {
                    received: received.clone(),
                }),
                received,
            )
        }
    }

    #[async_trait]
    impl EventHandler for RecordingHandler {
        async fn handle_event(&self, event: Event) {
            self.received.lock().await.push(event);
        }
    }

    fn message(content: &str) -> ActionKind {
        ActionKind::Message {
            content: content.into(),
            wait_for_response: false,
        }
    }

    // ── Publication ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn ids_are_dense_and_monotonic() {
        let stream = EventStream::new("sess");
        let first = stream.add_event(message("a"), EventSource::User);
        let second = stream.add_event(message("b"), EventSource::Agent);
        assert_eq!(first.id, 0);
        assert_eq!(second.id, 1);
        assert_eq!(stream.latest_event_id(), Some(1));
    }

    #[tokio::test]
    async fn empty_stream_has_no_latest_id() {
        assert_eq!(EventStream::new("sess").latest_event_id(), None);
    }

    // ── Subscription ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn subscriber_receives_events_in_order() {
        let stream = EventStream::new("sess");
        let (handler, received) = RecordingHandler::new();
        stream.subscribe(EventSubscriber::AgentController, "cb", handler);

        for i in 0..5 {
            stream.add_event(message(&format!("m{i}")), EventSource::User);
        }
        tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;

        let events = received.lock().await;
        let ids: Vec<u64> = events.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let stream = EventStream::new("sess");
        let (handler, received) = RecordingHandler::new();
        stream.subscribe(EventSubscriber::AgentController, "cb", handler);

        stream.add_event(message("before"), EventSource::User);
        tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
        stream.unsubscribe(EventSubscriber::AgentController, "cb");
        stream.add_event(message("after"), EventSource::User);
        tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;

        assert_eq!(received.lock().await.len(), 1);
    }

    // ── Range queries ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn range_query_is_inclusive() {
        let stream = EventStream::new("sess");
        for i in 0..4 {
            stream.add_event(message(&format!("m{i}")), EventSource::User);
        }
        let events = stream.get_events(1, Some(2), false, EventFilter::default());
        let ids: Vec<u64> = events.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[tokio::test]
    async fn open_ended_range_runs_to_latest() {
        let stream = EventStream::new("sess");
        for i in 0..3 {
            stream.add_event(message(&format!("m{i}")), EventSource::User);
        }
        let events = stream.get_events(1, None, false, EventFilter::default());
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn reverse_returns_newest_first() {
        let stream = EventStream::new("sess");
        for i in 0..3 {
            stream.add_event(message(&format!("m{i}")), EventSource::User);
        }
        let events = stream.get_events(0, None, true, EventFilter::default());
        let ids: Vec<u64> = events.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![2, 1, 0]);
    }

    #[tokio::test]
    async fn history_filter_drops_backend_and_hidden_events() {
        let stream = EventStream::new("sess");
        stream.add_event(message("keep"), EventSource::User);
        stream.add_event(ActionKind::Null, EventSource::Agent);
        stream.add_event(
            Observation::new(ObservationKind::Null, ""),
            EventSource::Environment,
        );
        stream.add_event_full(message("secret"), EventSource::User, None, true);
        stream.add_event(message("keep too"), EventSource::User);

        let events = stream.get_events(0, None, false, EventFilter::history());
        let ids: Vec<u64> = events.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![0, 4]);
    }

    #[tokio::test]
    async fn out_of_range_query_is_empty() {
        let stream = EventStream::new("sess");
        stream.add_event(message("only"), EventSource::User);
        assert!(
            stream
                .get_events(5, None, false, EventFilter::default())
                .is_empty()
        );
    }

    #[tokio::test]
    async fn cause_and_hidden_are_preserved() {
        let stream = EventStream::new("sess");
        stream.add_event(message("m"), EventSource::User);
        let observation = stream.add_event_full(
            Observation::new(ObservationKind::CmdOutput { exit_code: 0 }, "ok"),
            EventSource::Environment,
            Some(0),
            false,
        );
        assert_eq!(observation.cause, Some(0));
        assert_eq!(stream.get_event(observation.id).unwrap().cause, Some(0));
    }
}

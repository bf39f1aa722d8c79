//! Observability events
//!
//! The pool and the transport publish what they do on a broadcast channel.
//! Publishing never blocks and never fails: with no subscribers the event is
//! simply dropped. Connections never see this channel.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::lb::{ResurrectStrategy, SniffReason};
use crate::pool::ConnectionSnapshot;

const EVENT_CAPACITY: usize = 256;

/// Outcome of one resurrection attempt
#[derive(Debug, Clone, Serialize)]
pub struct ResurrectEvent {
    pub strategy: ResurrectStrategy,
    pub name: String,
    pub request_id: Option<u32>,
    pub is_alive: bool,
    pub connection: ConnectionSnapshot,
}

/// One topology discovery round
#[derive(Debug, Clone, Serialize)]
pub struct SniffEvent {
    pub name: String,
    pub request_id: Option<u32>,
    pub reason: SniffReason,
    /// Node urls the pool was reconciled against (empty on failure)
    pub hosts: Vec<String>,
    pub error: Option<String>,
}

/// A request about to be sent, or its outcome
#[derive(Debug, Clone, Serialize)]
pub struct RequestEvent {
    pub name: String,
    pub request_id: u32,
    pub method: String,
    pub path: String,
    pub connection_id: Option<String>,
    pub attempts: u32,
    pub status_code: Option<u16>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    Request(RequestEvent),
    Response(RequestEvent),
    Sniff(SniffEvent),
    Resurrect(ResurrectEvent),
}

/// Cloneable publishing side of the event channel
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }

    pub fn emit(&self, event: Event) {
        // Err only means nobody is listening
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_without_subscribers() {
        let bus = EventBus::new();
        bus.emit(Event::Sniff(SniffEvent {
            name: "test".into(),
            request_id: None,
            reason: SniffReason::Default,
            hosts: vec![],
            error: None,
        }));
    }

    #[tokio::test]
    async fn test_subscriber_receives_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.emit(Event::Sniff(SniffEvent {
            name: "test".into(),
            request_id: Some(7),
            reason: SniffReason::SniffInterval,
            hosts: vec!["http://127.0.0.1:9200/".into()],
            error: None,
        }));

        match rx.recv().await.unwrap() {
            Event::Sniff(event) => {
                assert_eq!(event.request_id, Some(7));
                assert_eq!(event.reason, SniffReason::SniffInterval);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}

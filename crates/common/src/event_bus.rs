use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt::Debug;
use tokio::sync::broadcast;
use tracing::trace;

/// A published payload together with the moment it was published.
#[derive(Debug, Clone, Serialize)]
pub struct EventEnvelope<T: Clone + Send + Sync + Debug + 'static> {
    pub payload: T,
    pub timestamp: DateTime<Utc>,
}

/// Typed broadcast channel for component notifications.
///
/// Cloning the bus yields another handle onto the same channel. Publishing
/// never blocks and never fails: with no subscribers the event is dropped,
/// and subscribers that fall more than `capacity` events behind observe a
/// `RecvError::Lagged` on their next receive.
#[derive(Clone)]
pub struct EventBus<T: Clone + Send + Sync + Debug + 'static> {
    sender: broadcast::Sender<EventEnvelope<T>>,
    name: &'static str,
}

impl<T: Clone + Send + Sync + Debug + 'static> Debug for EventBus<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("name", &self.name)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl<T: Clone + Send + Sync + Debug + 'static> Default for EventBus<T> {
    fn default() -> Self {
        Self::new("events", 1024)
    }
}

impl<T: Clone + Send + Sync + Debug + 'static> EventBus<T> {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        let (sender, _rx) = broadcast::channel(capacity.max(1));
        Self { sender, name }
    }

    /// Publish an event to every current subscriber.
    pub fn publish(&self, payload: T) {
        let envelope = EventEnvelope {
            payload,
            timestamp: Utc::now(),
        };
        match self.sender.send(envelope) {
            Ok(receivers) => {
                trace!(target: "event_bus", bus = self.name, receivers, "published");
            }
            Err(_) => {
                trace!(target: "event_bus", bus = self.name, "no subscribers");
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope<T>> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

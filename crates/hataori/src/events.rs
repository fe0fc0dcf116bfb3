//! Synchronous event delivery to subscribers.

use hataori_core::{Event, EventFilter};
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Callback receiving events.
pub type EventHandler = Arc<dyn Fn(&Event) + Send + Sync>;

/// Handle returned by [`EventEmitter::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: SubscriptionId,
    handler: EventHandler,
    filters: Vec<EventFilter>,
}

impl Subscription {
    fn accepts(&self, event: &Event) -> bool {
        self.filters.iter().all(|filter| filter(event))
    }
}

/// Delivers events to subscribers on the emitting task.
///
/// Handlers run in subscription order, outside the subscriber lock, so a
/// handler may subscribe or unsubscribe without deadlocking. Handlers
/// should be quick: a slow handler slows the workflow down.
#[derive(Default)]
pub struct EventEmitter {
    subscriptions: RwLock<Vec<Arc<Subscription>>>,
    next_id: AtomicU64,
}

impl fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventEmitter")
            .field("subscribers", &self.subscriptions.read().len())
            .finish_non_exhaustive()
    }
}

impl EventEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes `handler` to every event.
    pub fn on_event<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.subscribe(handler, Vec::new())
    }

    /// Subscribes `handler` to events accepted by all `filters`.
    pub fn subscribe<F>(
        &self,
        handler: F,
        filters: impl IntoIterator<Item = EventFilter>,
    ) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscriptions.write().push(Arc::new(Subscription {
            id,
            handler: Arc::new(handler),
            filters: filters.into_iter().collect(),
        }));
        id
    }

    /// Removes a subscription. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscriptions = self.subscriptions.write();
        let before = subscriptions.len();
        subscriptions.retain(|subscription| subscription.id != id);
        subscriptions.len() < before
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscriptions.read().len()
    }

    /// Delivers `event` to every matching subscriber.
    pub fn emit(&self, event: &Event) {
        let subscriptions: Vec<_> = self.subscriptions.read().iter().cloned().collect();
        for subscription in subscriptions {
            if subscription.accepts(event) {
                (subscription.handler)(event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hataori_core::{filter_by_type, EventType, Value};
    use parking_lot::Mutex;

    fn event(event_type: EventType) -> Event {
        Event::new(event_type, "id", "name", Value::Null)
    }

    #[test]
    fn test_filtered_subscription() {
        let emitter = EventEmitter::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        emitter.subscribe(
            move |event: &Event| sink.lock().push(event.event_type.clone()),
            [filter_by_type([EventType::AgentError])],
        );

        emitter.emit(&event(EventType::Progress));
        emitter.emit(&event(EventType::AgentError));

        assert_eq!(*seen.lock(), vec![EventType::AgentError]);
    }

    #[test]
    fn test_unsubscribe() {
        let emitter = EventEmitter::new();
        let count = Arc::new(AtomicU64::new(0));

        let counter = count.clone();
        let id = emitter.on_event(move |_: &Event| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        emitter.emit(&event(EventType::Progress));

        assert!(emitter.unsubscribe(id));
        assert!(!emitter.unsubscribe(id));
        emitter.emit(&event(EventType::Progress));

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(emitter.subscriber_count(), 0);
    }

    #[test]
    fn test_handler_may_unsubscribe_itself() {
        let emitter = Arc::new(EventEmitter::new());
        let slot = Arc::new(Mutex::new(None));

        let inner = emitter.clone();
        let own_id = slot.clone();
        let id = emitter.on_event(move |_: &Event| {
            if let Some(id) = own_id.lock().take() {
                inner.unsubscribe(id);
            }
        });
        *slot.lock() = Some(id);

        emitter.emit(&event(EventType::Progress));
        assert_eq!(emitter.subscriber_count(), 0);
    }
}

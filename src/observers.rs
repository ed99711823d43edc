//! Publish/subscribe hub for tracker notifications.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex, MutexGuard,
};

pub type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

pub struct EventHub<T> {
    next_id: AtomicU64,
    handlers: Mutex<Vec<(SubscriptionId, Handler<T>)>>,
}

impl<T> Default for EventHub<T> {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            handlers: Mutex::new(Vec::new()),
        }
    }
}

impl<T> EventHub<T> {
    pub fn new() -> Self {
        Self::default()
    }

    fn handlers(&self) -> MutexGuard<'_, Vec<(SubscriptionId, Handler<T>)>> {
        self.handlers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers().push((id, Arc::new(handler)));
        id
    }

    /// Returns `false` if `id` was not subscribed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers();
        let before = handlers.len();
        handlers.retain(|(existing, _)| *existing != id);
        handlers.len() != before
    }

    /// Deliver `value` to every handler subscribed at the time of the call.
    /// Handlers run without the hub locked, so they may (un)subscribe.
    pub fn emit(&self, value: &T) {
        let snapshot: Vec<Handler<T>> = self
            .handlers()
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();
        for handler in snapshot {
            handler(value);
        }
    }

    pub fn len(&self) -> usize {
        self.handlers().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.handlers().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emits_to_every_subscriber_in_order() {
        let hub = EventHub::<u32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for tag in ["a", "b"] {
            let seen = Arc::clone(&seen);
            hub.subscribe(move |value| seen.lock().unwrap().push(format!("{tag}{value}")));
        }

        hub.emit(&7);
        assert_eq!(*seen.lock().unwrap(), vec!["a7".to_string(), "b7".to_string()]);
    }

    #[test]
    fn unsubscribed_handlers_stop_receiving() {
        let hub = EventHub::<()>::new();
        let hits = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&hits);
        let id = hub.subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        hub.emit(&());
        assert!(hub.unsubscribe(id));
        assert!(!hub.unsubscribe(id));
        hub.emit(&());

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(hub.is_empty());
    }

    #[test]
    fn handlers_may_unsubscribe_themselves_while_emitting() {
        let hub = Arc::new(EventHub::<()>::new());
        let slot: Arc<Mutex<Option<SubscriptionId>>> = Arc::new(Mutex::new(None));
        let (hub_ref, slot_ref) = (Arc::clone(&hub), Arc::clone(&slot));
        let id = hub.subscribe(move |_| {
            if let Some(id) = *slot_ref.lock().unwrap() {
                hub_ref.unsubscribe(id);
            }
        });
        *slot.lock().unwrap() = Some(id);

        hub.emit(&());
        assert_eq!(hub.len(), 0);
    }
}

//! Event subscriptions for a control session.
//!
//! Handlers are stored in an [`EventRegistry`] keyed by [`SubscriptionId`].
//! Each handler reports a [`Disposition`] after every delivery; the registry
//! drops the subscription itself once a handler returns [`Disposition::Done`],
//! and owners can drop one early with [`EventRegistry::unsubscribe`].

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::trace;

use crate::protocol::ControlEvent;

/// The classes of asynchronous events a handler can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventClass {
    Bootstrap,
    CircuitEstablished,
}

impl ControlEvent {
    /// The class this event is delivered under.
    pub fn class(&self) -> EventClass {
        match self {
            ControlEvent::BootstrapProgress(_) => EventClass::Bootstrap,
            ControlEvent::CircuitEstablished(_) => EventClass::CircuitEstablished,
        }
    }
}

/// What a handler wants after a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Keep receiving events.
    Keep,
    /// Terminal delivery seen; remove the subscription.
    Done,
}

/// Handle identifying one subscription in a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

type Handler = Box<dyn FnMut(&ControlEvent) -> Disposition + Send>;

struct Subscription {
    class: EventClass,
    handler: Handler,
}

/// Registry of active event subscriptions.
///
/// Handlers run on the session's reader task while the registry lock is
/// held, so they must not call back into the registry.
#[derive(Default)]
pub struct EventRegistry {
    next_id: AtomicU64,
    subscriptions: Mutex<BTreeMap<SubscriptionId, Subscription>>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A handler that panicked mid-dispatch poisons the lock; the map itself
    /// is still consistent, so keep using it.
    fn subscriptions(&self) -> MutexGuard<'_, BTreeMap<SubscriptionId, Subscription>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `handler` for every event of `class`.
    pub fn subscribe(
        &self,
        class: EventClass,
        handler: impl FnMut(&ControlEvent) -> Disposition + Send + 'static,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscriptions().insert(
            id,
            Subscription {
                class,
                handler: Box::new(handler),
            },
        );
        id
    }

    /// Remove a subscription. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscriptions().remove(&id).is_some()
    }

    /// Deliver `event` to every subscriber of its class, in subscription
    /// order. Returns the number of handlers invoked.
    pub fn dispatch(&self, event: &ControlEvent) -> usize {
        let mut subs = self.subscriptions();
        let class = event.class();
        let mut delivered = 0;
        subs.retain(|id, sub| {
            if sub.class != class {
                return true;
            }
            delivered += 1;
            match (sub.handler)(event) {
                Disposition::Keep => true,
                Disposition::Done => {
                    trace!(?id, ?class, "Subscription completed");
                    false
                }
            }
        });
        delivered
    }

    /// Number of live subscriptions.
    pub fn len(&self) -> usize {
        self.subscriptions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every subscription.
    pub fn clear(&self) {
        self.subscriptions().clear();
    }
}

/// Build a bootstrap handler that forwards progress to `on_progress`.
///
/// Deliveries are forced to be non-decreasing (a lower value than the last
/// one forwarded is dropped) and the handler completes at 100, so at most one
/// value of 100 is ever forwarded.
pub fn bootstrap_observer(
    mut on_progress: impl FnMut(u8) + Send + 'static,
) -> impl FnMut(&ControlEvent) -> Disposition + Send + 'static {
    let mut last: Option<u8> = None;
    move |event| {
        let ControlEvent::BootstrapProgress(progress) = *event else {
            return Disposition::Keep;
        };
        if last.is_some_and(|prev| progress < prev) {
            trace!(progress, "Dropping regressed bootstrap progress");
            return Disposition::Keep;
        }
        last = Some(progress);
        on_progress(progress);
        if progress >= 100 {
            Disposition::Done
        } else {
            Disposition::Keep
        }
    }
}

/// Build a handler that fires `on_established` on the first `true`
/// circuit-established delivery. `false` deliveries are ignored.
pub fn circuit_observer(
    on_established: impl FnOnce() + Send + 'static,
) -> impl FnMut(&ControlEvent) -> Disposition + Send + 'static {
    let mut on_established = Some(on_established);
    move |event| match event {
        ControlEvent::CircuitEstablished(true) => {
            if let Some(callback) = on_established.take() {
                callback();
            }
            Disposition::Done
        }
        _ => Disposition::Keep,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn collector() -> (Arc<Mutex<Vec<u8>>>, impl FnMut(u8) + Send + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, move |p| sink.lock().unwrap().push(p))
    }

    #[test]
    fn test_bootstrap_self_unsubscribes_at_100() {
        let registry = EventRegistry::new();
        let (seen, sink) = collector();
        registry.subscribe(EventClass::Bootstrap, bootstrap_observer(sink));

        for p in [0, 10, 5, 50, 100, 100, 20] {
            registry.dispatch(&ControlEvent::BootstrapProgress(p));
        }

        assert_eq!(*seen.lock().unwrap(), vec![0, 10, 50, 100]);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_circuit_observer_ignores_false() {
        let registry = EventRegistry::new();
        let fired = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&fired);
        registry.subscribe(
            EventClass::CircuitEstablished,
            circuit_observer(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        registry.dispatch(&ControlEvent::CircuitEstablished(false));
        assert_eq!(registry.len(), 1);
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        registry.dispatch(&ControlEvent::CircuitEstablished(true));
        registry.dispatch(&ControlEvent::CircuitEstablished(true));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_dispatch_only_matching_class() {
        let registry = EventRegistry::new();
        let (seen, sink) = collector();
        registry.subscribe(EventClass::Bootstrap, bootstrap_observer(sink));
        registry.subscribe(EventClass::CircuitEstablished, circuit_observer(|| {}));

        assert_eq!(registry.dispatch(&ControlEvent::BootstrapProgress(30)), 1);
        assert_eq!(registry.dispatch(&ControlEvent::CircuitEstablished(false)), 1);
        assert_eq!(*seen.lock().unwrap(), vec![30]);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_explicit_unsubscribe() {
        let registry = EventRegistry::new();
        let (seen, sink) = collector();
        let id = registry.subscribe(EventClass::Bootstrap, bootstrap_observer(sink));

        assert!(registry.unsubscribe(id));
        assert!(!registry.unsubscribe(id));
        registry.dispatch(&ControlEvent::BootstrapProgress(10));
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_ids_are_unique() {
        let registry = EventRegistry::new();
        let a = registry.subscribe(EventClass::Bootstrap, |_| Disposition::Keep);
        let b = registry.subscribe(EventClass::Bootstrap, |_| Disposition::Keep);
        assert_ne!(a, b);
        registry.clear();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_subscribe_after_panicking_handler() {
        let registry = Arc::new(EventRegistry::new());
        registry.subscribe(EventClass::CircuitEstablished, |_| panic!("handler failed"));
        let shared = Arc::clone(&registry);
        let dispatched =
            std::thread::spawn(move || shared.dispatch(&ControlEvent::CircuitEstablished(true)))
                .join();
        assert!(dispatched.is_err());

        let (seen, sink) = collector();
        let id = registry.subscribe(EventClass::Bootstrap, bootstrap_observer(sink));
        assert_eq!(registry.dispatch(&ControlEvent::BootstrapProgress(40)), 1);
        assert_eq!(*seen.lock().unwrap(), vec![40]);
        assert!(registry.unsubscribe(id));
    }
}

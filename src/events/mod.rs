//! Per-component publish/subscribe registry
//!
//! Every component (transport, negotiation, devices, recording, call) owns its
//! own `EventDispatcher`. Subscribers register a handler for one event name,
//! or for all events, and get back a `Subscription` token to unsubscribe with.
//!
//! Handlers are isolated from each other and from the emitter: a handler that
//! returns an error or panics is logged and skipped, delivery continues.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Wildcard name matching every event of a dispatcher
pub const ALL_EVENTS: &str = "*";

/// An event that can be routed by name
pub trait Event: Clone + Send + Sync + 'static {
    /// Stable event name used as the registry key (e.g. "reconnecting")
    fn name(&self) -> &'static str;
}

type Handler<E> = Arc<dyn Fn(&E) -> anyhow::Result<()> + Send + Sync>;

/// Token returned by `subscribe`, used to remove the handler again
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription {
    id: u64,
    name: &'static str,
}

impl Subscription {
    pub fn event_name(&self) -> &'static str {
        self.name
    }
}

pub struct EventDispatcher<E: Event> {
    /// Component name for log lines
    component: &'static str,
    next_id: AtomicU64,
    handlers: RwLock<HashMap<&'static str, Vec<(u64, Handler<E>)>>>,
}

impl<E: Event> EventDispatcher<E> {
    pub fn new(component: &'static str) -> Self {
        Self {
            component,
            next_id: AtomicU64::new(1),
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Register `handler` for events named `name` (or `ALL_EVENTS`)
    pub fn subscribe<F>(&self, name: &'static str, handler: F) -> Subscription
    where
        F: Fn(&E) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers
            .write()
            .entry(name)
            .or_default()
            .push((id, Arc::new(handler)));

        debug!("{}: subscribed handler {} to '{}'", self.component, id, name);

        Subscription { id, name }
    }

    /// Register `handler` for every event this dispatcher emits
    pub fn subscribe_all<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&E) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.subscribe(ALL_EVENTS, handler)
    }

    /// Forward events named `name` into an unbounded channel
    ///
    /// Useful for async consumers that want to `.recv().await` instead of
    /// running inside the emitter's call stack. Dropping the receiver turns
    /// the handler into a no-op; unsubscribe to remove it entirely.
    pub fn channel(&self, name: &'static str) -> (Subscription, mpsc::UnboundedReceiver<E>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self.subscribe(name, move |event: &E| {
            let _ = tx.send(event.clone());
            Ok(())
        });
        (subscription, rx)
    }

    /// Remove a handler. Returns false if it was already gone.
    pub fn unsubscribe(&self, subscription: Subscription) -> bool {
        let mut handlers = self.handlers.write();
        let Some(list) = handlers.get_mut(subscription.name) else {
            return false;
        };

        let before = list.len();
        list.retain(|(id, _)| *id != subscription.id);
        let removed = list.len() != before;

        if list.is_empty() {
            handlers.remove(subscription.name);
        }

        removed
    }

    /// Deliver `event` to every matching handler
    ///
    /// Returns the number of handlers that completed without error.
    pub fn emit(&self, event: E) -> usize {
        let name = event.name();

        // Snapshot under the lock, call outside it so handlers may (un)subscribe
        let targets: Vec<(u64, Handler<E>)> = {
            let handlers = self.handlers.read();
            handlers
                .get(name)
                .into_iter()
                .chain(handlers.get(ALL_EVENTS))
                .flat_map(|list| list.iter().cloned())
                .collect()
        };

        let mut delivered = 0;

        for (id, handler) in targets {
            match catch_unwind(AssertUnwindSafe(|| handler(&event))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => {
                    warn!(
                        "{}: handler {} failed on '{}': {:#}",
                        self.component, id, name, e
                    );
                }
                Err(_) => {
                    error!("{}: handler {} panicked on '{}'", self.component, id, name);
                }
            }
        }

        delivered
    }

    /// Number of registered handlers across all names
    pub fn handler_count(&self) -> usize {
        self.handlers.read().values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, Clone, PartialEq)]
    enum Ping {
        A(u32),
        B,
    }

    impl Event for Ping {
        fn name(&self) -> &'static str {
            match self {
                Ping::A(_) => "a",
                Ping::B => "b",
            }
        }
    }

    #[test]
    fn test_routes_by_name() {
        let dispatcher = EventDispatcher::<Ping>::new("test");
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = hits.clone();
        dispatcher.subscribe("a", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        dispatcher.emit(Ping::A(1));
        dispatcher.emit(Ping::B);

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_wildcard_receives_everything() {
        let dispatcher = EventDispatcher::<Ping>::new("test");
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = hits.clone();
        dispatcher.subscribe_all(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        dispatcher.emit(Ping::A(1));
        dispatcher.emit(Ping::B);

        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_failing_and_panicking_handlers_are_isolated() {
        let dispatcher = EventDispatcher::<Ping>::new("test");
        let hits = Arc::new(AtomicUsize::new(0));

        dispatcher.subscribe("a", |_| anyhow::bail!("boom"));
        dispatcher.subscribe("a", |_| panic!("handler panic"));

        let counter = hits.clone();
        dispatcher.subscribe("a", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let delivered = dispatcher.emit(Ping::A(7));

        assert_eq!(delivered, 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe_twice() {
        let dispatcher = EventDispatcher::<Ping>::new("test");
        let sub = dispatcher.subscribe("b", |_| Ok(()));

        assert_eq!(dispatcher.handler_count(), 1);
        assert!(dispatcher.unsubscribe(sub));
        assert!(!dispatcher.unsubscribe(sub));
        assert_eq!(dispatcher.handler_count(), 0);
        assert_eq!(dispatcher.emit(Ping::B), 0);
    }

    #[tokio::test]
    async fn test_channel_adapter() {
        let dispatcher = EventDispatcher::<Ping>::new("test");
        let (_sub, mut rx) = dispatcher.channel("a");

        dispatcher.emit(Ping::A(3));
        dispatcher.emit(Ping::B);
        dispatcher.emit(Ping::A(4));

        assert_eq!(rx.recv().await, Some(Ping::A(3)));
        assert_eq!(rx.recv().await, Some(Ping::A(4)));
    }
}

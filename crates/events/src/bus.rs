//! Synchronous in-process event bus.
//!
//! Components publish [`Event`]s without knowing who listens. Two consumption styles are
//! offered:
//!
//! - **Handlers** (`subscribe`/`subscribe_once`): called synchronously, in subscription
//!   order, before `publish` returns.
//! - **Streams** (`stream`): a channel receiving every event, for consumers living on
//!   another thread.
//!
//! ## Handler failures
//!
//! A handler that panics is caught and logged. Delivery continues with the next handler
//! and the publisher never observes the panic.
//!
//! ## Re-entrancy
//!
//! No lock is held while handlers run, so a handler may publish, subscribe or unsubscribe
//! on the same bus. Subscriptions added during a publish take effect from the next one.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;

use tracing::{error, trace};

use crate::event::{Event, EventKind};

/// Callback invoked for each matching event.
pub type EventHandler = Arc<dyn Fn(&Event) + Send + Sync>;

/// Identifier of a handler registration.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

/// A channel subscription to every published event.
///
/// Messages are received in publish order. Each subscription should be drained by one
/// thread.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Block until the next message is available.
    pub fn recv(&self) -> Result<M, mpsc::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&self) -> Result<M, mpsc::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, mpsc::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Drain everything currently buffered.
    pub fn drain(&self) -> Vec<M> {
        self.receiver.try_iter().collect()
    }
}

struct Subscriber {
    id: SubscriberId,
    handler: EventHandler,
    once: bool,
}

#[derive(Default)]
struct BusInner {
    next_id: AtomicU64,
    handlers: RwLock<HashMap<EventKind, Vec<Subscriber>>>,
    streams: Mutex<Vec<mpsc::Sender<Event>>>,
}

/// Handle returned by `subscribe`; dropping it does **not** unsubscribe.
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    kind: EventKind,
    id: SubscriberId,
    bus: Weak<BusInner>,
}

impl SubscriptionHandle {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Remove the handler. Returns false if it was already gone (or the bus was dropped).
    pub fn unsubscribe(&self) -> bool {
        match self.bus.upgrade() {
            Some(inner) => inner.remove(self.kind, self.id),
            None => false,
        }
    }
}

impl core::fmt::Debug for BusInner {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BusInner").finish_non_exhaustive()
    }
}

impl BusInner {
    fn remove(&self, kind: EventKind, id: SubscriberId) -> bool {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        let Some(subs) = handlers.get_mut(&kind) else {
            return false;
        };
        let before = subs.len();
        subs.retain(|s| s.id != id);
        before != subs.len()
    }
}

/// Typed publish/subscribe hub.
///
/// Cloning is cheap and clones share the same subscriber sets.
#[derive(Debug, Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for every event of `kind`.
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionHandle
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.register(kind, Arc::new(handler), false)
    }

    /// Register `handler` for the next event of `kind` only.
    pub fn subscribe_once<F>(&self, kind: EventKind, handler: F) -> SubscriptionHandle
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.register(kind, Arc::new(handler), true)
    }

    fn register(&self, kind: EventKind, handler: EventHandler, once: bool) -> SubscriptionHandle {
        let id = SubscriberId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(kind)
            .or_default()
            .push(Subscriber { id, handler, once });

        trace!(event = kind.as_str(), subscriber = id.0, once, "subscribed");

        SubscriptionHandle {
            kind,
            id,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Remove a handler registration. Returns whether it existed.
    pub fn unsubscribe(&self, kind: EventKind, id: SubscriberId) -> bool {
        self.inner.remove(kind, id)
    }

    /// Receive every published event over a channel.
    pub fn stream(&self) -> Subscription<Event> {
        let (tx, rx) = mpsc::channel();
        self.inner
            .streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        Subscription::new(rx)
    }

    /// Deliver `event` to all current subscribers of its kind, in subscription order.
    pub fn publish(&self, event: Event) {
        let kind = event.kind();

        // Snapshot under the lock, deliver without it.
        let targets: Vec<EventHandler> = {
            let mut handlers = self
                .inner
                .handlers
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            match handlers.get_mut(&kind) {
                Some(subs) => {
                    let targets = subs.iter().map(|s| s.handler.clone()).collect();
                    subs.retain(|s| !s.once);
                    targets
                }
                None => Vec::new(),
            }
        };

        trace!(event = kind.as_str(), handlers = targets.len(), "publishing");

        // Streams first: anything a handler publishes in turn must reach them afterwards.
        // Dead streams are dropped on the way.
        self.inner
            .streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|tx| tx.send(event.clone()).is_ok());

        for handler in targets {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler(&event))) {
                error!(
                    event = kind.as_str(),
                    panic = %panic_message(panic.as_ref()),
                    "event handler panicked"
                );
            }
        }
    }

    /// Remove handlers for one kind, or for every kind when `kind` is `None`.
    pub fn clear(&self, kind: Option<EventKind>) {
        let mut handlers = self
            .inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        match kind {
            Some(kind) => {
                handlers.remove(&kind);
            }
            None => handlers.clear(),
        }
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.inner
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .map_or(0, Vec::len)
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

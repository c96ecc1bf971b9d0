//! The shared broadcast medium both roles talk over.
//!
//! A [`Medium`] delivers every publish to every current subscriber of that
//! event type, synchronously, within the `publish` call, and keeps nothing:
//! late subscribers never see past events.
//!
//! # Scheduling contract
//!
//! Handlers run to completion on the publishing thread before `publish`
//! returns. A subscription that has returned is visible to every later
//! publish, from any thread. Subscribing or unsubscribing while a publish
//! is being dispatched only affects later publishes. Registries rely on
//! this: they subscribe to announcements before they publish a request, so
//! an announcer answering inside the same dispatch is never missed.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::message::Event;
use crate::{Error, Result};

/// Callback invoked for each delivered event.
pub type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

/// A publish/subscribe channel shared by everything in one page context.
pub trait Medium: Send + Sync + 'static {
    /// Deliver `event` to all current subscribers of `event.kind`.
    fn publish(&self, event: Event) -> Result<()>;

    /// Register `handler` for events of type `kind` until the returned
    /// guard is dropped.
    fn subscribe(&self, kind: &str, handler: Handler) -> Result<Subscription>;
}

/// Keeps a handler registered; unsubscribes on drop.
#[must_use = "dropping a Subscription unsubscribes its handler"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Build a subscription that runs `cancel` exactly once when released.
    pub fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Unsubscribe now.
    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

struct Slot {
    id: u64,
    kind: String,
    handler: Handler,
}

struct Inner {
    open: bool,
    next_id: u64,
    slots: Vec<Slot>,
}

/// In-memory medium with synchronous fan-out.
///
/// Cheap to clone; clones share the same channel.
#[derive(Clone)]
pub struct LocalMedium {
    inner: Arc<Mutex<Inner>>,
}

impl LocalMedium {
    /// Create an open, empty medium.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                open: true,
                next_id: 0,
                slots: Vec::new(),
            })),
        }
    }

    /// Make the medium unavailable.
    ///
    /// Existing handlers are dropped and every later publish or subscribe
    /// fails with [`Error::MediumUnavailable`].
    pub fn close(&self) {
        let dropped = {
            let mut inner = self.inner.lock();
            inner.open = false;
            std::mem::take(&mut inner.slots)
        };
        trace!(handlers = dropped.len(), "medium closed");
    }

    /// Whether the medium still accepts traffic.
    pub fn is_open(&self) -> bool {
        self.inner.lock().open
    }

    /// Number of live subscriptions for `kind`.
    pub fn subscriber_count(&self, kind: &str) -> usize {
        self.inner
            .lock()
            .slots
            .iter()
            .filter(|slot| slot.kind == kind)
            .count()
    }
}

impl Default for LocalMedium {
    fn default() -> Self {
        Self::new()
    }
}

impl Medium for LocalMedium {
    fn publish(&self, event: Event) -> Result<()> {
        // Snapshot under the lock, dispatch without it: handlers may publish
        // or (un)subscribe re-entrantly.
        let targets: Vec<Handler> = {
            let inner = self.inner.lock();
            if !inner.open {
                return Err(Error::MediumUnavailable);
            }
            inner
                .slots
                .iter()
                .filter(|slot| slot.kind == event.kind)
                .map(|slot| Arc::clone(&slot.handler))
                .collect()
        };

        trace!(kind = %event.kind, subscribers = targets.len(), "publish");
        for handler in targets {
            handler(&event);
        }
        Ok(())
    }

    fn subscribe(&self, kind: &str, handler: Handler) -> Result<Subscription> {
        let id = {
            let mut inner = self.inner.lock();
            if !inner.open {
                return Err(Error::MediumUnavailable);
            }
            let id = inner.next_id;
            inner.next_id += 1;
            inner.slots.push(Slot {
                id,
                kind: kind.to_owned(),
                handler,
            });
            id
        };
        trace!(kind, id, "subscribe");

        let weak = Arc::downgrade(&self.inner);
        Ok(Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                // Dropped after the lock is released: the handler may own
                // subscriptions of its own.
                let removed = {
                    let mut inner = inner.lock();
                    let index = inner.slots.iter().position(|slot| slot.id == id);
                    index.map(|i| inner.slots.remove(i))
                };
                drop(removed);
            }
        }))
    }
}

impl std::fmt::Debug for LocalMedium {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("LocalMedium")
            .field("open", &inner.open)
            .field("subscriptions", &inner.slots.len())
            .finish()
    }
}

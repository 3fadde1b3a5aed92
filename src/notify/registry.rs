//! Subscriber registry holding non-owning handles.
//!
//! The registry keeps a `Weak` reference to each handler; the
//! [`Subscription`] token returned to the caller keeps the only strong one.
//! Dropping the token therefore unregisters the handler without touching
//! the registry. Dead entries are pruned on the next broadcast.

use parking_lot::Mutex;
use std::sync::{Arc, Weak};

struct Entries<T: ?Sized> {
    next_id: u64,
    handlers: Vec<(u64, Weak<T>)>,
}

/// A set of weakly held handlers.
pub struct Registry<T: ?Sized> {
    entries: Arc<Mutex<Entries<T>>>,
}

impl<T: ?Sized> Registry<T> {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(Entries {
                next_id: 1,
                handlers: Vec::new(),
            })),
        }
    }

    /// Register `handler`. It stays registered while the returned token lives.
    pub fn register(&self, handler: Arc<T>) -> Subscription<T> {
        let mut entries = self.entries.lock();
        let id = entries.next_id;
        entries.next_id += 1;
        entries.handlers.push((id, Arc::downgrade(&handler)));

        Subscription {
            id,
            handler,
            entries: Arc::downgrade(&self.entries),
        }
    }

    /// Strong handles to every live handler, pruning dead entries.
    ///
    /// The list is taken under the lock and returned, so handlers run
    /// without it and may register or unregister freely.
    pub fn live(&self) -> Vec<Arc<T>> {
        let mut entries = self.entries.lock();
        let mut live = Vec::with_capacity(entries.handlers.len());
        entries.handlers.retain(|(_, weak)| match weak.upgrade() {
            Some(handler) => {
                live.push(handler);
                true
            }
            None => false,
        });
        live
    }

    /// Whether any handler is still alive.
    pub fn has_subscribers(&self) -> bool {
        self.entries
            .lock()
            .handlers
            .iter()
            .any(|(_, weak)| weak.strong_count() > 0)
    }

    /// Number of live handlers.
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .handlers
            .iter()
            .filter(|(_, weak)| weak.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        !self.has_subscribers()
    }

    /// Drop every registration. Outstanding tokens become inert.
    pub fn clear(&self) {
        self.entries.lock().handlers.clear();
    }
}

impl<T: ?Sized> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Token that keeps a handler registered.
///
/// Unsubscribing happens automatically on drop; [`unsubscribe`] does the
/// same eagerly.
///
/// [`unsubscribe`]: Subscription::unsubscribe
#[must_use = "dropping the subscription unregisters the handler"]
pub struct Subscription<T: ?Sized> {
    id: u64,
    handler: Arc<T>,
    entries: Weak<Mutex<Entries<T>>>,
}

impl<T: ?Sized> Subscription<T> {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The registered handler.
    pub fn handler(&self) -> &Arc<T> {
        &self.handler
    }

    /// Remove the registration now rather than on the next broadcast.
    pub fn unsubscribe(self) {
        if let Some(entries) = self.entries.upgrade() {
            entries.lock().handlers.retain(|(id, _)| *id != self.id);
        }
    }
}

impl<T: ?Sized> std::fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

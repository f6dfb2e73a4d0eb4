//! Synchronous in-process event channel for store mutations.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::history::core::ids::{PairId, TopicId};
use crate::history::core::pair::MessagePair;

/// Kind of a store event, used to pick which events a listener receives.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum EventKind {
    /// A topic was created.
    TopicAdded,
    /// A topic was renamed or otherwise edited in place.
    TopicUpdated,
    /// A topic was removed.
    TopicDeleted,
    /// A topic changed parent.
    TopicMoved,
    /// Rollup counts changed on one or more topics.
    TopicCountsChanged,
    /// A pair was created.
    PairAdded,
    /// A pair was edited.
    PairUpdated,
    /// A pair was removed.
    PairDeleted,
    /// Many pairs were edited at once.
    PairsBulkUpdated,
}

/// A mutation notification emitted by the store.
///
/// Single-entity events carry only the id; listeners read current state back
/// from the store. The bulk event carries the updated pairs themselves.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreEvent {
    /// A topic was created.
    TopicAdded(TopicId),
    /// A topic was edited in place.
    TopicUpdated(TopicId),
    /// A topic was removed.
    TopicDeleted(TopicId),
    /// A topic changed parent.
    TopicMoved {
        /// Moved topic.
        id: TopicId,
        /// Previous parent.
        from: Option<TopicId>,
        /// New parent.
        to: TopicId,
    },
    /// Rollup counts changed on these topics.
    TopicCountsChanged(Vec<TopicId>),
    /// A pair was created.
    PairAdded(PairId),
    /// A pair was edited.
    PairUpdated(PairId),
    /// A pair was removed.
    PairDeleted(PairId),
    /// Many pairs were edited at once.
    PairsBulkUpdated(Vec<MessagePair>),
}

impl StoreEvent {
    /// Kind of this event.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::TopicAdded(_) => EventKind::TopicAdded,
            Self::TopicUpdated(_) => EventKind::TopicUpdated,
            Self::TopicDeleted(_) => EventKind::TopicDeleted,
            Self::TopicMoved { .. } => EventKind::TopicMoved,
            Self::TopicCountsChanged(_) => EventKind::TopicCountsChanged,
            Self::PairAdded(_) => EventKind::PairAdded,
            Self::PairUpdated(_) => EventKind::PairUpdated,
            Self::PairDeleted(_) => EventKind::PairDeleted,
            Self::PairsBulkUpdated(_) => EventKind::PairsBulkUpdated,
        }
    }
}

/// Listener callback.
pub type Listener = Arc<dyn Fn(&StoreEvent) + Send + Sync>;

struct Registration {
    id: u64,
    kind: EventKind,
    listener: Listener,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    entries: Vec<Registration>,
}

fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Publish/subscribe channel.
///
/// Listeners run synchronously, in subscription order, on the emitting
/// thread. The listener list is copied before dispatch, so a listener may
/// subscribe or cancel without disturbing the current emit. A panicking
/// listener is not caught.
#[derive(Default)]
pub struct EventBus {
    registry: Arc<Mutex<Registry>>,
}

impl EventBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener` for events of `kind`.
    pub fn on<F>(&self, kind: EventKind, listener: F) -> Subscription
    where
        F: Fn(&StoreEvent) + Send + Sync + 'static,
    {
        let mut registry = lock(&self.registry);
        let id = registry.next_id;
        registry.next_id += 1;
        registry.entries.push(Registration {
            id,
            kind,
            listener: Arc::new(listener),
        });
        Subscription {
            id,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Dispatch `event` to every listener registered for its kind.
    pub fn emit(&self, event: &StoreEvent) {
        let kind = event.kind();
        let snapshot: Vec<Listener> = lock(&self.registry)
            .entries
            .iter()
            .filter(|entry| entry.kind == kind)
            .map(|entry| Arc::clone(&entry.listener))
            .collect();

        for listener in snapshot {
            listener(event);
        }
    }

    /// Number of registered listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        lock(&self.registry).entries.len()
    }
}

/// Handle returned by [`EventBus::on`].
///
/// Dropping the handle keeps the listener registered; call
/// [`Subscription::cancel`] to remove it.
#[must_use = "dropping a Subscription keeps the listener; call cancel() to remove it"]
pub struct Subscription {
    id: u64,
    registry: Weak<Mutex<Registry>>,
}

impl Subscription {
    /// Remove the listener. No-op if the bus is gone.
    pub fn cancel(self) {
        if let Some(registry) = self.registry.upgrade() {
            lock(&registry).entries.retain(|entry| entry.id != self.id);
        }
    }
}

//! Typed in-process event bus for sync lifecycle notifications.
//!
//! Delivery is best-effort and synchronous: listeners run on the publishing
//! task, in registration order. Nothing is buffered for late subscribers, so
//! consumers should read [`SyncState`] first and subscribe for changes after.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tracing::trace;

use tideline_common::{ItemId, RecordId};

use crate::state::SyncState;

/// Discriminant used to filter subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    SyncStatusChanged,
    SyncCountChanged,
    NetworkStatusChanged,
    ConflictResolved,
    ItemFailed,
    TableChanged,
}

/// Sync lifecycle event.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// Engine status, progress or history changed.
    SyncStatusChanged(SyncState),
    /// Outbox totals changed.
    SyncCountChanged { pending: usize, failed: usize },
    /// Connectivity flipped.
    NetworkStatusChanged { online: bool },
    /// A conflict was settled in favour of the server; refresh the local copy.
    ConflictResolved {
        item_id: ItemId,
        table: String,
        record_id: Option<RecordId>,
        server_version: Option<serde_json::Value>,
    },
    /// An item was rejected or ran out of retries.
    ItemFailed {
        item_id: ItemId,
        table: String,
        reason: String,
    },
    /// Mutations on `table` were accepted by the remote.
    TableChanged { table: String },
}

impl SyncEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::SyncStatusChanged(_) => EventKind::SyncStatusChanged,
            Self::SyncCountChanged { .. } => EventKind::SyncCountChanged,
            Self::NetworkStatusChanged { .. } => EventKind::NetworkStatusChanged,
            Self::ConflictResolved { .. } => EventKind::ConflictResolved,
            Self::ItemFailed { .. } => EventKind::ItemFailed,
            Self::TableChanged { .. } => EventKind::TableChanged,
        }
    }
}

type Listener = Arc<dyn Fn(&SyncEvent) + Send + Sync>;

struct BusInner {
    listeners: RwLock<BTreeMap<u64, (EventKind, Listener)>>,
    next_id: AtomicU64,
    broadcast: broadcast::Sender<SyncEvent>,
}

/// Publish/subscribe hub shared by the engine, the network monitor and
/// application code. Cloning yields another handle to the same bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// Create a bus whose async receivers buffer up to 256 events.
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    /// Create a bus with a custom buffer for async receivers.
    pub fn with_capacity(capacity: usize) -> Self {
        let (broadcast, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(BusInner {
                listeners: RwLock::new(BTreeMap::new()),
                next_id: AtomicU64::new(0),
                broadcast,
            }),
        }
    }

    /// Register `listener` for events of `kind`.
    ///
    /// The listener stays registered until the returned [`Subscription`] is
    /// dropped or explicitly unsubscribed.
    pub fn subscribe<F>(&self, kind: EventKind, listener: F) -> Subscription
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .listeners
            .write()
            .insert(id, (kind, Arc::new(listener)));

        Subscription {
            bus: Arc::downgrade(&self.inner),
            id,
        }
    }

    /// Async stream of every event. Slow receivers lag and lose events.
    pub fn receiver(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.broadcast.subscribe()
    }

    /// Deliver `event` to matching listeners and async receivers.
    pub fn publish(&self, event: SyncEvent) {
        let kind = event.kind();
        let listeners: Vec<Listener> = self
            .inner
            .listeners
            .read()
            .values()
            .filter(|(k, _)| *k == kind)
            .map(|(_, l)| Arc::clone(l))
            .collect();

        trace!("Publishing {:?} to {} listeners", kind, listeners.len());
        for listener in listeners {
            listener(&event);
        }

        // No receivers is fine.
        let _ = self.inner.broadcast.send(event);
    }

    /// Number of registered callback listeners.
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.read().len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Keeps a listener registered. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes the listener"]
pub struct Subscription {
    bus: Weak<BusInner>,
    id: u64,
}

impl Subscription {
    /// Remove the listener now.
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.listeners.write().remove(&self.id);
        }
    }
}

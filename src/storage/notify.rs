//! Change notifications for external caches.
//!
//! Every committed mutation produces one [`ChangeEvent`] per touched row.
//! The store publishes them synchronously, after commit, to every listener
//! in the [`ListenerRegistry`]. Listeners must not block; there is no retry
//! and no backpressure.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::error::{DbError, DbResult};

use super::TenantId;

/// Table a change applies to
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChangeTable {
    Objects,
    Collections,
}

/// Type of change event
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// A committed change
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeEvent {
    pub table: ChangeTable,
    pub tenant: TenantId,
    /// Object id, or collection id for `collections` events
    pub id: i64,
    pub kind: ChangeKind,
    pub timestamp: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn object(tenant: TenantId, id: i64, kind: ChangeKind) -> Self {
        Self {
            table: ChangeTable::Objects,
            tenant,
            id,
            kind,
            timestamp: Utc::now(),
        }
    }

    pub fn collection(tenant: TenantId, id: i64, kind: ChangeKind) -> Self {
        Self {
            table: ChangeTable::Collections,
            tenant,
            id,
            kind,
            timestamp: Utc::now(),
        }
    }
}

/// Consumer of change events.
pub trait Listener: Send + Sync {
    fn notify(&self, event: &ChangeEvent);

    /// The store reconnected to its storage; cached state is stale.
    fn reconnect(&self) {}
}

/// Handle returned by [`ListenerRegistry::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId {
    slot: usize,
    generation: u64,
}

struct Slot {
    generation: u64,
    listener: Option<Arc<dyn Listener>>,
}

/// Fixed-capacity list of listener slots.
///
/// Unregistering leaves a tombstone that a later registration may reuse;
/// the slot generation keeps stale ids from removing the new occupant.
pub struct ListenerRegistry {
    slots: RwLock<Vec<Slot>>,
    capacity: usize,
}

impl ListenerRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: RwLock::new(Vec::new()),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of live listeners
    pub fn len(&self) -> usize {
        self.slots
            .read()
            .iter()
            .filter(|s| s.listener.is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn register(&self, listener: Arc<dyn Listener>) -> DbResult<ListenerId> {
        let mut slots = self.slots.write();

        if let Some(slot) = slots.iter().position(|s| s.listener.is_none()) {
            let entry = &mut slots[slot];
            entry.generation += 1;
            entry.listener = Some(listener);
            return Ok(ListenerId {
                slot,
                generation: entry.generation,
            });
        }

        if slots.len() >= self.capacity {
            return Err(DbError::Storage(format!(
                "listener limit of {} reached",
                self.capacity
            )));
        }

        slots.push(Slot {
            generation: 0,
            listener: Some(listener),
        });
        Ok(ListenerId {
            slot: slots.len() - 1,
            generation: 0,
        })
    }

    /// Remove a listener; false when the id is stale or unknown.
    pub fn unregister(&self, id: ListenerId) -> bool {
        let mut slots = self.slots.write();
        match slots.get_mut(id.slot) {
            Some(slot) if slot.generation == id.generation && slot.listener.is_some() => {
                slot.listener = None;
                true
            }
            _ => false,
        }
    }

    fn snapshot(&self) -> Vec<Arc<dyn Listener>> {
        self.slots
            .read()
            .iter()
            .filter_map(|s| s.listener.clone())
            .collect()
    }

    /// Deliver events in order to every listener.
    pub fn publish(&self, events: &[ChangeEvent]) {
        if events.is_empty() {
            return;
        }
        for listener in self.snapshot() {
            for event in events {
                listener.notify(event);
            }
        }
    }

    pub fn reconnect_all(&self) {
        for listener in self.snapshot() {
            listener.reconnect();
        }
    }
}

/// Forwards events into a `tokio` broadcast channel.
///
/// Receivers that lag behind lose the oldest events, and a send without
/// receivers is dropped.
pub struct BroadcastListener {
    sender: broadcast::Sender<ChangeEvent>,
}

impl BroadcastListener {
    pub fn new(capacity: usize) -> (Self, broadcast::Receiver<ChangeEvent>) {
        let (sender, receiver) = broadcast::channel(capacity.max(1));
        (Self { sender }, receiver)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.sender.subscribe()
    }
}

impl Listener for BroadcastListener {
    fn notify(&self, event: &ChangeEvent) {
        let _ = self.sender.send(event.clone());
    }

    fn reconnect(&self) {
        tracing::debug!("Change feed reconnected");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<ChangeEvent>>,
        reconnects: Mutex<usize>,
    }

    impl Listener for Recorder {
        fn notify(&self, event: &ChangeEvent) {
            self.events.lock().push(event.clone());
        }

        fn reconnect(&self) {
            *self.reconnects.lock() += 1;
        }
    }

    #[test]
    fn test_publish_reaches_every_listener() {
        let registry = ListenerRegistry::new(4);
        let a = Arc::new(Recorder::default());
        let b = Arc::new(Recorder::default());
        registry.register(a.clone()).unwrap();
        registry.register(b.clone()).unwrap();

        registry.publish(&[
            ChangeEvent::object(1, 10, ChangeKind::Insert),
            ChangeEvent::object(1, 11, ChangeKind::Insert),
        ]);

        assert_eq!(a.events.lock().len(), 2);
        assert_eq!(b.events.lock()[1].id, 11);
    }

    #[test]
    fn test_capacity_and_tombstones() {
        let registry = ListenerRegistry::new(2);
        let first = registry.register(Arc::new(Recorder::default())).unwrap();
        registry.register(Arc::new(Recorder::default())).unwrap();
        assert!(registry.register(Arc::new(Recorder::default())).is_err());

        assert!(registry.unregister(first));
        assert!(!registry.unregister(first));
        assert_eq!(registry.len(), 1);

        let reused = registry.register(Arc::new(Recorder::default())).unwrap();
        assert_ne!(reused, first);
        assert!(!registry.unregister(first));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_unregistered_listener_gets_nothing() {
        let registry = ListenerRegistry::new(2);
        let recorder = Arc::new(Recorder::default());
        let id = registry.register(recorder.clone()).unwrap();
        registry.unregister(id);

        registry.publish(&[ChangeEvent::object(1, 1, ChangeKind::Delete)]);
        registry.reconnect_all();
        assert!(recorder.events.lock().is_empty());
        assert_eq!(*recorder.reconnects.lock(), 0);
    }

    #[test]
    fn test_reconnect_all() {
        let registry = ListenerRegistry::new(2);
        let recorder = Arc::new(Recorder::default());
        registry.register(recorder.clone()).unwrap();
        registry.reconnect_all();
        assert_eq!(*recorder.reconnects.lock(), 1);
    }

    #[test]
    fn test_broadcast_listener() {
        let (listener, mut receiver) = BroadcastListener::new(8);
        let event = ChangeEvent::collection(3, 1, ChangeKind::Insert);
        listener.notify(&event);

        let received = receiver.try_recv().unwrap();
        assert_eq!(received, event);
        assert_eq!(received.table, ChangeTable::Collections);
    }

    #[tokio::test]
    async fn test_broadcast_subscribers_receive_async() {
        let (listener, mut first) = BroadcastListener::new(4);
        let mut second = listener.subscribe();

        listener.notify(&ChangeEvent::object(1, 7, ChangeKind::Delete));
        assert_eq!(first.recv().await.unwrap().id, 7);
        assert_eq!(second.recv().await.unwrap().kind, ChangeKind::Delete);
    }

    #[test]
    fn test_event_serialization() {
        let event = ChangeEvent::object(5, 42, ChangeKind::Update);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["table"], "objects");
        assert_eq!(json["kind"], "update");
        assert_eq!(json["tenant"], 5);
    }
}

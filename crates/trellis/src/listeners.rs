//! Listener registries.
//!
//! Three independent registries (connection / data / disconnection) share
//! one monotonic id counter, so an id identifies its listener across all of
//! them. Registration and removal are deferred through to-add / to-remove
//! queues that drain just before each dispatch iteration: a callback may
//! unregister itself (or register new listeners) without corrupting the
//! iteration, and the lock is never held while user code runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::peer::Peer;

/// Identifier returned by `add_*_listener`, unique across all registries.
pub type ListenerId = u64;

/// Called when a peer joins the mesh (directly or through a forwarder).
pub type ConnectionListener = Arc<dyn Fn(&Peer) + Send + Sync>;

/// Called with `(source, data, sent_to_all)` for every delivered payload.
pub type DataListener = Arc<dyn Fn(&Peer, &[u8], bool) + Send + Sync>;

/// Called when a peer leaves the mesh or becomes unreachable.
pub type DisconnectionListener = Arc<dyn Fn(&Peer) + Send + Sync>;

struct Inner<L> {
    live: HashMap<ListenerId, L>,
    to_add: Vec<(ListenerId, L)>,
    to_remove: Vec<ListenerId>,
}

pub(crate) struct Registry<L> {
    inner: Mutex<Inner<L>>,
}

impl<L: Clone> Registry<L> {
    fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                live: HashMap::new(),
                to_add: Vec::new(),
                to_remove: Vec::new(),
            }),
        }
    }

    pub fn add(&self, id: ListenerId, listener: L) {
        let mut inner = self.inner.lock().unwrap();
        tracing::trace!(id, "queueing listener");
        inner.to_add.push((id, listener));
    }

    /// Queue a removal for a live listener, or rescind a pending add.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.live.contains_key(&id) {
            if !inner.to_remove.contains(&id) {
                tracing::trace!(id, "queueing listener removal");
                inner.to_remove.push(id);
                return true;
            }
            return false;
        }
        if let Some(pos) = inner.to_add.iter().position(|(pending, _)| *pending == id) {
            tracing::trace!(id, "rescinding pending listener");
            inner.to_add.swap_remove(pos);
            return true;
        }
        false
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.live.clear();
        inner.to_add.clear();
        inner.to_remove.clear();
    }

    /// Drain the deferred queues into the live map and return a snapshot to
    /// iterate over. Callbacks run on the snapshot, outside the lock.
    pub fn snapshot(&self) -> Vec<(ListenerId, L)> {
        let mut inner = self.inner.lock().unwrap();
        let added: Vec<_> = inner.to_add.drain(..).collect();
        for (id, listener) in added {
            inner.live.insert(id, listener);
        }
        let removed: Vec<_> = inner.to_remove.drain(..).collect();
        for id in removed {
            inner.live.remove(&id);
        }
        inner
            .live
            .iter()
            .map(|(id, l)| (*id, l.clone()))
            .collect()
    }
}

/// The three registries plus the shared id counter.
pub(crate) struct Listeners {
    counter: AtomicU64,
    pub connection: Registry<ConnectionListener>,
    pub data: Registry<DataListener>,
    pub disconnection: Registry<DisconnectionListener>,
}

impl Listeners {
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(0),
            connection: Registry::new(),
            data: Registry::new(),
            disconnection: Registry::new(),
        }
    }

    pub fn next_id(&self) -> ListenerId {
        self.counter.fetch_add(1, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn dummy_peer() -> Peer {
        Peer::unlocated(
            crate::types::PeerId::new_v4(),
            crate::types::PeerId::new_v4(),
            2,
        )
    }

    #[test]
    fn add_is_deferred_until_snapshot() {
        let listeners = Listeners::new();
        let id = listeners.next_id();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        listeners
            .connection
            .add(id, Arc::new(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            }));

        let snap = listeners.connection.snapshot();
        assert_eq!(snap.len(), 1);
        let peer = dummy_peer();
        for (_, l) in &snap {
            l(&peer);
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn remove_rescinds_a_pending_add() {
        let listeners = Listeners::new();
        let id = listeners.next_id();
        listeners.connection.add(id, Arc::new(|_| {}));
        assert!(listeners.connection.remove(id));
        assert!(listeners.connection.snapshot().is_empty());
        // The id is gone entirely now.
        assert!(!listeners.connection.remove(id));
    }

    #[test]
    fn remove_live_takes_effect_at_next_snapshot() {
        let listeners = Listeners::new();
        let id = listeners.next_id();
        listeners.connection.add(id, Arc::new(|_| {}));
        assert_eq!(listeners.connection.snapshot().len(), 1);
        assert!(listeners.connection.remove(id));
        // Queued twice is refused.
        assert!(!listeners.connection.remove(id));
        assert!(listeners.connection.snapshot().is_empty());
    }

    #[test]
    fn listener_can_unregister_itself_mid_dispatch() {
        let listeners = Arc::new(Listeners::new());
        let id = listeners.next_id();
        let l2 = listeners.clone();
        listeners.data.add(
            id,
            Arc::new(move |_, _, _| {
                assert!(l2.data.remove(id));
            }),
        );

        let peer = dummy_peer();
        let snap = listeners.data.snapshot();
        for (_, l) in &snap {
            l(&peer, &[1, 2, 3], false);
        }
        assert!(listeners.data.snapshot().is_empty());
    }

    #[test]
    fn ids_are_unique_across_registries() {
        let listeners = Listeners::new();
        let a = listeners.next_id();
        let b = listeners.next_id();
        let c = listeners.next_id();
        assert!(a < b && b < c);
    }

    #[test]
    fn clear_drops_live_and_pending() {
        let listeners = Listeners::new();
        let a = listeners.next_id();
        listeners.data.add(a, Arc::new(|_, _, _| {}));
        let _ = listeners.data.snapshot();
        let b = listeners.next_id();
        listeners.data.add(b, Arc::new(|_, _, _| {}));
        listeners.data.clear();
        assert!(listeners.data.snapshot().is_empty());
        assert!(!listeners.data.remove(a));
        assert!(!listeners.data.remove(b));
    }
}

//! Change notifications.
//!
//! A [`Signal`] holds a list of handlers. Subscribing returns a
//! [`Connection`]; dropping the connection unsubscribes, and dropping the
//! signal disconnects every subscriber. Handlers run on the emitting thread,
//! outside the subscriber lock, so a handler may subscribe or disconnect.

use crate::dependency::NodeId;
use crate::multiplicity::Key;
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Subscribers<T> {
    next: u64,
    entries: Vec<(u64, Handler<T>)>,
}

trait Detach: Send + Sync {
    fn detach(&self, id: u64);
    fn holds(&self, id: u64) -> bool;
}

impl<T> Detach for Mutex<Subscribers<T>> {
    fn detach(&self, id: u64) {
        self.lock().entries.retain(|(entry, _)| *entry != id);
    }

    fn holds(&self, id: u64) -> bool {
        self.lock().entries.iter().any(|(entry, _)| *entry == id)
    }
}

/// A typed notification source.
pub struct Signal<T> {
    subscribers: Arc<Mutex<Subscribers<T>>>,
}

impl<T: 'static> Signal<T> {
    /// A signal with no subscribers.
    pub fn new() -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Subscribers {
                next: 0,
                entries: Vec::new(),
            })),
        }
    }

    /// Subscribe `handler`. It stays subscribed while the returned
    /// connection lives.
    pub fn connect<F>(&self, handler: F) -> Connection
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = {
            let mut subscribers = self.subscribers.lock();
            let id = subscribers.next;
            subscribers.next += 1;
            subscribers.entries.push((id, Arc::new(handler)));
            id
        };
        let target: Weak<dyn Detach> = Arc::downgrade(&self.subscribers) as Weak<dyn Detach>;
        Connection {
            id,
            target: Some(target),
        }
    }

    /// Call every subscribed handler with `event`.
    pub fn emit(&self, event: &T) {
        let handlers: Vec<Handler<T>> = self
            .subscribers
            .lock()
            .entries
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect();
        for handler in handlers {
            handler(event);
        }
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().entries.len()
    }
}

impl<T: 'static> Default for Signal<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for Signal<T> {
    fn drop(&mut self) {
        self.subscribers.lock().entries.clear();
    }
}

impl<T> fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("subscribers", &self.subscribers.lock().entries.len())
            .finish()
    }
}

/// Subscription token. Dropping it unsubscribes.
#[must_use = "dropping a connection unsubscribes immediately"]
pub struct Connection {
    id: u64,
    target: Option<Weak<dyn Detach>>,
}

impl Connection {
    /// True while both the subscription and the signal exist.
    pub fn is_connected(&self) -> bool {
        self.target
            .as_ref()
            .and_then(Weak::upgrade)
            .is_some_and(|signal| signal.holds(self.id))
    }

    /// Unsubscribe now. Safe to call after the signal is gone.
    pub fn disconnect(&mut self) {
        if let Some(signal) = self.target.take().and_then(|weak| weak.upgrade()) {
            signal.detach(self.id);
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// An edge was added or removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DependencyEvent {
    /// Node that pulls.
    pub dependent: NodeId,
    /// Node pulled from.
    pub dependency: NodeId,
}

/// A key was added to or removed from a divergent node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyEvent {
    /// The divergent node.
    pub node: NodeId,
    /// The key.
    pub key: Key,
}

/// A borrower changed lender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BorrowEvent {
    /// The borrowing number node.
    pub borrower: NodeId,
    /// Lender before the change.
    pub previous: Option<NodeId>,
    /// Lender after the change.
    pub current: Option<NodeId>,
}

/// A settable number changed value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValueEvent {
    /// The number node.
    pub node: NodeId,
    /// New value.
    pub value: f64,
}

/// Every notification a graph emits. Events fire after the edit is complete
/// and its locks are released.
#[derive(Debug, Default)]
pub struct GraphSignals {
    /// Edge added.
    pub dependency_added: Signal<DependencyEvent>,
    /// Edge removed, including edges severed by node removal.
    pub dependency_removed: Signal<DependencyEvent>,
    /// Key added.
    pub key_added: Signal<KeyEvent>,
    /// Key removed.
    pub key_removed: Signal<KeyEvent>,
    /// Borrower attached, detached or moved.
    pub borrow_changed: Signal<BorrowEvent>,
    /// Settable value changed.
    pub value_changed: Signal<ValueEvent>,
    /// Node removed.
    pub node_removed: Signal<NodeId>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn emit_reaches_subscribers_until_dropped() {
        let signal = Signal::<u32>::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let conn = {
            let seen = seen.clone();
            signal.connect(move |v| {
                seen.fetch_add(*v as usize, Ordering::SeqCst);
            })
        };
        signal.emit(&2);
        signal.emit(&3);
        assert_eq!(seen.load(Ordering::SeqCst), 5);
        assert!(conn.is_connected());
        drop(conn);
        signal.emit(&10);
        assert_eq!(seen.load(Ordering::SeqCst), 5);
        assert_eq!(signal.subscriber_count(), 0);
    }

    #[test]
    fn dropping_signal_disconnects() {
        let signal = Signal::<()>::new();
        let mut conn = signal.connect(|_| {});
        drop(signal);
        assert!(!conn.is_connected());
        conn.disconnect();
    }

    #[test]
    fn handler_may_disconnect_others() {
        let signal = Arc::new(Signal::<()>::new());
        let victim = Arc::new(Mutex::new(Some(signal.connect(|_| {}))));
        let _killer = {
            let victim = victim.clone();
            signal.connect(move |_| {
                victim.lock().take();
            })
        };
        assert_eq!(signal.subscriber_count(), 2);
        signal.emit(&());
        assert_eq!(signal.subscriber_count(), 1);
    }
}

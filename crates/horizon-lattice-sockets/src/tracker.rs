//! Bookkeeping for connections a server has accepted.
//!
//! A [`Listener`](crate::Listener) hands accepted endpoints to its consumers
//! and forgets them. Servers that must close every open connection on
//! shutdown attach a [`ConnectionTracker`] to the accept stream.

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::bridge::{Event, Observable, SubscriptionId};
use crate::socket::{ConnectionId, RxSocket};

/// Holds accepted connections until they disconnect or are disposed.
///
/// Clones share the same set.
#[derive(Clone, Default)]
pub struct ConnectionTracker {
    connections: Arc<Mutex<Vec<RxSocket>>>,
}

impl ConnectionTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Track every endpoint `accepted` publishes from now on.
    ///
    /// The subscription holds only a weak reference; dropping every clone of
    /// the tracker stops the bookkeeping.
    pub fn track(&self, accepted: &Observable<RxSocket>) -> SubscriptionId {
        let connections: Weak<Mutex<Vec<RxSocket>>> = Arc::downgrade(&self.connections);
        accepted.subscribe(move |event| {
            if let Event::Next(socket) = event
                && let Some(connections) = connections.upgrade()
            {
                insert(&connections, socket);
            }
        })
    }

    /// Track a single endpoint.
    pub fn insert(&self, socket: RxSocket) {
        insert(&self.connections, socket);
    }

    /// Stop tracking `id` without disposing it.
    pub fn remove(&self, id: ConnectionId) -> Option<RxSocket> {
        let mut connections = self.connections.lock();
        let index = connections.iter().position(|s| s.id() == id)?;
        Some(connections.swap_remove(index))
    }

    /// Number of tracked endpoints still connected and receiving.
    pub fn len(&self) -> usize {
        let mut connections = self.connections.lock();
        prune(&mut connections);
        connections.len()
    }

    /// Whether no tracked endpoint is still connected and receiving.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the tracked endpoints.
    pub fn connections(&self) -> Vec<RxSocket> {
        self.connections.lock().clone()
    }

    /// Dispose every tracked endpoint and forget them.
    ///
    /// Returns how many were disposed.
    pub fn dispose_all(&self) -> usize {
        let drained: Vec<RxSocket> = std::mem::take(&mut *self.connections.lock());
        for socket in &drained {
            socket.dispose();
        }
        drained.len()
    }
}

impl fmt::Debug for ConnectionTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionTracker")
            .field("tracked", &self.connections.lock().len())
            .finish()
    }
}

fn insert(connections: &Mutex<Vec<RxSocket>>, socket: RxSocket) {
    let mut connections = connections.lock();
    prune(&mut connections);
    connections.push(socket);
}

/// Drop endpoints that are disconnected or whose receive stream has ended,
/// e.g. after the peer closed. They are released once their owners let go.
fn prune(connections: &mut Vec<RxSocket>) {
    connections.retain(|s| {
        s.is_connected() && !s.is_disposed() && !s.receive_observable().is_terminated()
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SocketConfig;
    use std::net::{TcpListener, TcpStream};
    use std::sync::mpsc;
    use std::time::Duration;

    fn pair() -> (RxSocket, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (RxSocket::from_connected(server, &SocketConfig::default()), client)
    }

    #[test]
    fn test_dispose_all_closes_tracked() {
        let tracker = ConnectionTracker::new();
        let (a, _ca) = pair();
        let (b, _cb) = pair();
        tracker.insert(a.clone());
        tracker.insert(b.clone());
        assert_eq!(tracker.len(), 2);

        assert_eq!(tracker.dispose_all(), 2);
        assert!(a.is_disposed());
        assert!(b.is_disposed());
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_disposed_endpoints_are_pruned() {
        let tracker = ConnectionTracker::new();
        let (a, _ca) = pair();
        let (b, _cb) = pair();
        tracker.insert(a.clone());
        tracker.insert(b.clone());

        a.dispose();
        assert_eq!(tracker.len(), 1);
        assert_eq!(tracker.connections()[0].id(), b.id());
    }

    #[test]
    fn test_peer_closed_endpoints_are_pruned() {
        let tracker = ConnectionTracker::new();
        let (tx, rx) = mpsc::channel();

        for _ in 0..5 {
            let (socket, client) = pair();
            let tx = tx.clone();
            socket.receive_observable().subscribe(move |event| {
                if event.is_terminal() {
                    let _ = tx.send(());
                }
            });
            drop(client);
            rx.recv_timeout(Duration::from_secs(5)).unwrap();

            // Half-closed: still connected, but the stream has ended.
            tracker.insert(socket);
        }

        assert_eq!(tracker.len(), 0);
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_remove_keeps_endpoint_open() {
        let tracker = ConnectionTracker::new();
        let (a, _ca) = pair();
        tracker.insert(a.clone());

        let removed = tracker.remove(a.id()).unwrap();
        assert!(removed.is_connected());
        assert!(tracker.remove(a.id()).is_none());
        assert_eq!(tracker.dispose_all(), 0);
        assert!(!a.is_disposed());
    }
}

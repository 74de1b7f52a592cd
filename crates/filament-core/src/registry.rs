use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use filament_models::Id;
use tokio::sync::mpsc;

/// Process-local handle for one authenticated gateway connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

/// Outbound frames are pre-serialized once and shared between recipients.
pub type Frame = Arc<str>;

/// Per-connection outbound queue depth. A connection that falls this far
/// behind starts dropping frames rather than stalling broadcast to others.
const OUTBOUND_BUFFER: usize = 256;

struct ConnectionEntry {
    user_id: Id,
    outbound: mpsc::Sender<Frame>,
    server_ids: HashSet<Id>,
}

/// What a removed connection was holding, so the caller can release the
/// matching broker subscriptions.
#[derive(Debug)]
pub struct RemovedConnection {
    pub user_id: Id,
    pub server_ids: Vec<Id>,
}

/// Tracks live sessions and their server subscriptions for one process.
/// All operations are local; cross-process delivery goes through the fanout
/// adapter. Operations on unknown handles are no-ops.
pub struct ConnectionRegistry {
    next_id: AtomicU64,
    connections: DashMap<ConnectionId, ConnectionEntry>,
    by_user: DashMap<Id, HashSet<ConnectionId>>,
    by_server: DashMap<Id, HashSet<ConnectionId>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            connections: DashMap::new(),
            by_user: DashMap::new(),
            by_server: DashMap::new(),
        }
    }

    /// Register an authenticated connection and hand back its outbound
    /// receiver for the socket writer task.
    pub fn register(&self, user_id: Id) -> (ConnectionId, mpsc::Receiver<Frame>) {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
        self.connections.insert(
            id,
            ConnectionEntry {
                user_id,
                outbound: tx,
                server_ids: HashSet::new(),
            },
        );
        self.by_user.entry(user_id).or_default().insert(id);
        (id, rx)
    }

    pub fn remove(&self, conn: ConnectionId) -> Option<RemovedConnection> {
        let (_, entry) = self.connections.remove(&conn)?;
        if let Some(mut set) = self.by_user.get_mut(&entry.user_id) {
            set.remove(&conn);
            if set.is_empty() {
                drop(set);
                self.by_user.remove_if(&entry.user_id, |_, s| s.is_empty());
            }
        }
        for server_id in &entry.server_ids {
            if let Some(mut set) = self.by_server.get_mut(server_id) {
                set.remove(&conn);
                if set.is_empty() {
                    drop(set);
                    self.by_server.remove_if(server_id, |_, s| s.is_empty());
                }
            }
        }
        Some(RemovedConnection {
            user_id: entry.user_id,
            server_ids: entry.server_ids.into_iter().collect(),
        })
    }

    pub fn subscribe(&self, conn: ConnectionId, server_id: Id) {
        let Some(mut entry) = self.connections.get_mut(&conn) else {
            return;
        };
        if entry.server_ids.insert(server_id) {
            self.by_server.entry(server_id).or_default().insert(conn);
        }
    }

    pub fn unsubscribe(&self, conn: ConnectionId, server_id: Id) {
        let Some(mut entry) = self.connections.get_mut(&conn) else {
            return;
        };
        if entry.server_ids.remove(&server_id) {
            drop(entry);
            if let Some(mut set) = self.by_server.get_mut(&server_id) {
                set.remove(&conn);
                if set.is_empty() {
                    drop(set);
                    self.by_server.remove_if(&server_id, |_, s| s.is_empty());
                }
            }
        }
    }

    /// Deliver a frame to every locally-held connection subscribed to the
    /// server, except connections owned by `exclude_user`. A slow or closed
    /// connection is skipped and logged, never awaited.
    pub fn broadcast_to_server(&self, server_id: Id, frame: &Frame, exclude_user: Option<Id>) {
        let targets: Vec<ConnectionId> = match self.by_server.get(&server_id) {
            Some(set) => set.iter().copied().collect(),
            None => return,
        };
        for conn in targets {
            if let Some(entry) = self.connections.get(&conn) {
                if exclude_user == Some(entry.user_id) {
                    continue;
                }
                self.push_frame(conn, &entry, frame);
            }
        }
    }

    /// Deliver a frame to every locally-held connection for one user.
    pub fn send_to_user(&self, user_id: Id, frame: &Frame) {
        let targets: Vec<ConnectionId> = match self.by_user.get(&user_id) {
            Some(set) => set.iter().copied().collect(),
            None => return,
        };
        for conn in targets {
            if let Some(entry) = self.connections.get(&conn) {
                self.push_frame(conn, &entry, frame);
            }
        }
    }

    /// Deliver a frame to exactly one connection (op acks).
    pub fn send_to_connection(&self, conn: ConnectionId, frame: &Frame) {
        if let Some(entry) = self.connections.get(&conn) {
            self.push_frame(conn, &entry, frame);
        }
    }

    fn push_frame(&self, conn: ConnectionId, entry: &ConnectionEntry, frame: &Frame) {
        if let Err(err) = entry.outbound.try_send(frame.clone()) {
            tracing::warn!(
                user_id = entry.user_id,
                connection = ?conn,
                "dropping frame for backlogged connection: {err}"
            );
        }
    }

    /// Whether the user still has live connections other than `excluding`.
    pub fn has_other_connections(&self, user_id: Id, excluding: ConnectionId) -> bool {
        self.by_user
            .get(&user_id)
            .map(|set| set.iter().any(|c| *c != excluding))
            .unwrap_or(false)
    }

    pub fn connection_count(&self, user_id: Id) -> usize {
        self.by_user.get(&user_id).map(|set| set.len()).unwrap_or(0)
    }

    pub fn has_local_subscribers(&self, server_id: Id) -> bool {
        self.by_server
            .get(&server_id)
            .map(|set| !set.is_empty())
            .unwrap_or(false)
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(text: &str) -> Frame {
        Arc::from(text)
    }

    #[tokio::test]
    async fn broadcast_excludes_user_and_skips_unsubscribed() {
        let registry = ConnectionRegistry::new();
        let (a, mut rx_a) = registry.register(1);
        let (b, mut rx_b) = registry.register(2);
        let (_c, mut rx_c) = registry.register(3);

        registry.subscribe(a, 10);
        registry.subscribe(b, 10);
        // user 3 never subscribes to server 10

        registry.broadcast_to_server(10, &frame("hello"), Some(1));

        assert!(rx_a.try_recv().is_err(), "excluded user must not receive");
        assert_eq!(&*rx_b.try_recv().unwrap(), "hello");
        assert!(rx_c.try_recv().is_err());
    }

    #[tokio::test]
    async fn unsubscribing_one_connection_keeps_others() {
        let registry = ConnectionRegistry::new();
        let (a, _rx_a) = registry.register(1);
        let (b, mut rx_b) = registry.register(1);
        registry.subscribe(a, 10);
        registry.subscribe(b, 10);

        registry.unsubscribe(a, 10);
        assert!(registry.has_local_subscribers(10));

        registry.broadcast_to_server(10, &frame("x"), None);
        assert_eq!(&*rx_b.try_recv().unwrap(), "x");
    }

    #[tokio::test]
    async fn remove_reports_held_subscriptions() {
        let registry = ConnectionRegistry::new();
        let (a, _rx) = registry.register(7);
        registry.subscribe(a, 1);
        registry.subscribe(a, 2);

        let removed = registry.remove(a).unwrap();
        assert_eq!(removed.user_id, 7);
        let mut servers = removed.server_ids;
        servers.sort_unstable();
        assert_eq!(servers, vec![1, 2]);
        assert!(!registry.has_local_subscribers(1));
        assert_eq!(registry.connection_count(7), 0);
    }

    #[tokio::test]
    async fn unknown_handles_are_noops() {
        let registry = ConnectionRegistry::new();
        let (a, _rx) = registry.register(1);
        registry.remove(a);

        // None of these may panic or create state.
        registry.subscribe(a, 10);
        registry.unsubscribe(a, 10);
        registry.send_to_connection(a, &frame("gone"));
        assert!(registry.remove(a).is_none());
        assert!(!registry.has_local_subscribers(10));
    }

    #[tokio::test]
    async fn other_connections_check() {
        let registry = ConnectionRegistry::new();
        let (a, _rx_a) = registry.register(5);
        assert!(!registry.has_other_connections(5, a));
        let (_b, _rx_b) = registry.register(5);
        assert!(registry.has_other_connections(5, a));
    }

    #[tokio::test]
    async fn backlogged_connection_does_not_block_others() {
        let registry = ConnectionRegistry::new();
        let (a, rx_a) = registry.register(1);
        let (b, mut rx_b) = registry.register(2);
        registry.subscribe(a, 10);
        registry.subscribe(b, 10);

        // Fill a's queue past capacity, then drop the receiver entirely.
        for _ in 0..OUTBOUND_BUFFER + 8 {
            registry.broadcast_to_server(10, &frame("flood"), Some(2));
        }
        drop(rx_a);

        registry.broadcast_to_server(10, &frame("after"), None);
        let mut seen_after = false;
        while let Ok(f) = rx_b.try_recv() {
            if &*f == "after" {
                seen_after = true;
            }
        }
        assert!(seen_after, "healthy connection must still receive");
    }
}

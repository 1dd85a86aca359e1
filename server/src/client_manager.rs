//! Live connection table for the hub
//!
//! This module tracks every accepted stream and what the hub needs to reach it:
//! - Connection identity, peer address and the player id bound by Join
//! - A bounded outbound queue drained by that connection's writer task
//! - A shutdown handle whose drop stops the connection's reader task
//!
//! Sends never block. A full queue means the peer is not keeping up, and a
//! closed queue means its writer already died; both are reported back so the
//! hub can reap the connection instead of stalling every other peer.

use log::{debug, info};
use shared::Message;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};

pub type ConnectionId = u64;

/// A single accepted stream
#[derive(Debug)]
pub struct Connection {
    /// Server-assigned identifier, never reused
    pub id: ConnectionId,
    /// Remote address, for logging
    pub addr: SocketAddr,
    /// Player bound to this stream by its Join, if any
    pub player_id: Option<String>,
    pub connected_at: Instant,
    outbound: mpsc::Sender<Message>,
    _shutdown: oneshot::Sender<()>,
}

impl Connection {
    pub fn new(
        id: ConnectionId,
        addr: SocketAddr,
        outbound: mpsc::Sender<Message>,
        shutdown: oneshot::Sender<()>,
    ) -> Self {
        Self {
            id,
            addr,
            player_id: None,
            connected_at: Instant::now(),
            outbound,
            _shutdown: shutdown,
        }
    }

    /// Queues a message without waiting. Returns false if the queue is full
    /// or the writer is gone.
    pub fn send(&self, message: Message) -> bool {
        match self.outbound.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("Outbound queue full for connection {}", self.id);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Writer gone for connection {}", self.id);
                false
            }
        }
    }
}

pub struct ConnectionManager {
    connections: HashMap<ConnectionId, Connection>,
    next_connection_id: ConnectionId,
    max_connections: usize,
}

impl ConnectionManager {
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: HashMap::new(),
            next_connection_id: 1,
            max_connections,
        }
    }

    /// Registers a new stream. Returns None when the server is at capacity.
    pub fn add_connection(
        &mut self,
        addr: SocketAddr,
        outbound: mpsc::Sender<Message>,
        shutdown: oneshot::Sender<()>,
    ) -> Option<ConnectionId> {
        if self.connections.len() >= self.max_connections {
            return None;
        }

        let id = self.next_connection_id;
        self.next_connection_id += 1;

        info!("Connection {} opened from {}", id, addr);
        self.connections
            .insert(id, Connection::new(id, addr, outbound, shutdown));
        Some(id)
    }

    /// Drops the connection, which closes its queue and stops its reader.
    pub fn remove_connection(&mut self, id: ConnectionId) -> Option<Connection> {
        let removed = self.connections.remove(&id);
        if let Some(conn) = &removed {
            info!(
                "Connection {} from {} closed after {:?}",
                conn.id,
                conn.addr,
                conn.connected_at.elapsed()
            );
        }
        removed
    }

    /// Binds a player to a connection.
    ///
    /// If another connection was bound to the same player it is unbound and
    /// its id returned, so the caller can close it.
    pub fn bind_player(&mut self, id: ConnectionId, player_id: &str) -> Option<ConnectionId> {
        let previous = self
            .connections
            .values_mut()
            .find(|conn| conn.id != id && conn.player_id.as_deref() == Some(player_id))
            .map(|conn| {
                conn.player_id = None;
                conn.id
            });

        if let Some(conn) = self.connections.get_mut(&id) {
            conn.player_id = Some(player_id.to_string());
        }
        previous
    }

    pub fn player_of(&self, id: ConnectionId) -> Option<String> {
        self.connections.get(&id).and_then(|conn| conn.player_id.clone())
    }

    pub fn find_by_player(&self, player_id: &str) -> Option<ConnectionId> {
        self.connections
            .values()
            .find(|conn| conn.player_id.as_deref() == Some(player_id))
            .map(|conn| conn.id)
    }

    /// Unicast. False if the connection is unknown or could not take it.
    pub fn send_to(&self, id: ConnectionId, message: Message) -> bool {
        match self.connections.get(&id) {
            Some(conn) => conn.send(message),
            None => false,
        }
    }

    /// Queues `message` for every connection except `exclude`.
    ///
    /// Returns the connections that could not take it. A failure on one
    /// peer never stops delivery to the rest.
    pub fn broadcast(&self, message: &Message, exclude: Option<ConnectionId>) -> Vec<ConnectionId> {
        self.connections
            .values()
            .filter(|conn| Some(conn.id) != exclude)
            .filter(|conn| !conn.send(message.clone()))
            .map(|conn| conn.id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::MessageKind;

    fn test_addr() -> SocketAddr {
        "127.0.0.1:8080".parse().unwrap()
    }

    struct Peer {
        id: ConnectionId,
        rx: mpsc::Receiver<Message>,
        shutdown: oneshot::Receiver<()>,
    }

    fn connect(manager: &mut ConnectionManager, capacity: usize) -> Option<Peer> {
        let (tx, rx) = mpsc::channel(capacity);
        let (shutdown_tx, shutdown) = oneshot::channel();
        manager
            .add_connection(test_addr(), tx, shutdown_tx)
            .map(|id| Peer { id, rx, shutdown })
    }

    #[test]
    fn test_connection_ids_are_sequential() {
        let mut manager = ConnectionManager::new(4);
        let a = connect(&mut manager, 8).unwrap();
        let b = connect(&mut manager, 8).unwrap();
        assert_eq!(a.id, 1);
        assert_eq!(b.id, 2);
        assert_eq!(manager.len(), 2);
    }

    #[test]
    fn test_capacity_is_enforced() {
        let mut manager = ConnectionManager::new(1);
        assert!(connect(&mut manager, 8).is_some());
        assert!(connect(&mut manager, 8).is_none());
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_remove_signals_shutdown() {
        let mut manager = ConnectionManager::new(2);
        let mut peer = connect(&mut manager, 8).unwrap();

        assert!(peer.shutdown.try_recv().is_err());
        assert!(manager.remove_connection(peer.id).is_some());
        assert!(matches!(
            peer.shutdown.try_recv(),
            Err(oneshot::error::TryRecvError::Closed)
        ));
        assert!(manager.remove_connection(peer.id).is_none());
        assert!(manager.is_empty());
    }

    #[test]
    fn test_bind_player_moves_binding() {
        let mut manager = ConnectionManager::new(4);
        let a = connect(&mut manager, 8).unwrap();
        let b = connect(&mut manager, 8).unwrap();

        assert_eq!(manager.bind_player(a.id, "alice"), None);
        assert_eq!(manager.find_by_player("alice"), Some(a.id));

        assert_eq!(manager.bind_player(b.id, "alice"), Some(a.id));
        assert_eq!(manager.find_by_player("alice"), Some(b.id));
        assert_eq!(manager.player_of(a.id), None);
        assert_eq!(manager.player_of(b.id).as_deref(), Some("alice"));
    }

    #[test]
    fn test_broadcast_skips_excluded() {
        let mut manager = ConnectionManager::new(4);
        let mut a = connect(&mut manager, 8).unwrap();
        let mut b = connect(&mut manager, 8).unwrap();

        let failed = manager.broadcast(&Message::leave("x"), Some(a.id));
        assert!(failed.is_empty());
        assert!(a.rx.try_recv().is_err());
        assert_eq!(b.rx.try_recv().unwrap().kind, MessageKind::Leave);
    }

    #[test]
    fn test_full_queue_is_reported_without_stopping_broadcast() {
        let mut manager = ConnectionManager::new(4);
        let slow = connect(&mut manager, 1).unwrap();
        let mut fast = connect(&mut manager, 8).unwrap();

        assert!(manager.broadcast(&Message::leave("x"), None).is_empty());
        let failed = manager.broadcast(&Message::leave("y"), None);

        assert_eq!(failed, vec![slow.id]);
        assert_eq!(fast.rx.try_recv().unwrap().player_id, "x");
        assert_eq!(fast.rx.try_recv().unwrap().player_id, "y");
    }

    #[test]
    fn test_closed_queue_is_reported() {
        let mut manager = ConnectionManager::new(4);
        let peer = connect(&mut manager, 8).unwrap();
        let id = peer.id;
        drop(peer);

        assert!(!manager.send_to(id, Message::leave("x")));
        assert_eq!(manager.broadcast(&Message::leave("x"), None), vec![id]);
    }

    #[test]
    fn test_send_to_unknown_connection() {
        let manager = ConnectionManager::new(4);
        assert!(!manager.send_to(42, Message::leave("x")));
    }
}

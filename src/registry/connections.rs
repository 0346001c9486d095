use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use crate::server::messages::ServerMessage;
use crate::types::ConnectionId;

/// One live client connection. The outbound sender feeds the session task
/// that owns the actual socket; dropping it ends that session.
pub struct Connection {
    pub id: ConnectionId,
    pub ip: String,
    pub user_id: Option<String>,
    pub role: Option<String>,
    pub subscriptions: HashSet<String>,
    pub last_seen: Instant,
    outbound: mpsc::Sender<ServerMessage>,
}

/// Registry of live connections, keyed by id. Rooms reference connections by
/// id only — removal here never leaves a dangling handle elsewhere.
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Connection>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            connections: DashMap::new(),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn register(&self, ip: &str, outbound: mpsc::Sender<ServerMessage>) -> ConnectionId {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.connections.insert(
            id,
            Connection {
                id,
                ip: ip.to_string(),
                user_id: None,
                role: None,
                subscriptions: HashSet::new(),
                last_seen: Instant::now(),
                outbound,
            },
        );
        id
    }

    /// Idempotent: safe to call from both the disconnect path and the sweep.
    pub fn unregister(&self, id: ConnectionId) -> Option<Connection> {
        let removed = self.connections.remove(&id).map(|(_, conn)| conn);
        if let Some(conn) = &removed {
            debug!(
                conn_id = %id,
                role = conn.role.as_deref().unwrap_or("-"),
                subscriptions = conn.subscriptions.len(),
                "connection unregistered"
            );
        }
        removed
    }

    pub fn touch(&self, id: ConnectionId) {
        if let Some(mut conn) = self.connections.get_mut(&id) {
            conn.last_seen = Instant::now();
        }
    }

    pub fn authenticate(&self, id: ConnectionId, user_id: &str, role: &str) {
        if let Some(mut conn) = self.connections.get_mut(&id) {
            conn.user_id = Some(user_id.to_string());
            conn.role = Some(role.to_string());
        }
    }

    pub fn authenticated_user(&self, id: ConnectionId) -> Option<String> {
        self.connections.get(&id).and_then(|c| c.user_id.clone())
    }

    pub fn ip_of(&self, id: ConnectionId) -> Option<String> {
        self.connections.get(&id).map(|c| c.ip.clone())
    }

    pub fn subscribe(&self, id: ConnectionId, auction_id: &str) {
        if let Some(mut conn) = self.connections.get_mut(&id) {
            conn.subscriptions.insert(auction_id.to_string());
        }
    }

    pub fn unsubscribe(&self, id: ConnectionId, auction_id: &str) {
        if let Some(mut conn) = self.connections.get_mut(&id) {
            conn.subscriptions.remove(auction_id);
        }
    }

    /// Queues a message for delivery. Returns false when the connection is
    /// gone or its session has shut down; a full queue drops the message but
    /// keeps the connection.
    pub fn send(&self, id: ConnectionId, msg: ServerMessage) -> bool {
        let Some(conn) = self.connections.get(&id) else {
            return false;
        };
        match conn.outbound.try_send(msg) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(conn_id = %id, "outbound queue full, dropping message");
                true
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Returns connections silent for longer than `timeout`, unregistering
    /// them. Room cleanup is the caller's responsibility.
    pub fn sweep_stale(&self, timeout: Duration) -> Vec<ConnectionId> {
        let stale: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|entry| entry.value().last_seen.elapsed() > timeout)
            .map(|entry| entry.value().id)
            .collect();
        for id in &stale {
            self.connections.remove(id);
        }
        stale
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }
}

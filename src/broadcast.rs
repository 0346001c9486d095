use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::registry::connections::ConnectionRegistry;
use crate::registry::rooms::RoomRegistry;
use crate::server::messages::ServerMessage;
use crate::types::ConnectionId;

/// Delivers events to every connection in an auction's room. Events are
/// published from the coordinator's serialized commit path, so per-auction
/// fan-out order equals commit order; each connection's outbound queue then
/// preserves that order to the socket.
pub struct Broadcaster {
    connections: Arc<ConnectionRegistry>,
    rooms: Arc<RoomRegistry>,
    delivered: AtomicU64,
    failed: AtomicU64,
}

impl Broadcaster {
    pub fn new(connections: Arc<ConnectionRegistry>, rooms: Arc<RoomRegistry>) -> Arc<Self> {
        Arc::new(Self {
            connections,
            rooms,
            delivered: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        })
    }

    pub fn publish(&self, auction_id: &str, msg: &ServerMessage) {
        for conn_id in self.rooms.members(auction_id) {
            self.deliver(conn_id, msg);
        }
    }

    /// Direct send to one connection, without cleanup on failure.
    pub fn send_to(&self, conn_id: ConnectionId, msg: &ServerMessage) -> bool {
        self.connections.send(conn_id, msg.clone())
    }

    fn deliver(&self, conn_id: ConnectionId, msg: &ServerMessage) {
        if self.connections.send(conn_id, msg.clone()) {
            self.delivered.fetch_add(1, Ordering::Relaxed);
        } else {
            // Dead transport: silently clean up this connection only, never
            // blocking delivery to the rest of the room.
            self.failed.fetch_add(1, Ordering::Relaxed);
            self.drop_connection(conn_id);
        }
    }

    /// Full disconnect cleanup: unregister, drop from every room, and tell
    /// remaining members. Idempotent; safe from the session exit path, the
    /// heartbeat sweep, and mid-broadcast send failures.
    pub fn drop_connection(&self, conn_id: ConnectionId) {
        self.connections.unregister(conn_id);
        let affected = self.rooms.remove_connection(conn_id);
        if !affected.is_empty() {
            debug!(conn_id = %conn_id, rooms = affected.len(), "connection dropped from rooms");
        }
        for (auction_id, viewer_count) in affected {
            let msg = ServerMessage::ViewerLeft {
                auction_id: auction_id.clone(),
                viewer_count,
            };
            self.publish(&auction_id, &msg);
        }
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::rooms::RoomRole;
    use tokio::sync::mpsc;

    fn setup() -> (Arc<ConnectionRegistry>, Arc<RoomRegistry>, Arc<Broadcaster>) {
        let connections = ConnectionRegistry::new();
        let rooms = RoomRegistry::new();
        let broadcaster = Broadcaster::new(Arc::clone(&connections), Arc::clone(&rooms));
        (connections, rooms, broadcaster)
    }

    fn join_viewer(
        connections: &ConnectionRegistry,
        rooms: &RoomRegistry,
        auction_id: &str,
    ) -> (ConnectionId, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(16);
        let id = connections.register("127.0.0.1", tx);
        rooms.join(auction_id, id, RoomRole::Viewer);
        (id, rx)
    }

    fn probe(auction_id: &str) -> ServerMessage {
        ServerMessage::AuctionError { message: format!("probe {auction_id}") }
    }

    #[tokio::test]
    async fn publish_reaches_every_room_member() {
        let (connections, rooms, broadcaster) = setup();
        let (_a, mut rx_a) = join_viewer(&connections, &rooms, "a1");
        let (_b, mut rx_b) = join_viewer(&connections, &rooms, "a1");
        let (_c, mut rx_c) = join_viewer(&connections, &rooms, "other");

        broadcaster.publish("a1", &probe("a1"));

        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_ok());
        assert!(rx_c.try_recv().is_err(), "other rooms must not receive the event");
        assert_eq!(broadcaster.delivered(), 2);
    }

    #[tokio::test]
    async fn failed_delivery_evicts_only_that_connection() {
        let (connections, rooms, broadcaster) = setup();
        let (dead, rx_dead) = join_viewer(&connections, &rooms, "a1");
        let (_live, mut rx_live) = join_viewer(&connections, &rooms, "a1");
        drop(rx_dead);

        broadcaster.publish("a1", &probe("a1"));

        assert_eq!(connections.len(), 1, "dead connection unregistered");
        assert!(rooms.members("a1").iter().all(|c| *c != dead));
        // The live member saw the probe and then the viewer_left cleanup event.
        assert!(matches!(rx_live.try_recv(), Ok(ServerMessage::AuctionError { .. })));
        assert!(matches!(
            rx_live.try_recv(),
            Ok(ServerMessage::ViewerLeft { viewer_count: 1, .. })
        ));
    }

    #[tokio::test]
    async fn sole_viewer_disconnect_deletes_room_without_broadcast() {
        let (connections, rooms, broadcaster) = setup();
        let (id, mut rx) = join_viewer(&connections, &rooms, "a1");

        broadcaster.drop_connection(id);

        assert_eq!(rooms.room_count(), 0, "room must be deleted with its last viewer");
        assert_eq!(connections.len(), 0);
        assert!(rx.try_recv().is_err(), "no broadcast toward the departed connection");

        // Idempotent from a second cleanup path (e.g. sweep after disconnect).
        broadcaster.drop_connection(id);
        assert_eq!(rooms.room_count(), 0);
    }

    #[tokio::test]
    async fn disconnect_notifies_remaining_members_per_room() {
        let (connections, rooms, broadcaster) = setup();
        let (leaver, _rx_leaver) = join_viewer(&connections, &rooms, "a1");
        rooms.join("a2", leaver, RoomRole::Viewer);
        let (_stay_a, mut rx_a) = join_viewer(&connections, &rooms, "a1");
        let (_stay_b, mut rx_b) = join_viewer(&connections, &rooms, "a2");

        broadcaster.drop_connection(leaver);

        for rx in [&mut rx_a, &mut rx_b] {
            match rx.try_recv() {
                Ok(ServerMessage::ViewerLeft { viewer_count, .. }) => assert_eq!(viewer_count, 1),
                other => panic!("expected ViewerLeft, got {other:?}"),
            }
        }
    }
}

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::types::ConnectionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomRole {
    Viewer,
    Bidder,
}

/// Per-auction membership. Rooms are viewer-scoped: a room with bidders but
/// no viewers is torn down.
struct AuctionRoom {
    viewers: HashSet<ConnectionId>,
    bidders: HashSet<ConnectionId>,
    last_activity: DateTime<Utc>,
}

impl AuctionRoom {
    fn new() -> Self {
        Self {
            viewers: HashSet::new(),
            bidders: HashSet::new(),
            last_activity: Utc::now(),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct LeaveOutcome {
    pub was_member: bool,
    /// Viewers remaining after the leave.
    pub viewer_count: usize,
    pub room_deleted: bool,
}

/// Registry of auction rooms, created lazily on first join. Connections are
/// referenced by id only; ownership stays with the connection registry.
pub struct RoomRegistry {
    rooms: DashMap<String, AuctionRoom>,
}

impl RoomRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { rooms: DashMap::new() })
    }

    /// Callers must have validated auction existence against persistence.
    pub fn join(&self, auction_id: &str, conn: ConnectionId, role: RoomRole) {
        let mut room = self
            .rooms
            .entry(auction_id.to_string())
            .or_insert_with(AuctionRoom::new);
        match role {
            RoomRole::Viewer => room.viewers.insert(conn),
            RoomRole::Bidder => room.bidders.insert(conn),
        };
        room.last_activity = Utc::now();
    }

    pub fn leave(&self, auction_id: &str, conn: ConnectionId) -> LeaveOutcome {
        let Some(mut room) = self.rooms.get_mut(auction_id) else {
            return LeaveOutcome { was_member: false, viewer_count: 0, room_deleted: false };
        };
        let was_viewer = room.viewers.remove(&conn);
        let was_bidder = room.bidders.remove(&conn);
        let was_member = was_viewer || was_bidder;
        room.last_activity = Utc::now();
        let viewer_count = room.viewers.len();
        let empty = room.viewers.is_empty();
        drop(room);

        let mut room_deleted = false;
        if was_member && empty {
            self.rooms.remove(auction_id);
            room_deleted = true;
        }
        LeaveOutcome { was_member, viewer_count, room_deleted }
    }

    /// Every connection in the room, viewers and bidders, deduplicated.
    pub fn members(&self, auction_id: &str) -> Vec<ConnectionId> {
        let Some(room) = self.rooms.get(auction_id) else {
            return Vec::new();
        };
        let mut all: HashSet<ConnectionId> = room.viewers.clone();
        all.extend(room.bidders.iter().copied());
        all.into_iter().collect()
    }

    pub fn viewer_count(&self, auction_id: &str) -> usize {
        self.rooms.get(auction_id).map(|r| r.viewers.len()).unwrap_or(0)
    }

    pub fn is_empty(&self, auction_id: &str) -> bool {
        self.rooms
            .get(auction_id)
            .map(|r| r.viewers.is_empty() && r.bidders.is_empty())
            .unwrap_or(true)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Drops the connection from every room it appears in. Returns the rooms
    /// that still have members afterwards, with their remaining viewer
    /// counts, so the caller can notify them.
    pub fn remove_connection(&self, conn: ConnectionId) -> Vec<(String, usize)> {
        let touched: Vec<String> = self
            .rooms
            .iter()
            .filter(|entry| {
                entry.value().viewers.contains(&conn) || entry.value().bidders.contains(&conn)
            })
            .map(|entry| entry.key().clone())
            .collect();

        let mut remaining = Vec::new();
        for auction_id in touched {
            let outcome = self.leave(&auction_id, conn);
            if outcome.was_member && !outcome.room_deleted {
                remaining.push((auction_id, outcome.viewer_count));
            }
        }
        remaining
    }
}

//! Per-connection session: one task owning the socket, fed by the
//! connection's outbound queue on one side and client frames on the other.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::{Message, WebSocket};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::config::OUTBOUND_CHANNEL_CAPACITY;
use crate::registry::rooms::RoomRole;
use crate::server::messages::{ClientMessage, ServerMessage};
use crate::server::Engine;
use crate::types::{BidRequest, ConnectionId};

pub async fn handle_socket(socket: WebSocket, peer: SocketAddr, engine: Arc<Engine>) {
    let (outbound_tx, mut outbound_rx) = mpsc::channel(OUTBOUND_CHANNEL_CAPACITY);
    let ip = peer.ip().to_string();
    let conn_id = engine.connections.register(&ip, outbound_tx);
    info!(conn_id = %conn_id, %peer, "connection established");

    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            frame = stream.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        engine.connections.touch(conn_id);
                        dispatch(&engine, conn_id, &text).await;
                    }
                    // Protocol pings are answered by the transport; they
                    // still count as liveness.
                    Some(Ok(Message::Ping(_)) | Ok(Message::Pong(_))) => {
                        engine.connections.touch(conn_id);
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!(conn_id = %conn_id, "socket read error: {e}");
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }

            queued = outbound_rx.recv() => {
                match queued {
                    Some(msg) => {
                        let Ok(text) = serde_json::to_string(&msg) else { continue };
                        if sink.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    // Registry dropped us (sweep eviction); the socket is done.
                    None => break,
                }
            }
        }
    }

    info!(conn_id = %conn_id, "connection closed");
    engine.broadcaster.drop_connection(conn_id);
}

pub(crate) async fn dispatch(engine: &Engine, conn_id: ConnectionId, text: &str) {
    let msg = match serde_json::from_str::<ClientMessage>(text) {
        Ok(msg) => msg,
        Err(e) => {
            debug!(conn_id = %conn_id, "unparseable client frame: {e}");
            engine.broadcaster.send_to(
                conn_id,
                &ServerMessage::AuctionError { message: "unrecognized message".to_string() },
            );
            return;
        }
    };

    match msg {
        ClientMessage::Authenticate { user_id, token } => {
            authenticate(engine, conn_id, user_id, token).await;
        }
        ClientMessage::JoinAuction { auction_id } => {
            join_auction(engine, conn_id, auction_id).await;
        }
        ClientMessage::LeaveAuction { auction_id } => {
            leave_auction(engine, conn_id, &auction_id, None);
        }
        ClientMessage::PlaceBid { auction_id, bid_amount, user_id } => {
            place_bid(engine, conn_id, auction_id, bid_amount, user_id).await;
        }
        ClientMessage::WatchAuction { auction_id, .. } => {
            watch_auction(engine, conn_id, auction_id).await;
        }
        ClientMessage::UnwatchAuction { auction_id, .. } => {
            let ack = ServerMessage::UnwatchAck { auction_id: auction_id.clone() };
            leave_auction(engine, conn_id, &auction_id, Some(ack));
        }
        ClientMessage::GetAuctionStatus { auction_id } => {
            match engine.coordinator.status_for(&auction_id).await {
                Ok(status) => {
                    engine.broadcaster.send_to(conn_id, &status);
                }
                Err(rejection) => {
                    engine.broadcaster.send_to(
                        conn_id,
                        &ServerMessage::AuctionError { message: rejection.to_string() },
                    );
                }
            }
        }
        ClientMessage::Heartbeat => {
            engine
                .broadcaster
                .send_to(conn_id, &ServerMessage::Heartbeat { server_time: Utc::now() });
        }
    }
}

/// Token validation is an upstream collaborator; the engine only records the
/// asserted identity after a shape check, and resolves display role via the
/// user store when present.
async fn authenticate(engine: &Engine, conn_id: ConnectionId, user_id: String, token: String) {
    if user_id.is_empty() || token.is_empty() {
        engine.broadcaster.send_to(
            conn_id,
            &ServerMessage::AuthenticationError { message: "missing credentials".to_string() },
        );
        return;
    }

    // Known users keep their stored canonical identity and role; unknown
    // ones default to plain bidders.
    let (user_id, role) = match engine.store.user_profile(&user_id).await {
        Ok(Some(profile)) => (profile.user_id, profile.role),
        Ok(None) => (user_id, "bidder".to_string()),
        Err(e) => {
            debug!(conn_id = %conn_id, "profile lookup failed: {e}");
            engine.broadcaster.send_to(
                conn_id,
                &ServerMessage::AuthenticationError {
                    message: "authentication unavailable".to_string(),
                },
            );
            return;
        }
    };

    engine.connections.authenticate(conn_id, &user_id, &role);
    engine
        .broadcaster
        .send_to(conn_id, &ServerMessage::AuthenticationSuccess { user_id, role });
}

async fn join_auction(engine: &Engine, conn_id: ConnectionId, auction_id: String) {
    match engine
        .coordinator
        .join_with_snapshot(&auction_id, conn_id, RoomRole::Viewer)
        .await
    {
        Ok(()) => {
            engine.connections.subscribe(conn_id, &auction_id);
        }
        Err(rejection) => {
            engine.broadcaster.send_to(
                conn_id,
                &ServerMessage::AuctionError { message: rejection.to_string() },
            );
        }
    }
}

/// Shared by leave_auction and unwatch_auction; `ack` goes to the departing
/// connection, viewer_left goes to whoever remains.
fn leave_auction(
    engine: &Engine,
    conn_id: ConnectionId,
    auction_id: &str,
    ack: Option<ServerMessage>,
) {
    let outcome = engine.rooms.leave(auction_id, conn_id);
    engine.connections.unsubscribe(conn_id, auction_id);

    if let Some(ack) = ack {
        engine.broadcaster.send_to(conn_id, &ack);
    }
    if outcome.was_member && !outcome.room_deleted {
        engine.broadcaster.publish(
            auction_id,
            &ServerMessage::ViewerLeft {
                auction_id: auction_id.to_string(),
                viewer_count: outcome.viewer_count,
            },
        );
    }
}

async fn place_bid(
    engine: &Engine,
    conn_id: ConnectionId,
    auction_id: String,
    bid_amount: i64,
    payload_user: Option<String>,
) {
    // Authenticated identity wins over whatever the payload asserts.
    let bidder_id = engine
        .connections
        .authenticated_user(conn_id)
        .or(payload_user);
    let Some(bidder_id) = bidder_id else {
        engine.broadcaster.send_to(
            conn_id,
            &ServerMessage::BidError {
                message: "authenticate before bidding".to_string(),
                minimum_bid: None,
            },
        );
        return;
    };
    let ip = engine.connections.ip_of(conn_id).unwrap_or_default();

    let request = BidRequest {
        auction_id: auction_id.clone(),
        bidder_id,
        amount: bid_amount,
        connection_id: conn_id,
        ip,
    };

    let started = Instant::now();
    let result = engine.coordinator.submit_bid(request).await;
    engine.latency.record(started.elapsed());

    match result {
        Ok(receipt) => {
            engine.rooms.join(&auction_id, conn_id, RoomRole::Bidder);
            engine.connections.subscribe(conn_id, &auction_id);
            engine.broadcaster.send_to(
                conn_id,
                &ServerMessage::BidSuccess {
                    auction_id,
                    amount: receipt.bid.amount,
                    sequence: receipt.bid.sequence,
                },
            );
        }
        Err(rejection) => {
            engine.broadcaster.send_to(
                conn_id,
                &ServerMessage::BidError {
                    message: rejection.to_string(),
                    minimum_bid: rejection.minimum_bid(),
                },
            );
        }
    }
}

async fn watch_auction(engine: &Engine, conn_id: ConnectionId, auction_id: String) {
    match engine.store.auction_state(&auction_id).await {
        Ok(Some(_)) => {
            engine.rooms.join(&auction_id, conn_id, RoomRole::Viewer);
            engine.connections.subscribe(conn_id, &auction_id);
            engine.broadcaster.send_to(
                conn_id,
                &ServerMessage::WatchAck {
                    auction_id: auction_id.clone(),
                    watchers: engine.rooms.viewer_count(&auction_id),
                },
            );
        }
        Ok(None) => {
            engine.broadcaster.send_to(
                conn_id,
                &ServerMessage::AuctionError { message: "auction not found".to_string() },
            );
        }
        Err(e) => {
            debug!(conn_id = %conn_id, "watch lookup failed: {e}");
            engine.broadcaster.send_to(
                conn_id,
                &ServerMessage::AuctionError { message: "auction lookup failed".to_string() },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::latency::LatencyStats;
    use crate::bidding::BidCoordinator;
    use crate::broadcast::Broadcaster;
    use crate::fraud::flags::FlaggedStore;
    use crate::fraud::RiskEngine;
    use crate::registry::connections::ConnectionRegistry;
    use crate::registry::rooms::RoomRegistry;
    use crate::store::memory::MemoryStore;
    use crate::store::AuctionStore;
    use crate::types::{AuctionState, AuctionStatus, UserProfile};
    use chrono::Duration;

    fn test_engine() -> (Arc<Engine>, Arc<MemoryStore>) {
        let store = MemoryStore::new();
        let flags = FlaggedStore::new();
        let connections = ConnectionRegistry::new();
        let rooms = RoomRegistry::new();
        let broadcaster = Broadcaster::new(Arc::clone(&connections), Arc::clone(&rooms));
        let risk = RiskEngine::new(store.clone() as Arc<dyn AuctionStore>, Arc::clone(&flags));
        let coordinator = BidCoordinator::new(
            store.clone() as Arc<dyn AuctionStore>,
            risk,
            Arc::clone(&rooms),
            Arc::clone(&broadcaster),
        );
        let engine = Arc::new(Engine {
            store: store.clone() as Arc<dyn AuctionStore>,
            connections,
            rooms,
            broadcaster,
            coordinator,
            flags,
            latency: Arc::new(LatencyStats::new()),
        });
        (engine, store)
    }

    fn active_auction(id: &str) -> AuctionState {
        AuctionState {
            id: id.to_string(),
            current_bid: 100,
            min_increment: 10,
            end_time: Utc::now() + Duration::hours(1),
            total_bids: 0,
            unique_bidders: 0,
            status: AuctionStatus::Active,
            auto_extend: true,
            extensions: 0,
        }
    }

    fn connect(engine: &Engine) -> (ConnectionId, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(32);
        let id = engine.connections.register("127.0.0.1", tx);
        (id, rx)
    }

    #[tokio::test]
    async fn join_delivers_status_snapshot_first() {
        let (engine, store) = test_engine();
        store.insert_auction(active_auction("a1"));
        let (conn, mut rx) = connect(&engine);

        dispatch(&engine, conn, r#"{"type":"join_auction","auction_id":"a1"}"#).await;

        match rx.try_recv().unwrap() {
            ServerMessage::AuctionStatus { auction_id, minimum_next_bid, .. } => {
                assert_eq!(auction_id, "a1");
                assert_eq!(minimum_next_bid, 110);
            }
            other => panic!("expected AuctionStatus baseline, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn join_of_unknown_auction_fails() {
        let (engine, _store) = test_engine();
        let (conn, mut rx) = connect(&engine);

        dispatch(&engine, conn, r#"{"type":"join_auction","auction_id":"nope"}"#).await;

        match rx.try_recv().unwrap() {
            ServerMessage::AuctionError { message } => assert_eq!(message, "auction not found"),
            other => panic!("expected AuctionError, got {other:?}"),
        }
        assert!(engine.rooms.is_empty("nope"));
    }

    #[tokio::test]
    async fn bid_reaches_viewers_and_acks_the_bidder() {
        let (engine, store) = test_engine();
        store.insert_auction(active_auction("a1"));
        store.insert_user(UserProfile {
            user_id: "alice".to_string(),
            display_name: "Alice".to_string(),
            role: "bidder".to_string(),
        });

        let (viewer, mut viewer_rx) = connect(&engine);
        dispatch(&engine, viewer, r#"{"type":"join_auction","auction_id":"a1"}"#).await;
        let _ = viewer_rx.try_recv(); // baseline snapshot

        let (bidder, mut bidder_rx) = connect(&engine);
        dispatch(&engine, bidder, r#"{"type":"authenticate","user_id":"alice","token":"t"}"#).await;
        assert!(matches!(
            bidder_rx.try_recv().unwrap(),
            ServerMessage::AuthenticationSuccess { .. }
        ));

        dispatch(&engine, bidder, r#"{"type":"place_bid","auction_id":"a1","bid_amount":110}"#).await;

        match bidder_rx.try_recv().unwrap() {
            ServerMessage::BidSuccess { amount, sequence, .. } => {
                assert_eq!(amount, 110);
                assert_eq!(sequence, 1);
            }
            other => panic!("expected BidSuccess, got {other:?}"),
        }
        match viewer_rx.try_recv().unwrap() {
            ServerMessage::NewBid { amount, bidder, .. } => {
                assert_eq!(amount, 110);
                assert_eq!(bidder, "Alice", "broadcast carries the display identity");
            }
            other => panic!("expected NewBid, got {other:?}"),
        }
        assert!(engine.latency.len() > 0, "bid path is instrumented");
    }

    #[tokio::test]
    async fn low_bid_returns_required_minimum() {
        let (engine, store) = test_engine();
        store.insert_auction(active_auction("a1"));
        let (conn, mut rx) = connect(&engine);

        dispatch(
            &engine,
            conn,
            r#"{"type":"place_bid","auction_id":"a1","bid_amount":105,"user_id":"bob"}"#,
        )
        .await;

        match rx.try_recv().unwrap() {
            ServerMessage::BidError { minimum_bid, .. } => assert_eq!(minimum_bid, Some(110)),
            other => panic!("expected BidError, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unauthenticated_bid_without_user_id_is_refused() {
        let (engine, store) = test_engine();
        store.insert_auction(active_auction("a1"));
        let (conn, mut rx) = connect(&engine);

        dispatch(&engine, conn, r#"{"type":"place_bid","auction_id":"a1","bid_amount":110}"#).await;

        match rx.try_recv().unwrap() {
            ServerMessage::BidError { message, minimum_bid } => {
                assert_eq!(message, "authenticate before bidding");
                assert_eq!(minimum_bid, None);
            }
            other => panic!("expected BidError, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn leave_notifies_remaining_viewers_only() {
        let (engine, store) = test_engine();
        store.insert_auction(active_auction("a1"));

        let (leaver, mut leaver_rx) = connect(&engine);
        let (stayer, mut stayer_rx) = connect(&engine);
        dispatch(&engine, leaver, r#"{"type":"join_auction","auction_id":"a1"}"#).await;
        dispatch(&engine, stayer, r#"{"type":"join_auction","auction_id":"a1"}"#).await;
        let _ = leaver_rx.try_recv();
        let _ = stayer_rx.try_recv();

        dispatch(&engine, leaver, r#"{"type":"leave_auction","auction_id":"a1"}"#).await;

        match stayer_rx.try_recv().unwrap() {
            ServerMessage::ViewerLeft { viewer_count, .. } => assert_eq!(viewer_count, 1),
            other => panic!("expected ViewerLeft, got {other:?}"),
        }
        assert!(leaver_rx.try_recv().is_err(), "the departing viewer gets nothing");
    }

    #[tokio::test]
    async fn heartbeat_gets_server_time_reply() {
        let (engine, _store) = test_engine();
        let (conn, mut rx) = connect(&engine);

        dispatch(&engine, conn, r#"{"type":"heartbeat"}"#).await;
        assert!(matches!(rx.try_recv().unwrap(), ServerMessage::Heartbeat { .. }));
    }

    #[tokio::test]
    async fn watch_and_unwatch_round_trip() {
        let (engine, store) = test_engine();
        store.insert_auction(active_auction("a1"));
        let (conn, mut rx) = connect(&engine);

        dispatch(&engine, conn, r#"{"type":"watch_auction","auction_id":"a1","user_id":"u"}"#).await;
        match rx.try_recv().unwrap() {
            ServerMessage::WatchAck { watchers, .. } => assert_eq!(watchers, 1),
            other => panic!("expected WatchAck, got {other:?}"),
        }

        dispatch(&engine, conn, r#"{"type":"unwatch_auction","auction_id":"a1"}"#).await;
        assert!(matches!(rx.try_recv().unwrap(), ServerMessage::UnwatchAck { .. }));
        assert!(engine.rooms.is_empty("a1"));
    }

    #[tokio::test]
    async fn garbage_frame_gets_a_soft_error() {
        let (engine, _store) = test_engine();
        let (conn, mut rx) = connect(&engine);

        dispatch(&engine, conn, "{}").await;
        assert!(matches!(rx.try_recv().unwrap(), ServerMessage::AuctionError { .. }));
    }
}

pub mod messages;
pub mod session;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::connect_info::ConnectInfo;
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;

use crate::api::latency::LatencyStats;
use crate::api::routes;
use crate::bidding::BidCoordinator;
use crate::broadcast::Broadcaster;
use crate::fraud::flags::FlaggedStore;
use crate::registry::connections::ConnectionRegistry;
use crate::registry::rooms::RoomRegistry;
use crate::store::AuctionStore;

/// Shared handles for everything a request or session can touch.
pub struct Engine {
    pub store: Arc<dyn AuctionStore>,
    pub connections: Arc<ConnectionRegistry>,
    pub rooms: Arc<RoomRegistry>,
    pub broadcaster: Arc<Broadcaster>,
    pub coordinator: Arc<BidCoordinator>,
    pub flags: Arc<FlaggedStore>,
    pub latency: Arc<LatencyStats>,
}

pub fn router(engine: Arc<Engine>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(routes::health))
        .route("/auctions/:id", get(routes::auction_status))
        .route("/stats/latency", get(routes::latency))
        .with_state(engine)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(engine): State<Arc<Engine>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| session::handle_socket(socket, peer, engine))
}

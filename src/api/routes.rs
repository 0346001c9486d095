//! REST observability surface beside the WebSocket endpoint.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::error::BidRejection;
use crate::server::Engine;

#[derive(Serialize)]
pub struct HealthResponse {
    pub connections: usize,
    pub rooms: usize,
    pub flagged_entities: usize,
    pub events_delivered: u64,
    pub deliveries_failed: u64,
}

pub async fn health(State(engine): State<Arc<Engine>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        connections: engine.connections.len(),
        rooms: engine.rooms.room_count(),
        flagged_entities: engine.flags.len(),
        events_delivered: engine.broadcaster.delivered(),
        deliveries_failed: engine.broadcaster.failed(),
    })
}

/// Same point-in-time snapshot the WS `get_auction_status` message returns.
pub async fn auction_status(
    State(engine): State<Arc<Engine>>,
    Path(auction_id): Path<String>,
) -> Response {
    match engine.coordinator.status_for(&auction_id).await {
        Ok(status) => Json(status).into_response(),
        Err(BidRejection::AuctionNotFound) => {
            (StatusCode::NOT_FOUND, "auction not found").into_response()
        }
        Err(rejection) => {
            (StatusCode::INTERNAL_SERVER_ERROR, rejection.to_string()).into_response()
        }
    }
}

#[derive(Serialize)]
pub struct LatencyResponse {
    pub samples: u64,
    pub p50_us: Option<u64>,
    pub p95_us: Option<u64>,
    pub p99_us: Option<u64>,
}

pub async fn latency(State(engine): State<Arc<Engine>>) -> Json<LatencyResponse> {
    let (p50, p95, p99) = engine.latency.percentiles();
    Json(LatencyResponse {
        samples: engine.latency.len(),
        p50_us: p50,
        p95_us: p95,
        p99_us: p99,
    })
}

mod api;
mod bidding;
mod broadcast;
mod config;
mod error;
mod fraud;
mod registry;
mod scheduler;
mod server;
mod store;
mod types;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::api::latency::LatencyStats;
use crate::bidding::BidCoordinator;
use crate::broadcast::Broadcaster;
use crate::config::{Config, FLAG_PURGE_INTERVAL_SECS};
use crate::error::Result;
use crate::fraud::flags::FlaggedStore;
use crate::fraud::RiskEngine;
use crate::registry::connections::ConnectionRegistry;
use crate::registry::rooms::RoomRegistry;
use crate::scheduler::Scheduler;
use crate::server::Engine;
use crate::store::{AuctionStore, SqliteStore};

#[tokio::main]
async fn main() {
    let cfg = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Config error: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cfg.log_level))
        .init();

    if let Err(e) = run(cfg).await {
        error!("Fatal error: {e}");
        std::process::exit(1);
    }
}

async fn run(cfg: Config) -> Result<()> {
    // --- Database setup ---
    let pool = sqlx::SqlitePool::connect(&format!("sqlite:{}?mode=rwc", cfg.db_path)).await?;
    let sqlite = SqliteStore::new(pool);
    sqlite.init_schema().await?;
    info!("Database ready at {}", cfg.db_path);
    let store: Arc<dyn AuctionStore> = Arc::new(sqlite);

    // --- Registries and engine components ---
    let connections = ConnectionRegistry::new();
    let rooms = RoomRegistry::new();
    let broadcaster = Broadcaster::new(Arc::clone(&connections), Arc::clone(&rooms));
    let flags = FlaggedStore::new();
    let risk = RiskEngine::new(Arc::clone(&store), Arc::clone(&flags));
    let coordinator = BidCoordinator::new(
        Arc::clone(&store),
        risk,
        Arc::clone(&rooms),
        Arc::clone(&broadcaster),
    );

    // Arm the authoritative close trigger for every auction already active,
    // so they end on time even if no further bid ever arrives.
    let active = store.active_auctions().await?;
    for auction in &active {
        coordinator.schedule_close(&auction.id, auction.end_time);
    }
    info!("armed close timers for {} active auctions", active.len());

    // --- Background sweeps ---
    let background = Scheduler::new();
    let sweep_connections = Arc::clone(&connections);
    let sweep_broadcaster = Arc::clone(&broadcaster);
    let sweep_timeout = cfg.heartbeat_timeout();
    background.spawn_recurring(
        "heartbeat_sweep",
        Duration::from_secs(cfg.heartbeat_interval_secs),
        move || {
            let connections = Arc::clone(&sweep_connections);
            let broadcaster = Arc::clone(&sweep_broadcaster);
            async move {
                scheduler::sweep_stale_connections(&connections, &broadcaster, sweep_timeout);
            }
        },
    );
    let purge_flags = Arc::clone(&flags);
    background.spawn_recurring(
        "flag_purge",
        Duration::from_secs(FLAG_PURGE_INTERVAL_SECS),
        move || {
            let flags = Arc::clone(&purge_flags);
            async move {
                scheduler::purge_expired_flags(&flags);
            }
        },
    );

    // --- HTTP/WS server ---
    let engine = Arc::new(Engine {
        store,
        connections,
        rooms,
        broadcaster,
        coordinator: Arc::clone(&coordinator),
        flags,
        latency: Arc::new(LatencyStats::new()),
    });
    let app = server::router(engine);
    let bind_addr = format!("0.0.0.0:{}", cfg.api_port);
    let listener = TcpListener::bind(&bind_addr).await?;
    info!("listening on {bind_addr}");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;

    // serve only returns when the listener fails; tear timers down so the
    // runtime can exit.
    background.shutdown();
    coordinator.shutdown();
    Ok(())
}

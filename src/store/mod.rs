//! Persistence boundary. The engine owns no durable state of its own: it
//! reads and writes auction/bid/user records through `AuctionStore` and
//! treats the backing database as an external collaborator.

use async_trait::async_trait;
use chrono::{DateTime, Timelike, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::error::{AppError, Result};
use crate::types::{AuctionState, AuctionStatus, Bid, UserProfile};

#[cfg(test)]
pub mod memory;

#[async_trait]
pub trait AuctionStore: Send + Sync {
    async fn auction_state(&self, auction_id: &str) -> Result<Option<AuctionState>>;

    async fn update_auction_state(&self, state: &AuctionState) -> Result<()>;

    /// Appends the bid and writes the new auction state atomically — a
    /// partial commit must never be observable.
    async fn commit_bid(&self, bid: &Bid, state: &AuctionState) -> Result<()>;

    async fn bidder_has_bid(&self, auction_id: &str, bidder_id: &str) -> Result<bool>;

    /// Most recent bids on an auction, newest first.
    async fn recent_bids(&self, auction_id: &str, limit: i64) -> Result<Vec<Bid>>;

    /// One bidder's bids on one auction since `since`, oldest first.
    async fn bids_by_bidder_since(
        &self,
        auction_id: &str,
        bidder_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<Bid>>;

    /// One bidder's bids across all auctions, newest first.
    async fn last_bids_by_bidder(&self, bidder_id: &str, limit: i64) -> Result<Vec<Bid>>;

    async fn distinct_bidders_from_ip_since(&self, ip: &str, since: DateTime<Utc>) -> Result<i64>;

    /// Per-hour-of-day bid counts over the bidder's full history.
    async fn bidder_hour_counts(&self, bidder_id: &str) -> Result<[u64; 24]>;

    async fn user_profile(&self, user_id: &str) -> Result<Option<UserProfile>>;

    async fn active_auctions(&self) -> Result<Vec<AuctionState>>;
}

// ---------------------------------------------------------------------------
// SqliteStore
// ---------------------------------------------------------------------------

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS auctions (
        id TEXT PRIMARY KEY,
        current_bid INTEGER NOT NULL,
        min_increment INTEGER NOT NULL,
        end_time INTEGER NOT NULL,
        total_bids INTEGER NOT NULL DEFAULT 0,
        unique_bidders INTEGER NOT NULL DEFAULT 0,
        status TEXT NOT NULL,
        auto_extend INTEGER NOT NULL DEFAULT 1,
        extensions INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS bids (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        auction_id TEXT NOT NULL,
        bidder_id TEXT NOT NULL,
        amount INTEGER NOT NULL,
        sequence INTEGER NOT NULL,
        bid_time INTEGER NOT NULL,
        connection_id INTEGER NOT NULL,
        ip TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_bids_auction_time ON bids (auction_id, bid_time)",
    "CREATE INDEX IF NOT EXISTS idx_bids_bidder_time ON bids (bidder_id, bid_time)",
    "CREATE INDEX IF NOT EXISTS idx_bids_ip_time ON bids (ip, bid_time)",
    "CREATE TABLE IF NOT EXISTS users (
        user_id TEXT PRIMARY KEY,
        display_name TEXT NOT NULL,
        role TEXT NOT NULL DEFAULT 'bidder'
    )",
];

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Creates tables and indexes if they do not exist yet.
    pub async fn init_schema(&self) -> Result<()> {
        for stmt in SCHEMA {
            sqlx::query(stmt).execute(&self.pool).await?;
        }
        Ok(())
    }
}

/// Timestamps are stored as epoch milliseconds.
fn to_millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .ok_or_else(|| AppError::Data(format!("timestamp out of range: {ms}")))
}

fn state_from_row(row: &SqliteRow) -> Result<AuctionState> {
    let status_raw: String = row.try_get("status")?;
    let status = AuctionStatus::parse(&status_raw)
        .ok_or_else(|| AppError::Data(format!("unknown auction status '{status_raw}'")))?;
    Ok(AuctionState {
        id: row.try_get("id")?,
        current_bid: row.try_get("current_bid")?,
        min_increment: row.try_get("min_increment")?,
        end_time: from_millis(row.try_get("end_time")?)?,
        total_bids: row.try_get("total_bids")?,
        unique_bidders: row.try_get("unique_bidders")?,
        status,
        auto_extend: row.try_get::<i64, _>("auto_extend")? != 0,
        extensions: row.try_get("extensions")?,
    })
}

fn bid_from_row(row: &SqliteRow) -> Result<Bid> {
    Ok(Bid {
        auction_id: row.try_get("auction_id")?,
        bidder_id: row.try_get("bidder_id")?,
        amount: row.try_get("amount")?,
        sequence: row.try_get("sequence")?,
        bid_time: from_millis(row.try_get("bid_time")?)?,
        connection_id: row.try_get("connection_id")?,
        ip: row.try_get("ip")?,
    })
}

#[async_trait]
impl AuctionStore for SqliteStore {
    async fn auction_state(&self, auction_id: &str) -> Result<Option<AuctionState>> {
        let row = sqlx::query("SELECT * FROM auctions WHERE id = ?")
            .bind(auction_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(state_from_row).transpose()
    }

    async fn update_auction_state(&self, state: &AuctionState) -> Result<()> {
        sqlx::query(
            "UPDATE auctions SET current_bid = ?, min_increment = ?, end_time = ?,
             total_bids = ?, unique_bidders = ?, status = ?, auto_extend = ?, extensions = ?
             WHERE id = ?",
        )
        .bind(state.current_bid)
        .bind(state.min_increment)
        .bind(to_millis(state.end_time))
        .bind(state.total_bids)
        .bind(state.unique_bidders)
        .bind(state.status.as_str())
        .bind(i64::from(state.auto_extend))
        .bind(state.extensions)
        .bind(&state.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn commit_bid(&self, bid: &Bid, state: &AuctionState) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO bids (auction_id, bidder_id, amount, sequence, bid_time, connection_id, ip)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&bid.auction_id)
        .bind(&bid.bidder_id)
        .bind(bid.amount)
        .bind(bid.sequence)
        .bind(to_millis(bid.bid_time))
        .bind(bid.connection_id)
        .bind(&bid.ip)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "UPDATE auctions SET current_bid = ?, end_time = ?, total_bids = ?,
             unique_bidders = ?, extensions = ? WHERE id = ?",
        )
        .bind(state.current_bid)
        .bind(to_millis(state.end_time))
        .bind(state.total_bids)
        .bind(state.unique_bidders)
        .bind(state.extensions)
        .bind(&state.id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn bidder_has_bid(&self, auction_id: &str, bidder_id: &str) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM bids WHERE auction_id = ? AND bidder_id = ?",
        )
        .bind(auction_id)
        .bind(bidder_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    async fn recent_bids(&self, auction_id: &str, limit: i64) -> Result<Vec<Bid>> {
        let rows = sqlx::query(
            "SELECT * FROM bids WHERE auction_id = ? ORDER BY sequence DESC LIMIT ?",
        )
        .bind(auction_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(bid_from_row).collect()
    }

    async fn bids_by_bidder_since(
        &self,
        auction_id: &str,
        bidder_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<Bid>> {
        let rows = sqlx::query(
            "SELECT * FROM bids WHERE auction_id = ? AND bidder_id = ? AND bid_time >= ?
             ORDER BY bid_time ASC",
        )
        .bind(auction_id)
        .bind(bidder_id)
        .bind(to_millis(since))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(bid_from_row).collect()
    }

    async fn last_bids_by_bidder(&self, bidder_id: &str, limit: i64) -> Result<Vec<Bid>> {
        let rows = sqlx::query(
            "SELECT * FROM bids WHERE bidder_id = ? ORDER BY bid_time DESC LIMIT ?",
        )
        .bind(bidder_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(bid_from_row).collect()
    }

    async fn distinct_bidders_from_ip_since(&self, ip: &str, since: DateTime<Utc>) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(DISTINCT bidder_id) FROM bids WHERE ip = ? AND bid_time >= ?",
        )
        .bind(ip)
        .bind(to_millis(since))
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn bidder_hour_counts(&self, bidder_id: &str) -> Result<[u64; 24]> {
        let rows = sqlx::query("SELECT bid_time FROM bids WHERE bidder_id = ?")
            .bind(bidder_id)
            .fetch_all(&self.pool)
            .await?;
        let mut counts = [0u64; 24];
        for row in &rows {
            let t = from_millis(row.try_get("bid_time")?)?;
            counts[t.hour() as usize] += 1;
        }
        Ok(counts)
    }

    async fn user_profile(&self, user_id: &str) -> Result<Option<UserProfile>> {
        let row = sqlx::query("SELECT user_id, display_name, role FROM users WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(match row {
            Some(row) => Some(UserProfile {
                user_id: row.try_get("user_id")?,
                display_name: row.try_get("display_name")?,
                role: row.try_get("role")?,
            }),
            None => None,
        })
    }

    async fn active_auctions(&self) -> Result<Vec<AuctionState>> {
        let rows = sqlx::query("SELECT * FROM auctions WHERE status = 'active'")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(state_from_row).collect()
    }
}

#[cfg(test)]
impl SqliteStore {
    pub async fn insert_auction(&self, state: &AuctionState) -> Result<()> {
        sqlx::query(
            "INSERT INTO auctions (id, current_bid, min_increment, end_time, total_bids,
             unique_bidders, status, auto_extend, extensions) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&state.id)
        .bind(state.current_bid)
        .bind(state.min_increment)
        .bind(to_millis(state.end_time))
        .bind(state.total_bids)
        .bind(state.unique_bidders)
        .bind(state.status.as_str())
        .bind(i64::from(state.auto_extend))
        .bind(state.extensions)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

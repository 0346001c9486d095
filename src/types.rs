use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Connections
// ---------------------------------------------------------------------------

/// Opaque handle for one live client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Auctions
// ---------------------------------------------------------------------------

/// Lifecycle status. Transitions only run forward:
/// pending → active → {ended, cancelled}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuctionStatus {
    Pending,
    Active,
    Ended,
    Cancelled,
}

impl AuctionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuctionStatus::Pending => "pending",
            AuctionStatus::Active => "active",
            AuctionStatus::Ended => "ended",
            AuctionStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(AuctionStatus::Pending),
            "active" => Some(AuctionStatus::Active),
            "ended" => Some(AuctionStatus::Ended),
            "cancelled" => Some(AuctionStatus::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for AuctionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Authoritative per-auction state. `current_bid` is non-decreasing over the
/// auction's lifetime. Amounts are integer minor units.
#[derive(Debug, Clone, Serialize)]
pub struct AuctionState {
    pub id: String,
    pub current_bid: i64,
    pub min_increment: i64,
    pub end_time: DateTime<Utc>,
    pub total_bids: i64,
    pub unique_bidders: i64,
    pub status: AuctionStatus,
    pub auto_extend: bool,
    /// Anti-snipe extensions applied so far.
    pub extensions: i64,
}

impl AuctionState {
    /// Floor for the next acceptable bid.
    pub fn minimum_next_bid(&self) -> i64 {
        self.current_bid + self.min_increment
    }

    /// Seconds until the scheduled close, clamped at zero.
    pub fn time_remaining(&self, now: DateTime<Utc>) -> i64 {
        (self.end_time - now).num_seconds().max(0)
    }
}

// ---------------------------------------------------------------------------
// Bids
// ---------------------------------------------------------------------------

/// A committed bid. Immutable once appended.
#[derive(Debug, Clone)]
pub struct Bid {
    pub auction_id: String,
    pub bidder_id: String,
    pub amount: i64,
    /// Monotonic per auction, assigned at commit.
    pub sequence: i64,
    pub bid_time: DateTime<Utc>,
    pub connection_id: i64,
    pub ip: String,
}

/// An inbound bid attempt, before validation and risk scoring.
#[derive(Debug, Clone)]
pub struct BidRequest {
    pub auction_id: String,
    pub bidder_id: String,
    pub amount: i64,
    pub connection_id: ConnectionId,
    pub ip: String,
}

/// Outcome of a committed bid.
#[derive(Debug, Clone)]
pub struct BidReceipt {
    pub bid: Bid,
    /// Auction state as of this commit.
    pub state: AuctionState,
    /// Whether this commit triggered an anti-snipe extension.
    pub extended: bool,
}

// ---------------------------------------------------------------------------
// Users
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct UserProfile {
    pub user_id: String,
    pub display_name: String,
    pub role: String,
}

use std::time::Duration;

use crate::error::{AppError, Result};

/// Heartbeat sweep period (seconds).
pub const HEARTBEAT_INTERVAL_SECS: u64 = 30;

/// Connections silent for more than this many sweep intervals are evicted.
pub const HEARTBEAT_MISSED_INTERVALS: u32 = 2;

/// Flagged-entity purge period (seconds).
pub const FLAG_PURGE_INTERVAL_SECS: u64 = 600;

/// Anti-snipe: a bid committed within this many seconds of the scheduled
/// close pushes the close back.
pub const EXTENSION_WINDOW_SECS: i64 = 300;

/// Anti-snipe: how far one extension pushes the close back (seconds).
pub const EXTENSION_AMOUNT_SECS: i64 = 300;

/// Hard cap on anti-snipe extensions per auction. Without a cap two
/// colluding bidders can hold an auction open indefinitely.
pub const MAX_EXTENSIONS: i64 = 6;

/// Bounded retries for persistence failures while committing a bid.
pub const MAX_COMMIT_RETRIES: u32 = 3;

/// Outbound message queue capacity per connection.
pub const OUTBOUND_CHANNEL_CAPACITY: usize = 256;

/// Number of recent bids included in an auction_status snapshot.
pub const STATUS_RECENT_BIDS: i64 = 5;

/// Risk scoring thresholds and per-signal contributions (0–100 scale).
pub mod fraud {
    /// Verdicts scoring at or above this total are rejected.
    pub const SCORE_THRESHOLD: u32 = 60;

    pub const FLAGGED_SUBJECT_SCORE: u32 = 60;
    pub const MULTI_ACCOUNT_IP_SCORE: u32 = 40;
    pub const VELOCITY_BURST_SCORE: u32 = 25;
    pub const RAPID_FIRE_SCORE: u32 = 35;
    pub const INCREMENT_LOCKSTEP_SCORE: u32 = 25;
    pub const OUTSIZED_JUMP_SCORE: u32 = 35;
    pub const COORDINATED_SCORE: u32 = 45;
    pub const OFF_HOURS_SCORE: u32 = 10;

    /// A degraded fraud query fails open: it contributes nothing to the score.
    pub const ANALYSIS_ERROR_SCORE: u32 = 0;

    /// Distinct bidder accounts from one address within the trailing window
    /// beyond which the address itself is flagged.
    pub const MAX_BIDDERS_PER_IP: i64 = 3;
    pub const IP_WINDOW_HOURS: i64 = 24;

    /// Bids by one bidder on one auction within the velocity window,
    /// counting the in-flight attempt, beyond which the burst signal fires.
    pub const VELOCITY_WINDOW_SECS: i64 = 600;
    pub const VELOCITY_MAX_BIDS: usize = 5;

    /// Consecutive same-bidder bids closer together than this are bot-like.
    pub const RAPID_FIRE_GAP_SECS: i64 = 5;

    /// Minimum bids (history plus attempt) before the lockstep signal applies.
    pub const LOCKSTEP_MIN_BIDS: usize = 3;

    /// A bid more than this multiple of the current reference value is an
    /// outsized jump.
    pub const JUMP_MULTIPLIER: i64 = 2;

    pub const COORDINATED_WINDOW_SECS: i64 = 1800;
    pub const COORDINATED_SAMPLE: i64 = 20;
    pub const COORDINATED_MAX_BIDDERS: usize = 3;
    pub const COORDINATED_MIN_ALTERNATIONS: usize = 2;

    /// Minimum historical bids before the off-hours signal is considered.
    pub const OFF_HOURS_MIN_HISTORY: u64 = 10;

    /// Flag lifetime (days).
    pub const FLAG_TTL_DAYS: i64 = 7;
}

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub db_path: String,
    pub api_port: u16,
    /// Heartbeat sweep period in seconds (HEARTBEAT_INTERVAL_SECS).
    pub heartbeat_interval_secs: u64,
    /// Missed intervals before eviction (HEARTBEAT_MISSED_INTERVALS).
    pub heartbeat_missed_intervals: u32,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            db_path: std::env::var("DB_PATH").unwrap_or_else(|_| "auctions.db".to_string()),
            api_port: std::env::var("API_PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse::<u16>()
                .map_err(|_| AppError::Config("API_PORT must be a valid port number".to_string()))?,
            heartbeat_interval_secs: std::env::var("HEARTBEAT_INTERVAL_SECS")
                .unwrap_or_else(|_| HEARTBEAT_INTERVAL_SECS.to_string())
                .parse::<u64>()
                .unwrap_or(HEARTBEAT_INTERVAL_SECS),
            heartbeat_missed_intervals: std::env::var("HEARTBEAT_MISSED_INTERVALS")
                .unwrap_or_else(|_| HEARTBEAT_MISSED_INTERVALS.to_string())
                .parse::<u32>()
                .unwrap_or(HEARTBEAT_MISSED_INTERVALS),
        })
    }

    /// A connection is stale once it has been silent for this long.
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs * u64::from(self.heartbeat_missed_intervals))
    }
}

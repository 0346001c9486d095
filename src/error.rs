use axum::{http::StatusCode, response::IntoResponse};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Data error: {0}")]
    Data(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AppError>;

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()).into_response()
    }
}

/// Why a bid was refused. Validation variants carry enough detail for the
/// client to retry correctly; FraudBlocked deliberately does not — signal
/// evidence is logged server-side only.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BidRejection {
    #[error("auction not found")]
    AuctionNotFound,

    #[error("auction is not accepting bids")]
    AuctionNotActive,

    #[error("auction has already ended")]
    AuctionEnded,

    #[error("bid must be at least {minimum}")]
    BidTooLow { minimum: i64 },

    #[error("bid rejected")]
    FraudBlocked,

    #[error("bid could not be processed, try again")]
    Transient,
}

impl BidRejection {
    /// Minimum acceptable amount, for bid_error payloads.
    pub fn minimum_bid(&self) -> Option<i64> {
        match self {
            BidRejection::BidTooLow { minimum } => Some(*minimum),
            _ => None,
        }
    }
}

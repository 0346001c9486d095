//! Wire contract. JSON messages, internally tagged on `type`, snake_case
//! names on both sides of the channel.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::AuctionStatus;

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Authenticate {
        user_id: String,
        token: String,
    },
    JoinAuction {
        auction_id: String,
    },
    LeaveAuction {
        auction_id: String,
    },
    PlaceBid {
        auction_id: String,
        bid_amount: i64,
        #[serde(default)]
        user_id: Option<String>,
    },
    WatchAuction {
        auction_id: String,
        #[serde(default)]
        user_id: Option<String>,
    },
    UnwatchAuction {
        auction_id: String,
        #[serde(default)]
        user_id: Option<String>,
    },
    GetAuctionStatus {
        auction_id: String,
    },
    Heartbeat,
}

/// One entry in an auction_status recent-bid list.
#[derive(Debug, Clone, Serialize)]
pub struct RecentBid {
    /// Display identity, not the raw bidder id.
    pub bidder: String,
    pub amount: i64,
    pub bid_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    AuthenticationSuccess {
        user_id: String,
        role: String,
    },
    AuthenticationError {
        message: String,
    },
    AuctionStatus {
        auction_id: String,
        status: AuctionStatus,
        current_bid: i64,
        total_bids: i64,
        unique_bidders: i64,
        watchers: usize,
        time_remaining: i64,
        recent_bids: Vec<RecentBid>,
        minimum_next_bid: i64,
    },
    AuctionError {
        message: String,
    },
    NewBid {
        auction_id: String,
        amount: i64,
        bidder: String,
        total_bids: i64,
        time_remaining: i64,
    },
    BidSuccess {
        auction_id: String,
        amount: i64,
        sequence: i64,
    },
    BidError {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        minimum_bid: Option<i64>,
    },
    ViewerLeft {
        auction_id: String,
        viewer_count: usize,
    },
    AuctionExtended {
        auction_id: String,
        new_end_time: DateTime<Utc>,
        /// Seconds added to the previous end time.
        extended_by: i64,
        reason: String,
    },
    AuctionEnded {
        auction_id: String,
        final_bid: i64,
        total_bids: i64,
    },
    WatchAck {
        auction_id: String,
        watchers: usize,
    },
    UnwatchAck {
        auction_id: String,
    },
    Heartbeat {
        server_time: DateTime<Utc>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_place_bid() {
        let raw = r#"{"type":"place_bid","auction_id":"a1","bid_amount":120,"user_id":"alice"}"#;
        let msg: ClientMessage = serde_json::from_str(raw).unwrap();
        match msg {
            ClientMessage::PlaceBid { auction_id, bid_amount, user_id } => {
                assert_eq!(auction_id, "a1");
                assert_eq!(bid_amount, 120);
                assert_eq!(user_id.as_deref(), Some("alice"));
            }
            other => panic!("expected PlaceBid, got {other:?}"),
        }
    }

    #[test]
    fn place_bid_user_id_is_optional() {
        let raw = r#"{"type":"place_bid","auction_id":"a1","bid_amount":120}"#;
        let msg: ClientMessage = serde_json::from_str(raw).unwrap();
        assert!(matches!(msg, ClientMessage::PlaceBid { user_id: None, .. }));
    }

    #[test]
    fn parses_bare_heartbeat() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"heartbeat"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Heartbeat));
    }

    #[test]
    fn parses_authenticate_and_join() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"authenticate","user_id":"alice","token":"t0k"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Authenticate { .. }));

        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"join_auction","auction_id":"a1"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::JoinAuction { .. }));
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"mystery"}"#).is_err());
        assert!(serde_json::from_str::<ClientMessage>("not json").is_err());
    }

    #[test]
    fn server_messages_carry_snake_case_type_tag() {
        let msg = ServerMessage::NewBid {
            auction_id: "a1".to_string(),
            amount: 120,
            bidder: "Alice".to_string(),
            total_bids: 4,
            time_remaining: 90,
        };
        let value: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "new_bid");
        assert_eq!(value["amount"], 120);
        assert_eq!(value["bidder"], "Alice");
    }

    #[test]
    fn bid_error_omits_minimum_when_absent() {
        let with = ServerMessage::BidError {
            message: "bid must be at least 130".to_string(),
            minimum_bid: Some(130),
        };
        let value = serde_json::to_value(&with).unwrap();
        assert_eq!(value["minimum_bid"], 130);

        let without = ServerMessage::BidError { message: "bid rejected".to_string(), minimum_bid: None };
        let value = serde_json::to_value(&without).unwrap();
        assert!(value.get("minimum_bid").is_none());
    }
}

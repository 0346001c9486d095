//! In-memory `AuctionStore` double for unit tests, with switches to inject
//! query and commit failures.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Timelike, Utc};

use crate::error::{AppError, Result};
use crate::types::{AuctionState, AuctionStatus, Bid, UserProfile};

use super::AuctionStore;

#[derive(Default)]
pub struct MemoryStore {
    auctions: Mutex<HashMap<String, AuctionState>>,
    bids: Mutex<Vec<Bid>>,
    users: Mutex<HashMap<String, UserProfile>>,
    /// When set, history queries (the risk engine's inputs) fail.
    pub fail_history: AtomicBool,
    /// When set, commit_bid fails.
    pub fail_commits: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert_auction(&self, state: AuctionState) {
        self.auctions.lock().unwrap().insert(state.id.clone(), state);
    }

    pub fn insert_user(&self, profile: UserProfile) {
        self.users.lock().unwrap().insert(profile.user_id.clone(), profile);
    }

    /// Seeds a historical bid without touching auction state.
    pub fn seed_bid(&self, bid: Bid) {
        self.bids.lock().unwrap().push(bid);
    }

    pub fn bid_count(&self) -> usize {
        self.bids.lock().unwrap().len()
    }

    fn history_guard(&self) -> Result<()> {
        if self.fail_history.load(Ordering::Relaxed) {
            Err(AppError::Data("injected history failure".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl AuctionStore for MemoryStore {
    async fn auction_state(&self, auction_id: &str) -> Result<Option<AuctionState>> {
        Ok(self.auctions.lock().unwrap().get(auction_id).cloned())
    }

    async fn update_auction_state(&self, state: &AuctionState) -> Result<()> {
        self.auctions.lock().unwrap().insert(state.id.clone(), state.clone());
        Ok(())
    }

    async fn commit_bid(&self, bid: &Bid, state: &AuctionState) -> Result<()> {
        if self.fail_commits.load(Ordering::Relaxed) {
            return Err(AppError::Data("injected commit failure".to_string()));
        }
        self.bids.lock().unwrap().push(bid.clone());
        self.auctions.lock().unwrap().insert(state.id.clone(), state.clone());
        Ok(())
    }

    async fn bidder_has_bid(&self, auction_id: &str, bidder_id: &str) -> Result<bool> {
        Ok(self
            .bids
            .lock()
            .unwrap()
            .iter()
            .any(|b| b.auction_id == auction_id && b.bidder_id == bidder_id))
    }

    async fn recent_bids(&self, auction_id: &str, limit: i64) -> Result<Vec<Bid>> {
        self.history_guard()?;
        let bids = self.bids.lock().unwrap();
        let mut out: Vec<Bid> = bids.iter().filter(|b| b.auction_id == auction_id).cloned().collect();
        out.sort_by(|a, b| b.bid_time.cmp(&a.bid_time));
        out.truncate(limit as usize);
        Ok(out)
    }

    async fn bids_by_bidder_since(
        &self,
        auction_id: &str,
        bidder_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<Bid>> {
        self.history_guard()?;
        let bids = self.bids.lock().unwrap();
        let mut out: Vec<Bid> = bids
            .iter()
            .filter(|b| b.auction_id == auction_id && b.bidder_id == bidder_id && b.bid_time >= since)
            .cloned()
            .collect();
        out.sort_by_key(|b| b.bid_time);
        Ok(out)
    }

    async fn last_bids_by_bidder(&self, bidder_id: &str, limit: i64) -> Result<Vec<Bid>> {
        self.history_guard()?;
        let bids = self.bids.lock().unwrap();
        let mut out: Vec<Bid> = bids.iter().filter(|b| b.bidder_id == bidder_id).cloned().collect();
        out.sort_by(|a, b| b.bid_time.cmp(&a.bid_time));
        out.truncate(limit as usize);
        Ok(out)
    }

    async fn distinct_bidders_from_ip_since(&self, ip: &str, since: DateTime<Utc>) -> Result<i64> {
        self.history_guard()?;
        let bids = self.bids.lock().unwrap();
        let distinct: std::collections::HashSet<&str> = bids
            .iter()
            .filter(|b| b.ip == ip && b.bid_time >= since)
            .map(|b| b.bidder_id.as_str())
            .collect();
        Ok(distinct.len() as i64)
    }

    async fn bidder_hour_counts(&self, bidder_id: &str) -> Result<[u64; 24]> {
        self.history_guard()?;
        let bids = self.bids.lock().unwrap();
        let mut counts = [0u64; 24];
        for b in bids.iter().filter(|b| b.bidder_id == bidder_id) {
            counts[b.bid_time.hour() as usize] += 1;
        }
        Ok(counts)
    }

    async fn user_profile(&self, user_id: &str) -> Result<Option<UserProfile>> {
        Ok(self.users.lock().unwrap().get(user_id).cloned())
    }

    async fn active_auctions(&self) -> Result<Vec<AuctionState>> {
        Ok(self
            .auctions
            .lock()
            .unwrap()
            .values()
            .filter(|a| a.status == AuctionStatus::Active)
            .cloned()
            .collect())
    }
}

//! Bid admission and commit. All writes to one auction are serialized behind
//! a per-auction mutex: validation reads a fresh snapshot under the lock, so
//! two commit attempts for the same auction never interleave, while attempts
//! for different auctions never contend.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::broadcast::Broadcaster;
use crate::config::{
    EXTENSION_AMOUNT_SECS, EXTENSION_WINDOW_SECS, MAX_COMMIT_RETRIES, MAX_EXTENSIONS,
    STATUS_RECENT_BIDS,
};
use crate::error::BidRejection;
use crate::fraud::RiskEngine;
use crate::registry::rooms::{RoomRegistry, RoomRole};
use crate::server::messages::{RecentBid, ServerMessage};
use crate::store::AuctionStore;
use crate::types::{AuctionState, AuctionStatus, Bid, BidReceipt, BidRequest, ConnectionId};

pub struct BidCoordinator {
    store: Arc<dyn AuctionStore>,
    risk: Arc<RiskEngine>,
    rooms: Arc<RoomRegistry>,
    broadcaster: Arc<Broadcaster>,
    /// auction_id → commit lock. Locks are created lazily and never removed;
    /// an idle lock is a few words.
    locks: DashMap<String, Arc<Mutex<()>>>,
    /// auction_id → pending authoritative-close timer.
    close_timers: DashMap<String, JoinHandle<()>>,
}

impl BidCoordinator {
    pub fn new(
        store: Arc<dyn AuctionStore>,
        risk: Arc<RiskEngine>,
        rooms: Arc<RoomRegistry>,
        broadcaster: Arc<Broadcaster>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            risk,
            rooms,
            broadcaster,
            locks: DashMap::new(),
            close_timers: DashMap::new(),
        })
    }

    fn lock_for(&self, auction_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(auction_id.to_string())
            .or_default()
            .clone()
    }

    /// Validates, risk-scores, and commits one bid. The risk verdict is
    /// produced before the critical section and consumed strictly before the
    /// commit decision; the floor is re-checked on a fresh snapshot under the
    /// per-auction lock, which is what totally orders "simultaneous" bids.
    pub async fn submit_bid(&self, req: BidRequest) -> Result<BidReceipt, BidRejection> {
        let state = self.load_active(&req.auction_id).await?;
        let minimum = state.minimum_next_bid();
        if req.amount < minimum {
            return Err(BidRejection::BidTooLow { minimum });
        }

        let verdict = self.risk.evaluate(&req, &state).await;
        if !verdict.admitted {
            // Evidence stays in the log; the client only sees a generic rejection.
            warn!(
                auction_id = %req.auction_id,
                bidder_id = %req.bidder_id,
                score = verdict.score,
                "bid blocked by risk verdict: {}",
                verdict.summary()
            );
            return Err(BidRejection::FraudBlocked);
        }

        let lock = self.lock_for(&req.auction_id);
        let _guard = lock.lock().await;

        // The floor may have moved while we waited for the lock.
        let state = self.load_active(&req.auction_id).await?;
        let minimum = state.minimum_next_bid();
        if req.amount < minimum {
            return Err(BidRejection::BidTooLow { minimum });
        }

        let receipt = self.commit(&req, state).await?;

        // Fan out while the lock is held so broadcast order equals commit order.
        self.announce(&receipt).await;

        Ok(receipt)
    }

    async fn load_active(&self, auction_id: &str) -> Result<AuctionState, BidRejection> {
        let state = self.store.auction_state(auction_id).await.map_err(|e| {
            error!(auction_id, "auction lookup failed: {e}");
            BidRejection::Transient
        })?;
        let Some(state) = state else {
            return Err(BidRejection::AuctionNotFound);
        };
        if state.status != AuctionStatus::Active {
            return Err(BidRejection::AuctionNotActive);
        }
        if Utc::now() > state.end_time {
            return Err(BidRejection::AuctionEnded);
        }
        Ok(state)
    }

    /// Builds the committed bid and new auction state, evaluates anti-snipe
    /// extension at commit time, and persists both atomically with bounded
    /// retries. Nothing is observable until the store write succeeds.
    async fn commit(
        &self,
        req: &BidRequest,
        mut state: AuctionState,
    ) -> Result<BidReceipt, BidRejection> {
        let now = Utc::now();
        let sequence = state.total_bids + 1;
        let bid = Bid {
            auction_id: req.auction_id.clone(),
            bidder_id: req.bidder_id.clone(),
            amount: req.amount,
            sequence,
            bid_time: now,
            connection_id: req.connection_id.0 as i64,
            ip: req.ip.clone(),
        };

        state.current_bid = req.amount;
        state.total_bids = sequence;

        let mut extended = false;
        if state.auto_extend
            && state.extensions < MAX_EXTENSIONS
            && state.end_time - now < Duration::seconds(EXTENSION_WINDOW_SECS)
        {
            state.end_time = state.end_time + Duration::seconds(EXTENSION_AMOUNT_SECS);
            state.extensions += 1;
            extended = true;
        }

        let mut attempts = 0;
        loop {
            attempts += 1;
            let result = async {
                let new_bidder = !self
                    .store
                    .bidder_has_bid(&req.auction_id, &req.bidder_id)
                    .await?;
                let mut next = state.clone();
                if new_bidder {
                    next.unique_bidders += 1;
                }
                self.store.commit_bid(&bid, &next).await?;
                Ok::<AuctionState, crate::error::AppError>(next)
            }
            .await;
            match result {
                Ok(next) => {
                    state = next;
                    break;
                }
                Err(e) if attempts < MAX_COMMIT_RETRIES => {
                    warn!(
                        auction_id = %req.auction_id,
                        attempt = attempts,
                        "bid commit failed, retrying: {e}"
                    );
                }
                Err(e) => {
                    error!(
                        auction_id = %req.auction_id,
                        "bid commit failed after {attempts} attempts: {e}"
                    );
                    return Err(BidRejection::Transient);
                }
            }
        }

        info!(
            auction_id = %req.auction_id,
            bidder_id = %req.bidder_id,
            amount = req.amount,
            sequence,
            extended,
            "bid committed"
        );
        Ok(BidReceipt { bid, state, extended })
    }

    async fn announce(&self, receipt: &BidReceipt) {
        let now = Utc::now();
        let state = &receipt.state;
        let bidder = self.display_name(&receipt.bid.bidder_id).await;

        self.broadcaster.publish(
            &state.id,
            &ServerMessage::NewBid {
                auction_id: state.id.clone(),
                amount: receipt.bid.amount,
                bidder,
                total_bids: state.total_bids,
                time_remaining: state.time_remaining(now),
            },
        );

        if receipt.extended {
            self.broadcaster.publish(
                &state.id,
                &ServerMessage::AuctionExtended {
                    auction_id: state.id.clone(),
                    new_end_time: state.end_time,
                    extended_by: EXTENSION_AMOUNT_SECS,
                    reason: "late bid".to_string(),
                },
            );
            self.schedule_close(&state.id, state.end_time);
        }
    }

    async fn display_name(&self, bidder_id: &str) -> String {
        match self.store.user_profile(bidder_id).await {
            Ok(Some(profile)) => profile.display_name,
            _ => bidder_id.to_string(),
        }
    }

    // -----------------------------------------------------------------------
    // Room membership with a consistent baseline
    // -----------------------------------------------------------------------

    /// Joins a connection to an auction's room and hands it a point-in-time
    /// status snapshot. Runs under the auction's commit lock so no committed
    /// bid can slip between the join and the snapshot: the first incremental
    /// event a member sees is always newer than its baseline.
    pub async fn join_with_snapshot(
        &self,
        auction_id: &str,
        conn_id: ConnectionId,
        role: RoomRole,
    ) -> Result<(), BidRejection> {
        let lock = self.lock_for(auction_id);
        let _guard = lock.lock().await;

        let state = self
            .store
            .auction_state(auction_id)
            .await
            .map_err(|_| BidRejection::Transient)?
            .ok_or(BidRejection::AuctionNotFound)?;

        self.rooms.join(auction_id, conn_id, role);
        let snapshot = self.status_snapshot(&state).await;
        self.broadcaster.send_to(conn_id, &snapshot);
        Ok(())
    }

    /// Point-in-time status for `get_auction_status` and REST reads.
    pub async fn status_for(&self, auction_id: &str) -> Result<ServerMessage, BidRejection> {
        let state = self
            .store
            .auction_state(auction_id)
            .await
            .map_err(|_| BidRejection::Transient)?
            .ok_or(BidRejection::AuctionNotFound)?;
        Ok(self.status_snapshot(&state).await)
    }

    async fn status_snapshot(&self, state: &AuctionState) -> ServerMessage {
        let recent = match self.store.recent_bids(&state.id, STATUS_RECENT_BIDS).await {
            Ok(bids) => {
                let mut out = Vec::with_capacity(bids.len());
                for bid in bids {
                    out.push(RecentBid {
                        bidder: self.display_name(&bid.bidder_id).await,
                        amount: bid.amount,
                        bid_time: bid.bid_time,
                    });
                }
                out
            }
            Err(e) => {
                warn!(auction_id = %state.id, "recent bid lookup failed: {e}");
                Vec::new()
            }
        };

        ServerMessage::AuctionStatus {
            auction_id: state.id.clone(),
            status: state.status,
            current_bid: state.current_bid,
            total_bids: state.total_bids,
            unique_bidders: state.unique_bidders,
            watchers: self.rooms.viewer_count(&state.id),
            time_remaining: state.time_remaining(Utc::now()),
            recent_bids: recent,
            minimum_next_bid: state.minimum_next_bid(),
        }
    }

    // -----------------------------------------------------------------------
    // Authoritative close
    // -----------------------------------------------------------------------

    /// Arms (or re-arms, after an extension) the one scheduled trigger that
    /// flips ACTIVE → ENDED and broadcasts the terminal event even when no
    /// further bid arrives.
    pub fn schedule_close(&self, auction_id: &str, end_time: DateTime<Utc>) {
        let store = Arc::clone(&self.store);
        let broadcaster = Arc::clone(&self.broadcaster);
        let lock = self.lock_for(auction_id);
        let id = auction_id.to_string();

        let handle = tokio::spawn(async move {
            let mut target = end_time;
            loop {
                let wait_ms = (target - Utc::now()).num_milliseconds().max(0) as u64;
                tokio::time::sleep(std::time::Duration::from_millis(wait_ms)).await;
                match finalize_auction(store.as_ref(), &broadcaster, &lock, &id).await {
                    CloseAction::Done => break,
                    CloseAction::Retry(next) => target = next,
                }
            }
        });

        if let Some(previous) = self.close_timers.insert(auction_id.to_string(), handle) {
            previous.abort();
        }
    }

    /// Aborts every pending close timer.
    pub fn shutdown(&self) {
        for entry in self.close_timers.iter() {
            entry.value().abort();
        }
        self.close_timers.clear();
    }
}

#[derive(Debug)]
pub(crate) enum CloseAction {
    Done,
    /// Not due yet (extended meanwhile) or transient failure; check again at
    /// the given time.
    Retry(DateTime<Utc>),
}

/// Body of the close timer, separated from the timer itself so tests can
/// drive it directly. Takes the same per-auction lock as bid commits: a close
/// and a commit can never interleave.
pub(crate) async fn finalize_auction(
    store: &dyn AuctionStore,
    broadcaster: &Broadcaster,
    lock: &Mutex<()>,
    auction_id: &str,
) -> CloseAction {
    let _guard = lock.lock().await;

    let state = match store.auction_state(auction_id).await {
        Ok(Some(state)) => state,
        Ok(None) => return CloseAction::Done,
        Err(e) => {
            warn!(auction_id, "close check failed: {e}");
            return CloseAction::Retry(Utc::now() + Duration::seconds(5));
        }
    };
    if state.status != AuctionStatus::Active {
        return CloseAction::Done;
    }
    let now = Utc::now();
    if state.end_time > now {
        return CloseAction::Retry(state.end_time);
    }

    let mut state = state;
    state.status = AuctionStatus::Ended;
    if let Err(e) = store.update_auction_state(&state).await {
        warn!(auction_id, "failed to persist auction close: {e}");
        return CloseAction::Retry(now + Duration::seconds(5));
    }

    info!(auction_id, final_bid = state.current_bid, total_bids = state.total_bids, "auction ended");
    broadcaster.publish(
        auction_id,
        &ServerMessage::AuctionEnded {
            auction_id: auction_id.to_string(),
            final_bid: state.current_bid,
            total_bids: state.total_bids,
        },
    );
    CloseAction::Done
}

//! Multi-signal risk scoring that gates bid admission. Each signal
//! contributes an additive, capped score; the verdict is a pure function of
//! bid history and the flag store, and never mutates auction state.

pub mod flags;
pub mod signals;

use std::sync::Arc;

use chrono::{Duration, Timelike, Utc};
use tracing::warn;

use crate::config::fraud::*;
use crate::error::AppError;
use crate::store::AuctionStore;
use crate::types::{AuctionState, BidRequest};

use flags::{FlaggedStore, Subject};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    FlaggedBidder,
    FlaggedIp,
    MultiAccountIp,
    VelocityBurst,
    RapidFire,
    IncrementLockstep,
    OutsizedJump,
    CoordinatedRotation,
    OffHours,
    AnalysisError,
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SignalKind::FlaggedBidder => "flagged_bidder",
            SignalKind::FlaggedIp => "flagged_ip",
            SignalKind::MultiAccountIp => "multi_account_ip",
            SignalKind::VelocityBurst => "velocity_burst",
            SignalKind::RapidFire => "rapid_fire",
            SignalKind::IncrementLockstep => "increment_lockstep",
            SignalKind::OutsizedJump => "outsized_jump",
            SignalKind::CoordinatedRotation => "coordinated_rotation",
            SignalKind::OffHours => "off_hours",
            SignalKind::AnalysisError => "analysis_error",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone)]
pub struct FraudSignal {
    pub kind: SignalKind,
    pub severity: Severity,
    pub score: u32,
    pub evidence: String,
}

#[derive(Debug, Clone)]
pub struct FraudVerdict {
    /// Additive total, capped at 100.
    pub score: u32,
    pub admitted: bool,
    pub signals: Vec<FraudSignal>,
}

impl FraudVerdict {
    /// Compact kind:score listing for operator logs.
    pub fn summary(&self) -> String {
        self.signals
            .iter()
            .map(|s| format!("{}:{}", s.kind, s.score))
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn has_signal(&self, kind: SignalKind) -> bool {
        self.signals.iter().any(|s| s.kind == kind)
    }
}

pub struct RiskEngine {
    store: Arc<dyn AuctionStore>,
    flags: Arc<FlaggedStore>,
}

impl RiskEngine {
    pub fn new(store: Arc<dyn AuctionStore>, flags: Arc<FlaggedStore>) -> Arc<Self> {
        Arc::new(Self { store, flags })
    }

    /// Scores one bid attempt against history. History queries that fail
    /// contribute nothing and surface as an `analysis_error` signal: a flaky
    /// data layer must not freeze the auction floor.
    pub async fn evaluate(&self, req: &BidRequest, state: &AuctionState) -> FraudVerdict {
        let now = Utc::now();
        let mut collected: Vec<FraudSignal> = Vec::new();

        // Hard flags first; either alone clears the rejection threshold.
        if self.flags.is_flagged(&Subject::Bidder(req.bidder_id.clone())) {
            collected.push(FraudSignal {
                kind: SignalKind::FlaggedBidder,
                severity: Severity::High,
                score: FLAGGED_SUBJECT_SCORE,
                evidence: format!("bidder {} is flagged", req.bidder_id),
            });
        }
        if self.flags.is_flagged(&Subject::Ip(req.ip.clone())) {
            collected.push(FraudSignal {
                kind: SignalKind::FlaggedIp,
                severity: Severity::High,
                score: FLAGGED_SUBJECT_SCORE,
                evidence: format!("address {} is flagged", req.ip),
            });
        }

        // Multiple bidder accounts behind one address.
        match self
            .store
            .distinct_bidders_from_ip_since(&req.ip, now - Duration::hours(IP_WINDOW_HOURS))
            .await
        {
            Ok(count) if count > MAX_BIDDERS_PER_IP => {
                collected.push(FraudSignal {
                    kind: SignalKind::MultiAccountIp,
                    severity: Severity::High,
                    score: MULTI_ACCOUNT_IP_SCORE,
                    evidence: format!("{count} bidder accounts from {} in 24h", req.ip),
                });
                self.flags
                    .flag(Subject::Ip(req.ip.clone()), "multiple bidder accounts from one address");
            }
            Ok(_) => {}
            Err(e) => collected.push(self.analysis_error("ip history", &e)),
        }

        // Bidding velocity on this auction.
        match self
            .store
            .bids_by_bidder_since(
                &req.auction_id,
                &req.bidder_id,
                now - Duration::seconds(VELOCITY_WINDOW_SECS),
            )
            .await
        {
            Ok(bids) => {
                let bid_times: Vec<_> = bids.iter().map(|b| b.bid_time).collect();
                collected.extend(signals::velocity_burst(&bid_times));
                collected.extend(signals::rapid_fire(&bid_times, now));
            }
            Err(e) => collected.push(self.analysis_error("velocity history", &e)),
        }

        // Amount patterns.
        match self.store.last_bids_by_bidder(&req.bidder_id, 5).await {
            Ok(bids) => {
                let amounts: Vec<i64> = bids.iter().map(|b| b.amount).collect();
                collected.extend(signals::increment_lockstep(
                    &amounts,
                    req.amount,
                    state.min_increment,
                ));
            }
            Err(e) => collected.push(self.analysis_error("amount history", &e)),
        }
        collected.extend(signals::outsized_jump(req.amount, state.current_bid));

        // Coordinated rotation among the recent bidders on this auction.
        match self.store.recent_bids(&req.auction_id, COORDINATED_SAMPLE).await {
            Ok(bids) => {
                let cutoff = now - Duration::seconds(COORDINATED_WINDOW_SECS);
                // recent_bids is newest-first; the pattern check wants
                // chronological order.
                let sequence: Vec<String> = bids
                    .iter()
                    .rev()
                    .filter(|b| b.bid_time >= cutoff)
                    .map(|b| b.bidder_id.clone())
                    .collect();
                if let Some((signal, involved)) = signals::coordinated_rotation(&sequence) {
                    collected.push(signal);
                    for bidder in involved {
                        self.flags.flag(Subject::Bidder(bidder), "coordinated bidding");
                    }
                }
            }
            Err(e) => collected.push(self.analysis_error("rotation history", &e)),
        }

        // Contextual anomaly, advisory only.
        match self.store.bidder_hour_counts(&req.bidder_id).await {
            Ok(counts) => {
                collected.extend(signals::off_hours(&counts, now.hour() as usize));
            }
            Err(e) => collected.push(self.analysis_error("hour-of-day history", &e)),
        }

        let score: u32 = collected.iter().map(|s| s.score).sum::<u32>().min(100);
        let admitted = score < SCORE_THRESHOLD;
        if !admitted {
            // Evidence is operator-only; the client sees a generic rejection.
            for signal in &collected {
                warn!(
                    bidder_id = %req.bidder_id,
                    kind = %signal.kind,
                    severity = %signal.severity,
                    score = signal.score,
                    evidence = %signal.evidence,
                    "risk signal"
                );
            }
        }
        FraudVerdict { score, admitted, signals: collected }
    }

    fn analysis_error(&self, query: &str, err: &AppError) -> FraudSignal {
        warn!(query, error = %err, "risk analysis degraded, failing open");
        FraudSignal {
            kind: SignalKind::AnalysisError,
            severity: Severity::Low,
            score: ANALYSIS_ERROR_SCORE,
            evidence: format!("{query}: {err}"),
        }
    }
}

//! Per-signal scoring functions. Each is a pure function of explicit inputs
//! (history window, thresholds) so it can be tested without an engine or a
//! database around it.

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};

use crate::config::fraud::*;

use super::{FraudSignal, Severity, SignalKind};

/// More than `VELOCITY_MAX_BIDS` bids (counting the in-flight attempt) by one
/// bidder on one auction inside the trailing velocity window.
pub fn velocity_burst(window_bid_times: &[DateTime<Utc>]) -> Option<FraudSignal> {
    let attempted = window_bid_times.len() + 1;
    if attempted <= VELOCITY_MAX_BIDS {
        return None;
    }
    Some(FraudSignal {
        kind: SignalKind::VelocityBurst,
        severity: Severity::Medium,
        score: VELOCITY_BURST_SCORE,
        evidence: format!(
            "{attempted} bids within {}s (limit {VELOCITY_MAX_BIDS})",
            VELOCITY_WINDOW_SECS
        ),
    })
}

/// Any consecutive same-bidder gap under `RAPID_FIRE_GAP_SECS`, including the
/// gap between the latest historical bid and the attempt.
pub fn rapid_fire(
    bid_times_ascending: &[DateTime<Utc>],
    attempt_at: DateTime<Utc>,
) -> Option<FraudSignal> {
    let min_gap = Duration::seconds(RAPID_FIRE_GAP_SECS);
    let mut chain: Vec<DateTime<Utc>> = bid_times_ascending.to_vec();
    chain.push(attempt_at);
    for pair in chain.windows(2) {
        if pair[1] - pair[0] < min_gap {
            return Some(FraudSignal {
                kind: SignalKind::RapidFire,
                severity: Severity::High,
                score: RAPID_FIRE_SCORE,
                evidence: format!(
                    "consecutive bids {}ms apart",
                    (pair[1] - pair[0]).num_milliseconds()
                ),
            });
        }
    }
    None
}

/// Bot-like regularity: the bidder's last bids plus the attempt, at least
/// `LOCKSTEP_MIN_BIDS` of them, all exact multiples of the increment.
pub fn increment_lockstep(
    last_amounts: &[i64],
    attempt_amount: i64,
    min_increment: i64,
) -> Option<FraudSignal> {
    if min_increment <= 0 || last_amounts.len() + 1 < LOCKSTEP_MIN_BIDS {
        return None;
    }
    let all_multiples = last_amounts
        .iter()
        .chain(std::iter::once(&attempt_amount))
        .all(|a| a % min_increment == 0);
    if !all_multiples {
        return None;
    }
    Some(FraudSignal {
        kind: SignalKind::IncrementLockstep,
        severity: Severity::Medium,
        score: INCREMENT_LOCKSTEP_SCORE,
        evidence: format!(
            "last {} bids all exact multiples of increment {min_increment}",
            last_amounts.len() + 1
        ),
    })
}

/// A single bid more than `JUMP_MULTIPLIER`× the current reference value.
pub fn outsized_jump(attempt_amount: i64, reference: i64) -> Option<FraudSignal> {
    if reference <= 0 || attempt_amount <= reference * JUMP_MULTIPLIER {
        return None;
    }
    Some(FraudSignal {
        kind: SignalKind::OutsizedJump,
        severity: Severity::High,
        score: OUTSIZED_JUMP_SCORE,
        evidence: format!("bid {attempt_amount} exceeds {JUMP_MULTIPLIER}x reference {reference}"),
    })
}

/// Shill rotation: a small closed set of bidders trading the high bid back
/// and forth. `bidders_in_order` is the recent bidder sequence, oldest first.
/// Returns the signal and every bidder involved, for flagging.
pub fn coordinated_rotation(bidders_in_order: &[String]) -> Option<(FraudSignal, Vec<String>)> {
    if bidders_in_order.len() < 4 {
        return None;
    }
    let distinct: HashSet<&String> = bidders_in_order.iter().collect();
    if distinct.len() < 2 || distinct.len() > COORDINATED_MAX_BIDDERS {
        return None;
    }
    let alternations = bidders_in_order
        .windows(3)
        .filter(|w| w[0] == w[2] && w[0] != w[1])
        .count();
    if alternations < COORDINATED_MIN_ALTERNATIONS {
        return None;
    }
    let mut involved: Vec<String> = distinct.into_iter().cloned().collect();
    involved.sort();
    let signal = FraudSignal {
        kind: SignalKind::CoordinatedRotation,
        severity: Severity::High,
        score: COORDINATED_SCORE,
        evidence: format!(
            "{} bidders alternating over last {} bids ({alternations} rotations)",
            involved.len(),
            bidders_in_order.len()
        ),
    };
    Some((signal, involved))
}

/// Advisory: the bidder has an established history but has never bid in this
/// hour of the day before.
pub fn off_hours(hour_counts: &[u64; 24], hour: usize) -> Option<FraudSignal> {
    let total: u64 = hour_counts.iter().sum();
    if total < OFF_HOURS_MIN_HISTORY || hour_counts[hour] > 0 {
        return None;
    }
    Some(FraudSignal {
        kind: SignalKind::OffHours,
        severity: Severity::Low,
        score: OFF_HOURS_SCORE,
        evidence: format!("no prior bids at hour {hour} across {total} historical bids"),
    })
}

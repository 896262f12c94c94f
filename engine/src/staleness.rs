//! Round trip sequencing and stale response detection.
//!
//! Every request is stamped from one monotonically increasing sequence shared
//! by dry runs and full saves. A response is only relevant if no strictly
//! newer request was issued after it, so responses that arrive out of order
//! are dropped without touching any state.

use crate::{error::Result, Error, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// What a round trip asks the server to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RoundTripKind {
    /// Recalculate without persisting
    DryRun,
    /// Persist the document
    FullSave,
    /// Recalculate and let the server plan transport. Behaves as a dry run.
    AutoPlan,
}

impl RoundTripKind {
    /// Whether the server is asked not to persist anything.
    pub fn is_dry_run(self) -> bool {
        !matches!(self, RoundTripKind::FullSave)
    }
}

/// An issued request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundTrip {
    /// Position in the global sequence
    pub sequence: u64,
    pub kind: RoundTripKind,
    /// Caller-supplied issue time in milliseconds
    pub issued_at: Timestamp,
}

impl RoundTrip {
    /// Check if this round trip was issued after another.
    pub fn is_newer_than(&self, other: &RoundTrip) -> bool {
        self.sequence > other.sequence
    }
}

/// Lifecycle of a round trip.
///
/// `Idle -> Requesting -> {Applying | Superseded | Failed}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RoundTripPhase {
    Idle,
    Requesting,
    Applying,
    Superseded,
    Failed,
}

/// How a response ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Applied,
    Failed,
}

/// Issues round trips and decides which responses still matter.
#[derive(Debug, Clone, Default)]
pub struct StalenessGuard {
    /// Sequence of the most recently issued round trip (0 before the first)
    latest_issued: u64,
    /// Round trips awaiting a response, by sequence
    outstanding: BTreeMap<u64, RoundTripKind>,
}

impl StalenessGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a new round trip.
    ///
    /// Recalculations are rejected outright while a full save is
    /// outstanding. They are not queued.
    pub fn issue(&mut self, kind: RoundTripKind, now: Timestamp) -> Result<RoundTrip> {
        if kind.is_dry_run() && self.save_in_progress() {
            return Err(Error::SaveInProgress);
        }

        self.latest_issued += 1;
        self.outstanding.insert(self.latest_issued, kind);

        Ok(RoundTrip {
            sequence: self.latest_issued,
            kind,
            issued_at: now,
        })
    }

    /// Whether the response to `round_trip` may still be applied.
    pub fn is_relevant(&self, round_trip: &RoundTrip) -> bool {
        round_trip.sequence >= self.latest_issued
    }

    /// Whether any full save is awaiting its response.
    pub fn save_in_progress(&self) -> bool {
        self.outstanding
            .values()
            .any(|kind| *kind == RoundTripKind::FullSave)
    }

    /// Sequence of the latest issued round trip.
    pub fn latest_issued(&self) -> u64 {
        self.latest_issued
    }

    /// Number of round trips awaiting a response.
    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    /// Current phase of a round trip.
    pub fn phase(&self, round_trip: &RoundTrip) -> RoundTripPhase {
        if self.outstanding.contains_key(&round_trip.sequence) {
            RoundTripPhase::Requesting
        } else {
            RoundTripPhase::Idle
        }
    }

    /// Close a round trip and report its final phase.
    ///
    /// Stale round trips always end `Superseded`, whatever the settlement.
    /// Settling a full save releases the recalculation gate.
    pub fn settle(&mut self, round_trip: &RoundTrip, settlement: Settlement) -> Result<RoundTripPhase> {
        let known = self.outstanding.remove(&round_trip.sequence).is_some();

        if !self.is_relevant(round_trip) {
            return Ok(RoundTripPhase::Superseded);
        }
        if !known {
            return Err(Error::UnknownRoundTrip(round_trip.sequence));
        }

        Ok(match settlement {
            Settlement::Applied => RoundTripPhase::Applying,
            Settlement::Failed => RoundTripPhase::Failed,
        })
    }

    /// Forget a round trip whose response will never be read.
    ///
    /// Returns whether it was still outstanding. Withdrawing a full save
    /// releases the recalculation gate.
    pub fn withdraw(&mut self, round_trip: &RoundTrip) -> bool {
        self.outstanding.remove(&round_trip.sequence).is_some()
    }

    /// Forget every outstanding round trip. Their responses become stale.
    pub fn reset(&mut self) {
        self.outstanding.clear();
        self.latest_issued += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_is_shared_across_kinds() {
        let mut guard = StalenessGuard::new();
        let a = guard.issue(RoundTripKind::DryRun, 10).unwrap();
        let b = guard.issue(RoundTripKind::AutoPlan, 11).unwrap();
        let c = guard.issue(RoundTripKind::FullSave, 12).unwrap();

        assert_eq!((a.sequence, b.sequence, c.sequence), (1, 2, 3));
        assert!(c.is_newer_than(&a));
        assert_eq!(c.issued_at, 12);
    }

    #[test]
    fn out_of_order_response_is_superseded() {
        let mut guard = StalenessGuard::new();
        let t1 = guard.issue(RoundTripKind::DryRun, 0).unwrap();
        let t2 = guard.issue(RoundTripKind::DryRun, 1).unwrap();

        // t2 arrives first
        assert!(guard.is_relevant(&t2));
        assert_eq!(guard.settle(&t2, Settlement::Applied), Ok(RoundTripPhase::Applying));

        assert!(!guard.is_relevant(&t1));
        assert_eq!(guard.settle(&t1, Settlement::Applied), Ok(RoundTripPhase::Superseded));
        assert_eq!(guard.outstanding(), 0);
    }

    #[test]
    fn recalculation_rejected_during_save() {
        let mut guard = StalenessGuard::new();
        let save = guard.issue(RoundTripKind::FullSave, 0).unwrap();

        assert_eq!(guard.issue(RoundTripKind::DryRun, 1), Err(Error::SaveInProgress));
        assert_eq!(guard.issue(RoundTripKind::AutoPlan, 1), Err(Error::SaveInProgress));
        // Rejection does not consume a sequence number.
        assert!(guard.is_relevant(&save));

        guard.settle(&save, Settlement::Failed).unwrap();
        assert!(guard.issue(RoundTripKind::DryRun, 2).is_ok());
    }

    #[test]
    fn save_outranks_earlier_recalculation() {
        let mut guard = StalenessGuard::new();
        let dry = guard.issue(RoundTripKind::DryRun, 0).unwrap();
        let save = guard.issue(RoundTripKind::FullSave, 1).unwrap();

        assert_eq!(guard.settle(&dry, Settlement::Applied), Ok(RoundTripPhase::Superseded));
        assert_eq!(guard.settle(&save, Settlement::Applied), Ok(RoundTripPhase::Applying));
    }

    #[test]
    fn phases() {
        let mut guard = StalenessGuard::new();
        let rt = guard.issue(RoundTripKind::DryRun, 0).unwrap();
        assert_eq!(guard.phase(&rt), RoundTripPhase::Requesting);

        assert_eq!(guard.settle(&rt, Settlement::Failed), Ok(RoundTripPhase::Failed));
        assert_eq!(guard.phase(&rt), RoundTripPhase::Idle);
    }

    #[test]
    fn double_settle_is_an_error() {
        let mut guard = StalenessGuard::new();
        let rt = guard.issue(RoundTripKind::DryRun, 0).unwrap();
        guard.settle(&rt, Settlement::Applied).unwrap();
        assert_eq!(
            guard.settle(&rt, Settlement::Applied),
            Err(Error::UnknownRoundTrip(rt.sequence))
        );
    }

    #[test]
    fn withdrawn_save_releases_the_gate() {
        let mut guard = StalenessGuard::new();
        let save = guard.issue(RoundTripKind::FullSave, 0).unwrap();

        assert!(guard.withdraw(&save));
        assert!(!guard.withdraw(&save));
        assert!(!guard.save_in_progress());
        assert_eq!(guard.outstanding(), 0);

        let next = guard.issue(RoundTripKind::DryRun, 1).unwrap();
        assert!(next.is_newer_than(&save));
    }

    #[test]
    fn reset_makes_in_flight_responses_stale() {
        let mut guard = StalenessGuard::new();
        let save = guard.issue(RoundTripKind::FullSave, 0).unwrap();
        guard.reset();

        assert!(!guard.save_in_progress());
        assert!(!guard.is_relevant(&save));
        assert_eq!(guard.settle(&save, Settlement::Applied), Ok(RoundTripPhase::Superseded));

        let next = guard.issue(RoundTripKind::DryRun, 1).unwrap();
        assert!(next.is_newer_than(&save));
    }
}

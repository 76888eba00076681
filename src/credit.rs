//! Credit-based admission for the transfer engine.

use crate::backoff::Backoff;
use std::sync::atomic::{AtomicU32, Ordering};

/// Bounds the number of concurrently outstanding transfers.
///
/// Two monotonically increasing counters: `claimed` ticks when a caller
/// wants to issue a transfer, `completed` ticks when one finishes. A caller
/// whose claim number is not yet within `max_in_flight` of the completed
/// counter polls with backoff until it is. Release never needs a bound
/// check, since it only ever creates headroom.
///
/// Both counters wrap at `u32::MAX`; the in-flight computation uses wrapping
/// subtraction, so the gate stays correct across wraparound.
pub struct CreditGate {
    claimed: AtomicU32,
    completed: AtomicU32,
    max_in_flight: u32,
}

impl CreditGate {
    /// Create a gate admitting at most `max_in_flight` concurrent transfers.
    pub fn new(max_in_flight: u32) -> Self {
        assert!(max_in_flight > 0, "credit pool must be nonzero");
        Self {
            claimed: AtomicU32::new(0),
            completed: AtomicU32::new(0),
            max_in_flight,
        }
    }

    /// Claim one credit, polling until the gate has room.
    ///
    /// Returns once `claim - completed < max_in_flight` holds for this
    /// caller's claim number. The matching [`release`](Self::release) must be
    /// called exactly once when the transfer completes.
    pub fn claim(&self, backoff: &Backoff) {
        let claim = self.claimed.fetch_add(1, Ordering::AcqRel);
        loop {
            let completed = self.completed.load(Ordering::Acquire);
            if claim.wrapping_sub(completed) < self.max_in_flight {
                return;
            }
            crate::metrics::record_credit_wait();
            backoff.snooze();
        }
    }

    /// Return one credit.
    pub fn release(&self) {
        self.completed.fetch_add(1, Ordering::AcqRel);
    }

    /// Credits currently claimed but not yet released.
    ///
    /// Includes claimants still polling in [`claim`](Self::claim); the number
    /// of transfers actually admitted never exceeds `max_in_flight`.
    pub fn outstanding(&self) -> u32 {
        let claimed = self.claimed.load(Ordering::Acquire);
        let completed = self.completed.load(Ordering::Acquire);
        claimed.wrapping_sub(completed)
    }

    /// The configured admission bound.
    pub fn max_in_flight(&self) -> u32 {
        self.max_in_flight
    }
}

//! Poll-with-backoff waiting.
//!
//! Every wait in the engine is a bounded sleep followed by a re-check of the
//! condition; there are no condition variables or futexes in the hot path.
//! This trades a little latency for freedom from lock convoys and priority
//! inversion across the many polling loops.

use crate::error::{Error, Result};
use std::thread;
use std::time::Duration;

/// A sleep-then-retry helper shared by every polling loop in the engine.
///
/// An optional retry ceiling converts a wait that never resolves into a
/// fatal [`Error::Stalled`]; with no ceiling the loop polls forever, which
/// is the intended service-mode behavior (a stalled collaborator is a
/// liveness bug surfaced by monitoring, not something to paper over).
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    interval: Duration,
    retry_limit: Option<u64>,
}

impl Backoff {
    /// Create a backoff that sleeps `interval` between polls, forever.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            retry_limit: None,
        }
    }

    /// Create a backoff that gives up after `retry_limit` fruitless polls.
    pub fn with_limit(interval: Duration, retry_limit: u64) -> Self {
        Self {
            interval,
            retry_limit: Some(retry_limit),
        }
    }

    /// Create a backoff with an optional ceiling (as carried by the config).
    pub fn with_optional_limit(interval: Duration, retry_limit: Option<u64>) -> Self {
        Self {
            interval,
            retry_limit,
        }
    }

    /// Sleep one interval.
    pub fn snooze(&self) {
        thread::sleep(self.interval);
    }

    /// Sleep one interval, counting attempts against the retry ceiling.
    ///
    /// `what` names the condition being awaited, for the stall report.
    pub fn snooze_checked(&self, what: &'static str, attempts: &mut u64) -> Result<()> {
        *attempts += 1;
        if let Some(limit) = self.retry_limit {
            if *attempts > limit {
                tracing::error!(what, retries = *attempts, "poll loop stalled");
                return Err(Error::Stalled {
                    what,
                    retries: *attempts,
                });
            }
        }
        thread::sleep(self.interval);
        Ok(())
    }

    /// Poll `cond` until it yields a value, sleeping between attempts.
    pub fn wait_for<T>(
        &self,
        what: &'static str,
        mut cond: impl FnMut() -> Option<T>,
    ) -> Result<T> {
        let mut attempts = 0u64;
        loop {
            if let Some(value) = cond() {
                return Ok(value);
            }
            self.snooze_checked(what, &mut attempts)?;
        }
    }
}

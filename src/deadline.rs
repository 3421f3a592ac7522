//! Monotonic countdown primitive used to bound `stop`/`add`/worker-poll
//! suspension points without ever reading wall-clock time.

use crate::error::DeadlineError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A unit for querying [`Deadline::remaining`], mirroring the distilled
/// spec's `remaining(unit)` operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeUnit {
    Millis,
    Seconds,
}

/// An immutable, wall-clock-independent countdown.
///
/// Once [`Deadline::remaining`] observes zero it latches `expired = true`
/// and never reports non-zero again, even if queried through a clone. The
/// latch is a one-shot optimization, not a correctness requirement: the
/// underlying computation (`expiry.saturating_duration_since(Instant::now())`)
/// is monotonic on its own, so the latch only saves a clock read once a
/// reader has already seen zero.
#[derive(Debug, Clone)]
pub struct Deadline {
    expiry: Instant,
    expired: Arc<AtomicBool>,
}

impl Deadline {
    /// Construct a deadline expiring `duration` from now.
    ///
    /// # Errors
    ///
    /// Returns [`DeadlineError::NegativeDuration`] if `duration` is
    /// negative. `Duration` itself cannot be negative in Rust, so this is
    /// only reachable through [`Deadline::from_millis`]; kept so both
    /// constructors share one fallible signature.
    pub fn in_(duration: Duration) -> Result<Self, DeadlineError> {
        Ok(Self {
            expiry: Instant::now() + duration,
            expired: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Construct a deadline expiring `millis` milliseconds from now.
    ///
    /// # Errors
    ///
    /// Returns [`DeadlineError::NegativeDuration`] if `millis` is negative.
    pub fn from_millis(millis: i64) -> Result<Self, DeadlineError> {
        if millis < 0 {
            return Err(DeadlineError::NegativeDuration { millis });
        }
        Self::in_(Duration::from_millis(millis as u64))
    }

    /// A deadline that has already expired.
    pub fn expired() -> Self {
        Self {
            expiry: Instant::now(),
            expired: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Remaining time in the given unit, floored at zero. Latches the
    /// sticky `expired` flag the first time this returns zero.
    pub fn remaining(&self, unit: TimeUnit) -> u64 {
        let remaining = self.remaining_duration();
        match unit {
            TimeUnit::Millis => remaining.as_millis() as u64,
            TimeUnit::Seconds => remaining.as_secs(),
        }
    }

    /// Remaining time as a [`Duration`], floored at zero.
    pub fn remaining_duration(&self) -> Duration {
        if self.expired.load(Ordering::Acquire) {
            return Duration::ZERO;
        }

        let remaining = self.expiry.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            self.expired.store(true, Ordering::Release);
        }
        remaining
    }

    /// Whether this deadline has expired (`remaining() == 0`).
    pub fn has_expired(&self) -> bool {
        self.remaining_duration().is_zero()
    }

    /// Run `action` with the remaining time (in milliseconds) if this
    /// deadline has not expired; otherwise a no-op.
    pub fn run_if_not_expired(&self, action: impl FnOnce(u64)) {
        let remaining_ms = self.remaining(TimeUnit::Millis);
        if remaining_ms > 0 {
            action(remaining_ms);
        }
    }

    /// Apply `f` to the remaining time (in milliseconds) if this deadline
    /// has not expired; otherwise returns `None`.
    pub fn apply_if_not_expired<R>(&self, f: impl FnOnce(u64) -> R) -> Option<R> {
        let remaining_ms = self.remaining(TimeUnit::Millis);
        if remaining_ms > 0 {
            Some(f(remaining_ms))
        } else {
            None
        }
    }
}

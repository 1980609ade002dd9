//! Grant arithmetic for the throttle.
//!
//! Non-async interior so the refill and draw-down behavior can be tested
//! exhaustively without a runtime.

use super::Error;

/// Ticks per interval. Ticks are microseconds, so an interval is one second
/// and a `maximum_capacity` of N grants N units per second.
pub(crate) const INTERVAL_TICKS: u64 = 1_000_000;

/// The shared capacity pool. Refills to maximum at every interval roll-over,
/// never mid-interval.
#[derive(Debug)]
pub(crate) struct Valve {
    /// Capacity restored at each roll-over.
    per_interval: u32,
    /// Capacity still available in the current interval.
    remaining: u32,
    /// Index of the interval `remaining` belongs to.
    interval: u64,
}

impl Valve {
    pub(crate) fn new(maximum_capacity: std::num::NonZeroU32) -> Self {
        let per_interval = maximum_capacity.get();
        Self {
            per_interval,
            remaining: per_interval,
            interval: 0,
        }
    }

    /// Attempt to draw `amount` units at absolute time `ticks_elapsed`.
    ///
    /// Returns 0 when the draw succeeded. Returns the number of ticks until
    /// the next roll-over when the current interval cannot cover the
    /// request; nothing is drawn in that case and the caller is expected to
    /// wait and ask again. Capacity in an interval only ever decreases, so a
    /// denied caller cannot succeed before the roll-over.
    pub(crate) fn request(&mut self, ticks_elapsed: u64, amount: u32) -> Result<u64, Error> {
        if amount == 0 {
            return Ok(0);
        }
        if amount > self.per_interval {
            return Err(Error::Capacity {
                maximum_capacity: self.per_interval,
                request: amount,
            });
        }

        let current_interval = ticks_elapsed / INTERVAL_TICKS;
        if current_interval > self.interval {
            // Rolled into a later interval, possibly skipping several. The
            // pool does not accumulate across skipped intervals.
            self.remaining = self.per_interval;
            self.interval = current_interval;
        }

        if amount <= self.remaining {
            self.remaining -= amount;
            Ok(0)
        } else {
            Ok(INTERVAL_TICKS - (ticks_elapsed % INTERVAL_TICKS))
        }
    }
}

//! The ballast pacing mechanism
//!
//! A single [`Throttle`] is shared by every worker in the pipeline. Capacity
//! drawn by one worker is capacity no other worker can draw in the same
//! interval, which keeps the aggregate emission rate on target even when
//! individual workers stall: whatever a stalled worker leaves unclaimed is
//! granted to its peers.

#![deny(clippy::all)]
#![deny(clippy::cargo)]
#![deny(clippy::pedantic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(clippy::unwrap_used)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_copy_implementations)]
#![deny(missing_debug_implementations)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::multiple_crate_versions)]

use std::num::NonZeroU32;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::{self, Duration, Instant};

mod valve;

use valve::Valve;

/// Configuration of a [`Throttle`].
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Units granted per one-second interval, jointly across all holders of
    /// the throttle.
    pub maximum_capacity: NonZeroU32,
}

/// Errors produced by [`Throttle`].
#[derive(thiserror::Error, Debug, Clone, Copy)]
pub enum Error {
    /// A request was larger than the interval capacity and can never be
    /// granted.
    #[error("request for {request} units exceeds interval capacity {maximum_capacity}")]
    Capacity {
        /// Units available per interval.
        maximum_capacity: u32,
        /// Units requested.
        request: u32,
    },
}

#[async_trait]
/// Time source for a [`Throttle`], in microsecond ticks.
pub trait Clock {
    /// Ticks elapsed since the clock was created.
    fn ticks_elapsed(&self) -> u64;
    /// Sleep for `ticks` microseconds.
    async fn wait(&self, ticks: u64);
}

#[derive(Debug, Clone, Copy)]
/// A [`Clock`] backed by monotonic tokio time.
pub struct RealClock {
    start: Instant,
}

impl Default for RealClock {
    fn default() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

#[async_trait]
impl Clock for RealClock {
    /// Return the number of microseconds since this clock was created.
    ///
    /// # Panics
    ///
    /// Panics if more microseconds have elapsed than fit in a u64, roughly
    /// 584,554 years after creation.
    #[allow(clippy::cast_possible_truncation)]
    fn ticks_elapsed(&self) -> u64 {
        let elapsed: u128 = self.start.elapsed().as_micros();
        assert!(
            elapsed <= u128::from(u64::MAX),
            "clock exceeded tick range"
        );
        elapsed as u64
    }

    async fn wait(&self, ticks: u64) {
        time::sleep(Duration::from_micros(ticks)).await;
    }
}

/// An interval token bucket shared by a pool of workers.
///
/// Capacity refills to the configured maximum at every one-second interval
/// roll-over. Requests draw down the shared pool when capacity is
/// immediately available and otherwise learn how long to sleep before the
/// next roll-over. The interior state is a handful of integers behind a
/// mutex; the critical section performs no I/O and never awaits.
#[derive(Debug)]
pub struct Throttle<C = RealClock> {
    valve: Mutex<Valve>,
    clock: C,
}

impl Throttle<RealClock> {
    /// Create a new [`Throttle`] driven by real time.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self::with_clock(config, RealClock::default())
    }
}

impl<C> Throttle<C>
where
    C: Clock + Send + Sync,
{
    /// Create a new [`Throttle`] with the given clock.
    #[must_use]
    pub fn with_clock(config: Config, clock: C) -> Self {
        Self {
            valve: Mutex::new(Valve::new(config.maximum_capacity)),
            clock,
        }
    }

    /// Wait until one unit of capacity has been granted.
    ///
    /// # Errors
    ///
    /// See documentation in [`Error`].
    #[inline]
    pub async fn wait(&self) -> Result<(), Error> {
        self.wait_for(NonZeroU32::MIN).await
    }

    /// Wait until `request` units of capacity have been granted.
    ///
    /// # Errors
    ///
    /// See documentation in [`Error`].
    pub async fn wait_for(&self, request: NonZeroU32) -> Result<(), Error> {
        loop {
            // Hold the lock only for the grant arithmetic. Sleeping happens
            // with the lock released so peers can draw in the meantime.
            let slop: u64 = {
                let mut valve = self
                    .valve
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                valve.request(self.clock.ticks_elapsed(), request.get())?
            };
            if slop == 0 {
                return Ok(());
            }
            self.clock.wait(slop).await;
        }
    }
}

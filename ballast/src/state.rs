//! Run-wide delivery accounting.
//!
//! A single [`RunState`] is shared by every worker and the pipeline
//! coordinator. Workers bump counters as documents move through the
//! pipeline, the coordinator advances the lifecycle phase. Once the run
//! reaches [`Phase::Stopped`] the counters satisfy `sent + failed ==
//! synthesized`.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};

/// Lifecycle phase of a pipeline run.
///
/// Phases advance strictly forward: `Initializing` to `Running` to
/// `Draining` to `Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Phase {
    /// Startup checks are in flight, no documents move yet.
    Initializing = 0,
    /// Workers are synthesizing and submitting documents.
    Running = 1,
    /// Synthesis has ceased, buffered documents are being settled.
    Draining = 2,
    /// All workers have exited and the counters are final.
    Stopped = 3,
}

impl Phase {
    // Only `RunState::set_phase` stores values read here.
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Phase::Initializing,
            1 => Phase::Running,
            2 => Phase::Draining,
            _ => Phase::Stopped,
        }
    }
}

/// Point-in-time view of a [`RunState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    /// Documents synthesized so far.
    pub synthesized: u64,
    /// Documents accepted by the backend.
    pub sent: u64,
    /// Documents that will never be delivered.
    pub failed: u64,
    /// Retry attempts made, counted per backoff cycle.
    pub retried: u64,
    /// Current lifecycle phase.
    pub phase: Phase,
}

impl Snapshot {
    /// Documents synthesized but not yet settled as sent or failed.
    #[must_use]
    pub fn outstanding(&self) -> u64 {
        self.synthesized
            .saturating_sub(self.sent.saturating_add(self.failed))
    }
}

/// Shared counters and lifecycle phase for one pipeline run.
#[derive(Debug)]
pub struct RunState {
    synthesized: AtomicU64,
    sent: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    phase: AtomicU8,
    fatal: AtomicBool,
}

impl Default for RunState {
    fn default() -> Self {
        Self::new()
    }
}

impl RunState {
    /// Create a new [`RunState`] in [`Phase::Initializing`].
    #[must_use]
    pub fn new() -> Self {
        Self {
            synthesized: AtomicU64::new(0),
            sent: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            retried: AtomicU64::new(0),
            phase: AtomicU8::new(Phase::Initializing as u8),
            fatal: AtomicBool::new(false),
        }
    }

    /// Record `count` documents synthesized.
    pub fn incr_synthesized(&self, count: u64) {
        self.synthesized.fetch_add(count, Ordering::Relaxed);
    }

    /// Record `count` documents accepted by the backend.
    pub fn incr_sent(&self, count: u64) {
        self.sent.fetch_add(count, Ordering::Relaxed);
    }

    /// Record `count` documents that will never be delivered.
    pub fn incr_failed(&self, count: u64) {
        self.failed.fetch_add(count, Ordering::Relaxed);
    }

    /// Record `count` retry attempts.
    pub fn incr_retried(&self, count: u64) {
        self.retried.fetch_add(count, Ordering::Relaxed);
    }

    /// Current lifecycle phase.
    #[must_use]
    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    /// Advance the lifecycle phase.
    pub fn set_phase(&self, phase: Phase) {
        self.phase.store(phase as u8, Ordering::SeqCst);
    }

    /// Whether the run is live, for deployment health checks: workers are
    /// producing or draining, not yet stopped.
    #[must_use]
    pub fn is_live(&self) -> bool {
        matches!(self.phase(), Phase::Running | Phase::Draining)
    }

    /// Mark the run as fatally wounded. Drain must not submit further
    /// documents once this is set.
    pub fn set_fatal(&self) {
        self.fatal.store(true, Ordering::SeqCst);
    }

    /// Whether a fatal error has been recorded.
    #[must_use]
    pub fn fatal(&self) -> bool {
        self.fatal.load(Ordering::SeqCst)
    }

    /// Point-in-time view of the counters.
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            synthesized: self.synthesized.load(Ordering::Relaxed),
            sent: self.sent.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            phase: self.phase(),
        }
    }

    /// Account for documents synthesized but never settled, charging the
    /// shortfall to `failed`. Returns the shortfall.
    ///
    /// Called once by the coordinator after every worker has been joined,
    /// so no counter moves concurrently.
    pub fn reconcile(&self) -> u64 {
        let synthesized = self.synthesized.load(Ordering::SeqCst);
        let settled =
            self.sent.load(Ordering::SeqCst) + self.failed.load(Ordering::SeqCst);
        let shortfall = synthesized.saturating_sub(settled);
        if shortfall > 0 {
            self.failed.fetch_add(shortfall, Ordering::SeqCst);
        }
        shortfall
    }
}

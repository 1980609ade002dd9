//! Document batching ahead of bulk submission.
//!
//! Each worker owns an [`Accumulator`]. Records collect in the accumulator
//! until either the batch size threshold is met or the flush interval
//! elapses, at which point a [`Batch`] pops out for submission. Records are
//! never dropped here: whatever the accumulator holds is surrendered by
//! [`Accumulator::take`] during drain.

use std::{num::NonZeroU32, time::Duration};

use ballast_payload::Record;
use tokio::time::Instant;

/// A group of documents bound for a single bulk request.
#[derive(Debug)]
pub struct Batch {
    records: Vec<Record>,
}

impl Batch {
    pub(crate) fn new(records: Vec<Record>) -> Self {
        Self { records }
    }

    /// Number of documents in the batch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the batch holds no documents. Batches produced by
    /// [`Accumulator`] never do.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// The documents themselves.
    #[must_use]
    pub fn records(&self) -> &[Record] {
        &self.records
    }
}

/// Collects records until a batch is due.
#[derive(Debug)]
pub struct Accumulator {
    capacity: usize,
    flush_interval: Duration,
    buffer: Vec<Record>,
    deadline: Option<Instant>,
}

impl Accumulator {
    /// Create an [`Accumulator`] that emits a [`Batch`] at `capacity`
    /// records, or `flush_interval` after the oldest buffered record
    /// arrived, whichever comes first.
    #[must_use]
    pub fn new(capacity: NonZeroU32, flush_interval: Duration) -> Self {
        let capacity = capacity.get() as usize;
        Self {
            capacity,
            flush_interval,
            buffer: Vec::with_capacity(capacity),
            deadline: None,
        }
    }

    /// Buffer a record, returning a [`Batch`] if this push met the
    /// capacity threshold.
    pub fn push(&mut self, record: Record) -> Option<Batch> {
        if self.buffer.is_empty() {
            self.deadline = Some(Instant::now() + self.flush_interval);
        }
        self.buffer.push(record);
        if self.buffer.len() >= self.capacity {
            self.take()
        } else {
            None
        }
    }

    /// Surrender whatever is buffered, if anything.
    pub fn take(&mut self) -> Option<Batch> {
        self.deadline = None;
        if self.buffer.is_empty() {
            return None;
        }
        let records =
            std::mem::replace(&mut self.buffer, Vec::with_capacity(self.capacity));
        Some(Batch::new(records))
    }

    /// Instant at which the buffered records must be flushed. `None` when
    /// the buffer is empty.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Number of buffered records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Whether the buffer is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

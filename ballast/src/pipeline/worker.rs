//! The per-task half of the pipeline.
//!
//! Each worker owns a disjoint slice of the sequence space, an accumulator
//! and a clone of the submitter. Workers share the throttle and the run
//! state. A worker that sees an authentication refusal poisons the whole
//! pipeline by cancelling the shared shutdown token.

use std::sync::Arc;

use ballast_payload::{Record, Synthesizer};
use ballast_throttle::Throttle;
use metrics::counter;
use tokio::time::{self, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    batch::{Accumulator, Batch},
    config::Config,
    state::RunState,
    submit::{self, Submitter},
};

use super::Error;

pub(super) struct Worker {
    synthesizer: Synthesizer,
    sequence: u64,
    stride: u64,
    throttle: Arc<Throttle>,
    submitter: Submitter,
    accumulator: Accumulator,
    state: Arc<RunState>,
    shutdown: CancellationToken,
    labels: Vec<(String, String)>,
}

/// Sleep until the oldest buffered record must be flushed, or forever when
/// nothing is buffered.
async fn flush_timer(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => time::sleep(Duration::MAX).await,
    }
}

impl Worker {
    pub(super) fn new(
        id: u16,
        config: &Config,
        synthesizer: Synthesizer,
        throttle: Arc<Throttle>,
        submitter: Submitter,
        state: Arc<RunState>,
        shutdown: CancellationToken,
    ) -> Self {
        let labels = vec![
            ("component".to_string(), "pipeline".to_string()),
            ("worker".to_string(), id.to_string()),
        ];
        Self {
            synthesizer,
            sequence: u64::from(id),
            stride: u64::from(config.workers.get()),
            throttle,
            submitter,
            accumulator: Accumulator::new(
                config.batch_size,
                Duration::from_millis(config.flush_interval_milliseconds.get()),
            ),
            state,
            shutdown,
            labels,
        }
    }

    /// Run this [`Worker`] until a shutdown signal is received, then drain
    /// whatever remains buffered.
    pub(super) async fn spin(mut self) -> Result<(), Error> {
        let shutdown = self.shutdown.clone();
        let shutdown_wait = shutdown.cancelled();
        tokio::pin!(shutdown_wait);
        loop {
            tokio::select! {
                result = self.throttle.wait() => {
                    result?;
                    let record = self.synthesize()?;
                    if let Some(batch) = self.accumulator.push(record) {
                        self.deliver(&batch).await?;
                    }
                }
                () = flush_timer(self.accumulator.deadline()) => {
                    if let Some(batch) = self.accumulator.take() {
                        self.deliver(&batch).await?;
                    }
                }
                () = &mut shutdown_wait => {
                    debug!("shutdown signal received");
                    break;
                }
            }
        }
        if let Some(batch) = self.accumulator.take() {
            if self.state.fatal() {
                // A poisoned pipeline does not put more load on the backend.
                let total = batch.len() as u64;
                self.state.incr_failed(total);
                counter!("documents_failed", &self.labels).increment(total);
            } else {
                self.deliver(&batch).await?;
            }
        }
        Ok(())
    }

    fn synthesize(&mut self) -> Result<Record, Error> {
        let record = self.synthesizer.synthesize(self.sequence)?;
        self.sequence = self.sequence.wrapping_add(self.stride);
        self.state.incr_synthesized(1);
        counter!("documents_synthesized", &self.labels).increment(1);
        Ok(record)
    }

    /// Submit `batch` and settle every one of its documents against the run
    /// state. Only authentication refusals propagate; any other submission
    /// failure charges the batch as failed and the worker carries on.
    async fn deliver(&self, batch: &Batch) -> Result<(), Error> {
        let total = batch.len() as u64;
        match self.submitter.submit(batch).await {
            Ok(delivery) => {
                self.state.incr_sent(delivery.accepted);
                self.state.incr_failed(delivery.rejected);
                self.state.incr_retried(delivery.retries);
                counter!("documents_sent", &self.labels).increment(delivery.accepted);
                counter!("documents_failed", &self.labels).increment(delivery.rejected);
                counter!("submission_retries", &self.labels).increment(delivery.retries);
                counter!("batches_submitted", &self.labels).increment(1);
                Ok(())
            }
            Err(err @ submit::Error::Auth { .. }) => {
                self.state.incr_failed(total);
                counter!("documents_failed", &self.labels).increment(total);
                self.state.set_fatal();
                self.shutdown.cancel();
                Err(Error::Submit(err))
            }
            Err(err) => {
                let retries = match &err {
                    submit::Error::Exhausted { attempts } => attempts.saturating_sub(1),
                    submit::Error::Permanent { retries, .. } => *retries,
                    _ => 0,
                };
                warn!("abandoning batch of {total} documents: {err}");
                self.state.incr_failed(total);
                self.state.incr_retried(retries);
                counter!("documents_failed", &self.labels).increment(total);
                counter!("submission_retries", &self.labels).increment(retries);
                Ok(())
            }
        }
    }
}

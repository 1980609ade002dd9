//! The ballast pipeline
//!
//! The pipeline is responsible for pushing synthesized log documents into
//! the search backend. One [`Server`] owns the whole arrangement: a shared
//! throttle that meters document synthesis, a pool of workers that batch
//! and submit documents and a [`RunState`] that tracks every document from
//! synthesis to settlement. Workers run until the configured duration
//! elapses or a shutdown signal arrives, then drain their partial batches
//! under a deadline.

use std::sync::Arc;

use ballast_payload::Synthesizer;
use ballast_throttle::Throttle;
use metrics::gauge;
use tokio::{
    task::JoinSet,
    time::{self, Duration, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    config::Config,
    state::{Phase, RunState},
    submit::Submitter,
};

mod worker;

use worker::Worker;

/// Errors produced by [`Server`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// See [`crate::submit::Error`] for details.
    #[error(transparent)]
    Submit(#[from] crate::submit::Error),
    /// See [`ballast_payload::Error`] for details.
    #[error(transparent)]
    Payload(#[from] ballast_payload::Error),
    /// See [`ballast_throttle::Error`] for details.
    #[error(transparent)]
    Throttle(#[from] ballast_throttle::Error),
    /// The configured failure threshold is not a ratio.
    #[error("failure threshold {0} is not within 0.0 to 1.0")]
    FailureThreshold(f64),
}

/// The log generation and delivery pipeline.
#[derive(Debug)]
pub struct Server {
    config: Config,
    shutdown: CancellationToken,
    state: Arc<RunState>,
}

impl Server {
    /// Create a new [`Server`] instance.
    ///
    /// Cancelling `shutdown` at any point moves the pipeline into its drain
    /// sequence.
    ///
    /// # Errors
    ///
    /// Returns an error if the configured failure threshold is not a ratio
    /// between 0.0 and 1.0.
    pub fn new(config: Config, shutdown: CancellationToken) -> Result<Self, Error> {
        // NaN fails the range check on its own.
        if !(0.0..=1.0).contains(&config.failure_threshold) {
            return Err(Error::FailureThreshold(config.failure_threshold));
        }
        Ok(Self {
            config,
            shutdown,
            state: Arc::new(RunState::new()),
        })
    }

    /// The [`RunState`] shared with every worker. Counters remain readable
    /// after [`Server::spin`] returns.
    #[must_use]
    pub fn state(&self) -> Arc<RunState> {
        Arc::clone(&self.state)
    }

    /// Run the pipeline to completion or until a shutdown signal is
    /// received.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be probed at startup, if the
    /// backend refuses our credentials or if a worker gives out.
    #[allow(clippy::too_many_lines)]
    pub async fn spin(self) -> Result<(), Error> {
        let submitter = Submitter::new(&self.config)?;
        let cluster = match submitter.ping().await {
            Ok(cluster) => cluster,
            Err(err) => {
                self.state.set_phase(Phase::Stopped);
                return Err(err.into());
            }
        };
        info!(
            cluster_name = %cluster.cluster_name,
            version = %cluster.version.number,
            index = %self.config.index,
            "connected to search backend"
        );

        let throttle = Arc::new(Throttle::new(ballast_throttle::Config {
            maximum_capacity: self.config.documents_per_second,
        }));
        let synthesizer = Synthesizer::new(self.config.seed);

        let mut workers = JoinSet::new();
        for id in 0..self.config.workers.get() {
            let worker = Worker::new(
                id,
                &self.config,
                synthesizer,
                Arc::clone(&throttle),
                submitter.clone(),
                Arc::clone(&self.state),
                self.shutdown.clone(),
            );
            workers.spawn(worker.spin());
        }
        self.state.set_phase(Phase::Running);
        info!(
            workers = self.config.workers.get(),
            documents_per_second = self.config.documents_per_second.get(),
            batch_size = self.config.batch_size.get(),
            "pipeline running"
        );

        // A run without a configured duration stops on signal alone. Tokio
        // caps the sleep at its own far-future horizon.
        let run_duration = self
            .config
            .duration_seconds
            .map_or(Duration::MAX, |seconds| Duration::from_secs(seconds.get()));
        let start = Instant::now();
        let run_timer = time::sleep(run_duration);
        tokio::pin!(run_timer);
        let shutdown_wait = self.shutdown.cancelled();
        tokio::pin!(shutdown_wait);
        let mut progress = time::interval(Duration::from_secs(1));

        let mut failure: Option<Error> = None;
        loop {
            tokio::select! {
                _ = progress.tick() => {
                    let snapshot = self.state.snapshot();
                    let elapsed = start.elapsed().as_secs_f64();
                    let effective_rate = snapshot.sent as f64 / elapsed.max(f64::EPSILON);
                    gauge!("ballast.running").set(1.0);
                    gauge!("documents_outstanding").set(snapshot.outstanding() as f64);
                    gauge!("effective_rate").set(effective_rate);
                    info!(
                        synthesized = snapshot.synthesized,
                        sent = snapshot.sent,
                        failed = snapshot.failed,
                        retried = snapshot.retried,
                        elapsed_seconds = elapsed,
                        effective_rate,
                        "pipeline progress"
                    );
                }
                () = &mut run_timer => {
                    info!("run duration reached");
                    break;
                }
                () = &mut shutdown_wait => {
                    info!("shutdown signal received");
                    break;
                }
                Some(res) = workers.join_next() => {
                    match res {
                        Ok(Ok(())) => { /* Worker shut down successfully */ }
                        Ok(Err(err)) => {
                            error!("worker exited with error: {err}");
                            failure = Some(err);
                            break;
                        }
                        Err(err) => error!("could not join worker task: {err}"),
                    }
                    if workers.is_empty() {
                        break;
                    }
                }
            }
        }

        self.state.set_phase(Phase::Draining);
        self.shutdown.cancel();
        let drain_timeout = Duration::from_secs(self.config.drain_timeout_seconds.get());
        info!(
            timeout_seconds = drain_timeout.as_secs(),
            "draining workers"
        );
        let drained = time::timeout(drain_timeout, async {
            while let Some(res) = workers.join_next().await {
                match res {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        error!("worker exited with error: {err}");
                        if failure.is_none() {
                            failure = Some(err);
                        }
                    }
                    Err(err) => error!("could not join worker task: {err}"),
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!("drain deadline expired, aborting remaining workers");
            workers.abort_all();
            while workers.join_next().await.is_some() {}
        }

        let shortfall = self.state.reconcile();
        if shortfall > 0 {
            warn!(shortfall, "documents unsettled at shutdown, counted as failed");
        }
        self.state.set_phase(Phase::Stopped);
        let snapshot = self.state.snapshot();
        info!(
            synthesized = snapshot.synthesized,
            sent = snapshot.sent,
            failed = snapshot.failed,
            retried = snapshot.retried,
            "pipeline stopped"
        );

        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

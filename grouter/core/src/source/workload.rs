//! Synthetic Workload Source
//!
//! Drives the routing queue without any clients: each worker repeatedly
//! submits a batch of GETs, waits for every response, and adds the round's
//! wall-clock latency to a running total. Every `report_every` operations the
//! totals go to the stats sink as `tot_workload_ops` and
//! `tot_workload_ops_usecs`, then restart from zero.
//!
//! Workers never stop on their own; cancellation ends them.

use std::time::Instant;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::WorkloadConfig;
use crate::error::SourceError;
use crate::queue::QueueSender;
use crate::request::{Batch, Command, Request};
use crate::stats::{StatsSample, StatsSink};

/// Counter name for completed operations
pub const OPS_COUNTER: &str = "tot_workload_ops";
/// Counter name for accumulated round latency in microseconds
pub const USECS_COUNTER: &str = "tot_workload_ops_usecs";

/// Load generator feeding the routing queue
#[derive(Clone, Debug)]
pub struct WorkloadSource {
    config: WorkloadConfig,
    workers: usize,
    stats: StatsSink,
}

impl WorkloadSource {
    /// Create a generator running `workers` concurrent workers
    #[must_use]
    pub fn new(config: WorkloadConfig, workers: usize, stats: StatsSink) -> Self {
        Self {
            config,
            workers: workers.max(1),
            stats,
        }
    }

    /// Run every worker until `cancel` fires
    ///
    /// # Errors
    ///
    /// [`SourceError::QueueClosed`] if the targets went away; the remaining
    /// workers are stopped first.
    pub async fn run(
        &self,
        queue: QueueSender,
        cancel: CancellationToken,
    ) -> Result<(), SourceError> {
        info!(
            workers = self.workers,
            ops_per_round = self.config.ops_per_round,
            "Workload starting"
        );

        let stop = cancel.child_token();
        let mut tasks = JoinSet::new();
        for id in 0..self.workers {
            let worker = Worker {
                id: u32::try_from(id).unwrap_or(u32::MAX),
                config: self.config.clone(),
                queue: queue.clone(),
                stats: self.stats.clone(),
                cancel: stop.clone(),
            };
            tasks.spawn(worker.run().instrument(info_span!("workload", worker = id)));
        }
        drop(queue);

        let mut result = Ok(());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(error = %e, "Workload worker failed; stopping workload");
                    stop.cancel();
                    if result.is_ok() {
                        result = Err(e);
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Workload worker panicked");
                }
            }
        }

        info!("Workload stopped");
        result
    }
}

struct Worker {
    id: u32,
    config: WorkloadConfig,
    queue: QueueSender,
    stats: StatsSink,
    cancel: CancellationToken,
}

impl Worker {
    async fn run(self) -> Result<(), SourceError> {
        let mut tot_ops: u64 = 0;
        let mut tot_usecs: u64 = 0;

        loop {
            let (batch, pending): (Batch, Vec<_>) = (0..self.config.ops_per_round)
                .map(|_| {
                    let (request, pending) = Request::new(
                        self.config.bucket.clone(),
                        Command::get(self.config.key.as_bytes()),
                    );
                    (request.with_origin(self.id), pending)
                })
                .unzip();

            let started = Instant::now();
            tokio::select! {
                () = self.cancel.cancelled() => return Ok(()),
                submitted = self.queue.submit(batch) => submitted?,
            }

            for pending in pending {
                let outcome = tokio::select! {
                    () = self.cancel.cancelled() => return Ok(()),
                    outcome = pending.wait() => outcome,
                };
                if let Err(e) = outcome {
                    debug!(error = %e, "Workload request failed");
                }
            }

            tot_usecs += u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX);
            tot_ops += self.config.ops_per_round as u64;

            if tot_ops >= self.config.report_every {
                self.stats.record(
                    StatsSample::new()
                        .with(OPS_COUNTER, i64::try_from(tot_ops).unwrap_or(i64::MAX))
                        .with(USECS_COUNTER, i64::try_from(tot_usecs).unwrap_or(i64::MAX)),
                );
                tot_ops = 0;
                tot_usecs = 0;
            }
        }
    }
}

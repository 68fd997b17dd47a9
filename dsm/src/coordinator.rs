//! # Coordinator
//!
//! Runs one broadcast end to end:
//!
//! 1. estimate, create and lay out the region (status chunk + N queues)
//! 2. launch N workers, all or nothing
//! 3. bind each queue's sender to its worker's pid
//! 4. send the same message to every queue
//! 5. hold interrupts, join every worker, mark the status `Finished`,
//!    detach the queues and drop the region
//! 6. resume interrupts; a signal that arrived meanwhile is delivered only
//!    once nothing is left in `/dev/shm`
//!
//! Any failure after the launch stops and reaps the workers before the
//! error is returned, so no worker outlives a failed broadcast.

use crate::error::CoordinatorError;
use crate::interrupts::HoldInterrupts;
use crate::launcher::{LaunchedWorker, ProcessSupervisor, WorkerLauncher};
use crate::worker::WorkerReport;
use dsm_common::config::{CoordinatorConfig, DsmConfig};
use dsm_common::consts::{DSM_KEY_QUEUES, DSM_KEY_STATUS, DSM_MAGIC, MESSAGE_QUEUE_SIZE};
use dsm_common::supervisor::{ExitOutcome, Supervisor, WorkerExit};
use dsm_shared_memory::platform::get_current_pid;
use dsm_shared_memory::{
    Directory, QueueResult, QueueSender, Region, RegionEstimator, RegionHandle, SharedStatus,
    ShmError, StatusSnapshot, create_queues,
};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Outcome of a successful broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Handle the region was created under.
    pub region: RegionHandle,
    /// One record per worker, ordered by index.
    pub reports: Vec<WorkerReport>,
    /// Status as seen after the join.
    pub status: StatusSnapshot,
}

/// Drives broadcasts through a [`Supervisor`].
#[derive(Debug)]
pub struct Coordinator<S: Supervisor> {
    supervisor: S,
    config: CoordinatorConfig,
}

impl<S: Supervisor> Coordinator<S> {
    /// Coordinator using `supervisor` with the limits of `config`.
    pub fn new(supervisor: S, config: CoordinatorConfig) -> Self {
        Self { supervisor, config }
    }

    /// The supervisor, for inspection.
    pub fn supervisor(&self) -> &S {
        &self.supervisor
    }

    /// Send `message` to `worker_count` fresh workers and wait for all of them.
    pub fn broadcast(
        &mut self,
        message: &[u8],
        worker_count: usize,
    ) -> Result<BroadcastReport, CoordinatorError> {
        info!(workers = worker_count, bytes = message.len(), "starting broadcast");

        let (directory, mut senders) = self.setup(worker_count)?;
        let region = directory.region().handle();

        if worker_count == 0 {
            let status: &SharedStatus = directory.get(DSM_KEY_STATUS)?;
            status.set_finished()?;
            info!("no workers requested");
            return Ok(BroadcastReport {
                region,
                reports: Vec::new(),
                status: status.snapshot(),
            });
        }

        let workers = WorkerLauncher::launch(&mut self.supervisor, region, worker_count)?;
        for (sender, worker) in senders.iter_mut().zip(&workers) {
            sender.set_handle(worker.pid);
        }

        if let Err(err) = Self::send_all(&mut senders, &workers, message) {
            error!("broadcast aborted: {err}");
            drop(senders);
            let handles: Vec<_> = workers.iter().map(|w| w.handle).collect();
            WorkerLauncher::stop_all(&mut self.supervisor, &handles);
            return Err(err);
        }

        let hold = match HoldInterrupts::hold() {
            Ok(hold) => hold,
            Err(e) => {
                let handles: Vec<_> = workers.iter().map(|w| w.handle).collect();
                WorkerLauncher::stop_all(&mut self.supervisor, &handles);
                return Err(ShmError::Nix { source: e }.into());
            }
        };
        let released = self.join_and_release(directory, senders, &workers);
        drop(hold);
        let (exits, snapshot) = released?;

        let reports = collect_reports(&workers, exits)?;
        info!(workers = reports.len(), handle = %region, "broadcast complete");
        Ok(BroadcastReport {
            region,
            reports,
            status: snapshot,
        })
    }

    /// Join every worker, then finish the status and release the region.
    ///
    /// The region and the queues are dropped before this returns, on every
    /// path, so the caller can resume interrupts afterwards.
    fn join_and_release(
        &mut self,
        directory: Directory,
        senders: Vec<QueueSender>,
        workers: &[LaunchedWorker],
    ) -> Result<(Vec<WorkerExit>, StatusSnapshot), CoordinatorError> {
        let exits = match self.join(workers) {
            Ok(exits) => exits,
            Err(err) => {
                error!("join failed: {err}");
                return Err(err);
            }
        };

        let status: &SharedStatus = directory.get(DSM_KEY_STATUS)?;
        status.set_finished()?;
        let snapshot = status.snapshot();
        debug!(attached = snapshot.attached_workers, "status finished");

        for sender in senders {
            sender.detach();
        }
        drop(directory);
        Ok((exits, snapshot))
    }

    fn setup(&self, worker_count: usize) -> Result<(Directory, Vec<QueueSender>), CoordinatorError> {
        let mut estimator = RegionEstimator::new();
        estimator.estimate_chunk(size_of::<SharedStatus>())?;
        estimator.estimate_keys(1);
        if worker_count > 0 {
            let queues = worker_count.checked_mul(MESSAGE_QUEUE_SIZE).ok_or_else(|| {
                CoordinatorError::ConfigurationExhausted {
                    reason: format!("{worker_count} queues do not fit in memory"),
                    hint: "reduce the worker count".to_string(),
                }
            })?;
            estimator.estimate_chunk(queues)?;
            estimator.estimate_keys(1);
        }
        let layout = estimator.estimate()?;

        let region = Arc::new(Region::create(layout.total_size, self.config.max_region_size)?);
        let directory = Directory::create(region, DSM_MAGIC, &layout)?;
        let status = SharedStatus::create_in(&directory)?;
        directory.insert(DSM_KEY_STATUS, status)?;

        let mut senders = Vec::new();
        if worker_count > 0 {
            let (chunk, created) = create_queues(&directory, worker_count, get_current_pid())?;
            directory.insert(DSM_KEY_QUEUES, chunk)?;
            senders = created;
        }
        debug!(
            handle = %directory.region().handle(),
            size = layout.total_size,
            "region laid out"
        );
        Ok((directory, senders))
    }

    fn send_all(
        senders: &mut [QueueSender],
        workers: &[LaunchedWorker],
        message: &[u8],
    ) -> Result<(), CoordinatorError> {
        for (sender, worker) in senders.iter_mut().zip(workers) {
            match sender.send(message, true) {
                QueueResult::Success => {
                    debug!(worker = worker.index, pid = worker.pid, "message sent")
                }
                other => {
                    return Err(CoordinatorError::PeerLost {
                        index: worker.index,
                        detail: format!("{other:?}"),
                    });
                }
            }
        }
        Ok(())
    }

    /// Wait for every worker. A failed worker does not stop the wait for
    /// the others; supervisor death does.
    fn join(&mut self, workers: &[LaunchedWorker]) -> Result<Vec<WorkerExit>, CoordinatorError> {
        let mut exits = Vec::with_capacity(workers.len());
        let mut failure = None;

        for (pos, worker) in workers.iter().enumerate() {
            match self.supervisor.wait_exited(worker.handle) {
                Ok(ExitOutcome::Stopped(exit)) => {
                    if !exit.success() {
                        warn!(worker = worker.index, pid = exit.pid, status = %exit.describe(), "worker exited abnormally");
                        failure.get_or_insert(CoordinatorError::WorkerExited {
                            index: worker.index,
                            pid: exit.pid,
                            status: exit.describe(),
                        });
                    }
                    exits.push(exit);
                }
                Ok(ExitOutcome::SupervisorDied) => {
                    for rest in &workers[pos..] {
                        self.supervisor.terminate(rest.handle);
                    }
                    return Err(CoordinatorError::SupervisorDied);
                }
                Err(e) => {
                    warn!(worker = worker.index, "cannot wait on worker: {e}");
                    failure.get_or_insert(CoordinatorError::WorkerExited {
                        index: worker.index,
                        pid: worker.pid,
                        status: e.to_string(),
                    });
                }
            }
        }

        match failure {
            Some(err) => Err(err),
            None => Ok(exits),
        }
    }
}

fn collect_reports(
    workers: &[LaunchedWorker],
    exits: Vec<WorkerExit>,
) -> Result<Vec<WorkerReport>, CoordinatorError> {
    let mut reports = Vec::with_capacity(exits.len());
    for (worker, exit) in workers.iter().zip(exits) {
        let report = WorkerReport::from_output(&exit.output).ok_or_else(|| {
            CoordinatorError::WorkerExited {
                index: worker.index,
                pid: exit.pid,
                status: "exited without a diagnostic record".to_string(),
            }
        })?;
        reports.push(report);
    }
    reports.sort_by_key(|r| r.index);
    Ok(reports)
}

/// Broadcast `message` to `worker_count` workers with default settings.
///
/// Workers are spawned from the running executable, which must dispatch
/// the `worker` subcommand to [`crate::worker::worker_main`] as the `dsm`
/// binary does.
pub fn broadcast(message: &[u8], worker_count: usize) -> Result<(), CoordinatorError> {
    let config = DsmConfig::default();
    let supervisor = ProcessSupervisor::from_config(&config.coordinator)
        .map_err(|e| ShmError::Io { source: e })?;
    Coordinator::new(supervisor, config.coordinator)
        .broadcast(message, worker_count)
        .map(|_| ())
}

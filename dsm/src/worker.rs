//! Worker process runtime.
//!
//! A worker receives exactly two inputs, the region handle and the
//! fixed-width side-channel carrying its index. It attaches the region,
//! finds its own queue, counts itself in, receives one message, reports it
//! and exits.

use crate::error::WorkerError;
use crate::interrupts::unblock_termination;
use dsm_common::consts::{DSM_KEY_QUEUES, DSM_KEY_STATUS, DSM_MAGIC, WORKER_STARTED_TOKEN};
use dsm_common::supervisor::WorkerExtra;
use dsm_shared_memory::platform::get_current_pid;
use dsm_shared_memory::{
    Directory, MessageQueue, Received, Region, RegionHandle, SharedStatus, queue_offset,
};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::io::Write;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Progress of a worker through its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Nothing attached yet.
    Start,
    /// Region mapped.
    RegionAttached,
    /// Directory magic checked.
    DirectoryValidated,
    /// Bound as receiver of its queue.
    QueueBound,
    /// Counted in the shared status.
    CounterIncremented,
    /// The one message has arrived.
    MessageReceived,
    /// Queue and region released. Terminal.
    Detached,
    /// A step failed. Terminal.
    Failed,
}

/// Diagnostic record a worker emits after receiving its message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerReport {
    /// Worker index.
    pub index: u32,
    /// OS process id of the worker.
    pub pid: u32,
    /// Attached-worker count observed when the message arrived.
    pub attached_workers: u32,
    /// Received bytes.
    pub payload: Vec<u8>,
}

impl WorkerReport {
    /// Payload as text, lossy for non UTF-8 bytes.
    pub fn payload_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }

    /// Find the report among the lines a worker wrote to stdout.
    pub fn from_output(output: &[u8]) -> Option<Self> {
        output
            .split(|b| *b == b'\n')
            .filter(|line| !line.is_empty())
            .find_map(|line| serde_json::from_slice(line).ok())
    }
}

/// State machine of one worker.
#[derive(Debug)]
pub struct WorkerRuntime {
    region_handle: RegionHandle,
    extra: WorkerExtra,
    state: WorkerState,
}

impl WorkerRuntime {
    /// Runtime for the worker described by `region_handle` and `extra`.
    pub fn new(region_handle: u32, extra: WorkerExtra) -> Self {
        Self {
            region_handle: RegionHandle::from_raw(region_handle),
            extra,
            state: WorkerState::Start,
        }
    }

    /// Current state.
    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Worker index carried by the side-channel.
    pub fn index(&self) -> u32 {
        self.extra.index()
    }

    fn advance(&mut self, next: WorkerState) {
        debug!(worker = self.index(), from = ?self.state, to = ?next, "worker state");
        self.state = next;
    }

    /// Run every step; ends in `Detached` or `Failed`.
    pub fn run(&mut self) -> Result<WorkerReport, WorkerError> {
        let result = self.run_steps();
        if result.is_err() {
            self.advance(WorkerState::Failed);
        }
        result
    }

    fn run_steps(&mut self) -> Result<WorkerReport, WorkerError> {
        let index = self.index();
        let pid = get_current_pid();

        let region = Arc::new(Region::attach(self.region_handle)?);
        self.advance(WorkerState::RegionAttached);

        let directory = Directory::attach(region, DSM_MAGIC)?;
        self.advance(WorkerState::DirectoryValidated);

        let status: &SharedStatus = directory.get(DSM_KEY_STATUS)?;
        let queues = directory.lookup(DSM_KEY_QUEUES)?;
        let queue = MessageQueue::attach(
            directory.region().clone(),
            queue_offset(queues, index as usize)?,
        )?;
        queue.set_receiver(pid)?;
        let mut receiver = queue.into_receiver()?;
        self.advance(WorkerState::QueueBound);

        status.increment_attached();
        self.advance(WorkerState::CounterIncremented);

        let payload = match receiver.receive(true) {
            Received::Message(bytes) => bytes,
            Received::Detached | Received::WouldBlock => return Err(WorkerError::PeerLost),
        };
        self.advance(WorkerState::MessageReceived);

        let report = WorkerReport {
            index,
            pid,
            attached_workers: status.attached_workers(),
            payload,
        };
        info!(
            worker = index,
            pid,
            attached_workers = report.attached_workers,
            bytes = report.payload.len(),
            "received message: {}",
            report.payload_text()
        );

        receiver.detach();
        drop(directory);
        self.advance(WorkerState::Detached);
        Ok(report)
    }
}

/// Entry point of the `worker` subcommand. Returns the process exit code.
///
/// Stdout carries the startup token and then the JSON report line; logs go
/// to stderr.
pub fn worker_main(region_handle: u32, extra_hex: &str) -> i32 {
    match run_worker(region_handle, extra_hex) {
        Ok(()) => 0,
        Err(e) => {
            error!(handle = region_handle, "background worker failed: {e}");
            1
        }
    }
}

fn run_worker(region_handle: u32, extra_hex: &str) -> Result<(), WorkerError> {
    unblock_termination().map_err(|e| WorkerError::InvalidArgument(e.to_string()))?;

    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{WORKER_STARTED_TOKEN}").map_err(|e| WorkerError::Report(e.to_string()))?;
    stdout
        .flush()
        .map_err(|e| WorkerError::Report(e.to_string()))?;

    let extra =
        WorkerExtra::from_hex(extra_hex).map_err(|e| WorkerError::InvalidArgument(e.to_string()))?;
    let report = WorkerRuntime::new(region_handle, extra).run()?;

    serde_json::to_writer(&mut stdout, &report).map_err(|e| WorkerError::Report(e.to_string()))?;
    writeln!(stdout).map_err(|e| WorkerError::Report(e.to_string()))?;
    stdout
        .flush()
        .map_err(|e| WorkerError::Report(e.to_string()))
}

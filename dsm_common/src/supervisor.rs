//! # Process Supervisor Contract
//!
//! Defines how the coordinator talks to whatever launches worker processes.
//! The `dsm` crate implements [`Supervisor`] on top of `std::process`; tests
//! implement it in-process.
//!
//! # Design
//!
//! A supervisor owns a fixed number of worker slots. Registering a worker
//! takes a slot and returns a [`WorkerHandle`] naming the slot and its
//! generation, so a handle outliving its process can never alias a newer
//! worker in the same slot. All calls are synchronous and return a
//! discriminated outcome; the "overseer died" case is always distinguishable.

use crate::consts::WORKER_EXTRA_LEN;
use std::fmt;

/// Fixed-width binary side-channel handed to a worker at launch.
///
/// The worker index is stored little-endian in the first four bytes; the
/// rest is zero. On the command line the field travels as lowercase hex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerExtra([u8; WORKER_EXTRA_LEN]);

impl WorkerExtra {
    /// Encode a worker index.
    pub fn from_index(index: u32) -> Self {
        let mut bytes = [0u8; WORKER_EXTRA_LEN];
        bytes[..4].copy_from_slice(&index.to_le_bytes());
        Self(bytes)
    }

    /// Decode the worker index.
    pub fn index(&self) -> u32 {
        u32::from_le_bytes([self.0[0], self.0[1], self.0[2], self.0[3]])
    }

    /// Raw field contents.
    pub fn as_bytes(&self) -> &[u8; WORKER_EXTRA_LEN] {
        &self.0
    }

    /// Hex encoding used on the worker command line.
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }

    /// Parse the hex form produced by [`WorkerExtra::to_hex`].
    pub fn from_hex(text: &str) -> Result<Self, SupervisorError> {
        if text.len() != WORKER_EXTRA_LEN * 2 || !text.is_ascii() {
            return Err(SupervisorError::InvalidExtra(format!(
                "expected {} hex digits, got {:?}",
                WORKER_EXTRA_LEN * 2,
                text
            )));
        }
        let mut bytes = [0u8; WORKER_EXTRA_LEN];
        for (i, byte) in bytes.iter_mut().enumerate() {
            let pair = &text[i * 2..i * 2 + 2];
            *byte = u8::from_str_radix(pair, 16)
                .map_err(|e| SupervisorError::InvalidExtra(format!("{pair:?}: {e}")))?;
        }
        Ok(Self(bytes))
    }
}

/// Everything a worker process receives: region handle and side-channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerRequest {
    /// Opaque numeric handle of the shared region.
    pub region_handle: u32,
    /// Fixed-width binary field carrying the worker index.
    pub extra: WorkerExtra,
}

impl WorkerRequest {
    /// Request for worker `index` attached to `region_handle`.
    pub fn new(region_handle: u32, index: u32) -> Self {
        Self {
            region_handle,
            extra: WorkerExtra::from_index(index),
        }
    }
}

/// Supervisor-issued reference to a registered worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkerHandle {
    /// Slot index inside the supervisor.
    pub slot: usize,
    /// Generation of the slot when the worker was registered.
    pub generation: u64,
}

impl fmt::Display for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot {}/gen {}", self.slot, self.generation)
    }
}

/// Result of [`Supervisor::wait_started`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    /// The worker is running its entry point.
    Started {
        /// OS process id of the worker.
        pid: u32,
    },
    /// The worker exited before reporting startup.
    Stopped,
    /// Startup could not be confirmed.
    Failed(String),
    /// The overseeing process went away while waiting.
    SupervisorDied,
}

/// How a worker process ended, plus everything it wrote to stdout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerExit {
    /// OS process id of the worker.
    pub pid: u32,
    /// Exit code, if the process exited normally.
    pub code: Option<i32>,
    /// Terminating signal, if the process was killed.
    pub signal: Option<i32>,
    /// Bytes the worker wrote to stdout after its startup token.
    pub output: Vec<u8>,
}

impl WorkerExit {
    /// True for a zero exit code.
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Human readable exit status.
    pub fn describe(&self) -> String {
        match (self.code, self.signal) {
            (Some(code), _) => format!("exit code {code}"),
            (None, Some(signal)) => format!("terminated by signal {signal}"),
            (None, None) => "unknown exit status".to_string(),
        }
    }
}

/// Result of [`Supervisor::wait_exited`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitOutcome {
    /// The worker is gone and its slot released.
    Stopped(WorkerExit),
    /// The overseeing process went away while waiting.
    SupervisorDied,
}

/// Error type for supervisor operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SupervisorError {
    /// Every worker slot is taken.
    #[error("all {max} worker slots are in use")]
    SlotsExhausted {
        /// Configured slot count.
        max: usize,
    },

    /// The OS refused to create the process.
    #[error("failed to spawn worker process: {reason}")]
    SpawnFailed {
        /// OS error text.
        reason: String,
        /// True when the OS reported a resource limit (EAGAIN, ENOMEM).
        resource_limit: bool,
    },

    /// The handle does not name a live registration.
    #[error("unknown worker handle {0}")]
    InvalidHandle(WorkerHandle),

    /// The side-channel field could not be decoded.
    #[error("invalid worker side-channel: {0}")]
    InvalidExtra(String),
}

impl SupervisorError {
    /// True when registration failed because of a resource limit.
    pub fn is_resource_exhaustion(&self) -> bool {
        match self {
            Self::SlotsExhausted { .. } => true,
            Self::SpawnFailed { resource_limit, .. } => *resource_limit,
            _ => false,
        }
    }
}

/// Supervisor contract for worker process lifecycle management.
///
/// # Example
///
/// ```rust,ignore
/// struct MySupervisor { /* ... */ }
///
/// impl Supervisor for MySupervisor {
///     fn register(&mut self, request: &WorkerRequest)
///         -> Result<WorkerHandle, SupervisorError> { /* ... */ }
///     fn wait_started(&mut self, handle: WorkerHandle) -> StartOutcome { /* ... */ }
///     fn wait_exited(&mut self, handle: WorkerHandle)
///         -> Result<ExitOutcome, SupervisorError> { /* ... */ }
///     fn terminate(&mut self, handle: WorkerHandle) { /* ... */ }
/// }
/// ```
pub trait Supervisor {
    /// Take a slot and spawn a worker for `request`.
    fn register(&mut self, request: &WorkerRequest) -> Result<WorkerHandle, SupervisorError>;

    /// Block until the worker reports that its entry point is running.
    fn wait_started(&mut self, handle: WorkerHandle) -> StartOutcome;

    /// Block until the worker has exited, then release its slot.
    fn wait_exited(&mut self, handle: WorkerHandle) -> Result<ExitOutcome, SupervisorError>;

    /// Ask a worker to stop. Does not wait; follow with `wait_exited`.
    fn terminate(&mut self, handle: WorkerHandle);
}

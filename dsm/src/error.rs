//! Error types of the coordinator and the worker runtime.

use dsm_common::config::ConfigError;
use dsm_shared_memory::ShmError;
use thiserror::Error;

/// Failures of a broadcast, as seen by the coordinator.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// Region creation or worker registration hit a resource limit.
    #[error("{reason} (hint: {hint})")]
    ConfigurationExhausted {
        /// What could not be obtained.
        reason: String,
        /// Remediation for the operator.
        hint: String,
    },

    /// The region does not have the expected layout.
    #[error("shared memory protocol mismatch: {0}")]
    ProtocolMismatch(ShmError),

    /// A queue peer detached or died during the broadcast.
    #[error("could not send message to shared-memory queue of worker {index}: {detail}")]
    PeerLost {
        /// Worker index.
        index: usize,
        /// What the queue reported.
        detail: String,
    },

    /// The overseeing process went away while waiting on workers.
    #[error("supervisor terminated while waiting for background workers")]
    SupervisorDied,

    /// A worker ended abnormally.
    #[error("background worker {index} (pid {pid}) exited abnormally: {status}")]
    WorkerExited {
        /// Worker index.
        index: usize,
        /// OS process id.
        pid: u32,
        /// Exit code or signal.
        status: String,
    },

    /// Other shared memory failure.
    #[error(transparent)]
    Shm(ShmError),

    /// Configuration could not be loaded.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl CoordinatorError {
    /// True for the administrative-shutdown class: nothing can be salvaged.
    pub fn is_fatal_admin_shutdown(&self) -> bool {
        matches!(self, Self::SupervisorDied)
    }

    /// Remediation hint, when there is one.
    pub fn hint(&self) -> Option<&str> {
        match self {
            Self::ConfigurationExhausted { hint, .. } => Some(hint),
            _ => None,
        }
    }
}

impl From<ShmError> for CoordinatorError {
    fn from(err: ShmError) -> Self {
        match err {
            ShmError::ResourceExhausted { .. } => Self::ConfigurationExhausted {
                reason: format!("could not create dynamic shared memory segment: {err}"),
                hint: "reduce the worker count or raise max_region_size".to_string(),
            },
            err if err.is_protocol_mismatch() => Self::ProtocolMismatch(err),
            err => Self::Shm(err),
        }
    }
}

/// Failures inside a worker process. Fatal to that worker only.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// The region handle names no region.
    #[error("could not map dynamic shared memory segment: {0}")]
    NotFound(ShmError),

    /// The region is not ours or is missing a key.
    #[error("bad magic number in dynamic shared memory segment: {0}")]
    ProtocolMismatch(ShmError),

    /// The coordinator detached before the message arrived.
    #[error("message queue peer detached before a message arrived")]
    PeerLost,

    /// Command line input could not be decoded.
    #[error("invalid worker argument: {0}")]
    InvalidArgument(String),

    /// Other shared memory failure.
    #[error(transparent)]
    Shm(ShmError),

    /// The diagnostic record could not be written.
    #[error("failed to write diagnostic record: {0}")]
    Report(String),
}

impl From<ShmError> for WorkerError {
    fn from(err: ShmError) -> Self {
        match err {
            ShmError::NotFound { .. } => Self::NotFound(err),
            err if err.is_protocol_mismatch() => Self::ProtocolMismatch(err),
            err => Self::Shm(err),
        }
    }
}

//! Prelude module for common re-exports.
//!
//! ```rust
//! use dsm_common::prelude::*;
//! ```

// ─── Configuration ──────────────────────────────────────────────────
pub use crate::config::{
    ConfigError, ConfigLoader, CoordinatorConfig, DsmConfig, LogLevel, SharedConfig,
};

// ─── Layout Constants ───────────────────────────────────────────────
pub use crate::consts::{DSM_KEY_QUEUES, DSM_KEY_STATUS, DSM_MAGIC, MESSAGE_QUEUE_SIZE};

// ─── Supervisor ─────────────────────────────────────────────────────
pub use crate::supervisor::{
    ExitOutcome, StartOutcome, Supervisor, SupervisorError, WorkerExit, WorkerExtra,
    WorkerHandle, WorkerRequest,
};

//! # DSM Broadcast
//!
//! A coordinator process creates one shared memory region per operation,
//! lays out a status object and one message queue per worker, launches the
//! workers through a [`Supervisor`](dsm_common::supervisor::Supervisor),
//! sends every worker the same message and waits for all of them to exit.
//!
//! ```text
//! coordinator ──create──► region [directory | status | queue 0 .. queue N-1]
//!      │                              ▲            ▲
//!      ├──launch──► worker 0 ─attach──┘   receive ─┘
//!      ├──send────► queue i
//!      └──join────► every worker exited → status Finished → region unlinked
//! ```
//!
//! The `dsm` binary wraps [`broadcast`] and doubles as the worker program
//! through its hidden `worker` subcommand.

pub mod coordinator;
pub mod error;
pub mod interrupts;
pub mod launcher;
pub mod worker;

pub use coordinator::{BroadcastReport, Coordinator, broadcast};
pub use error::{CoordinatorError, WorkerError};
pub use interrupts::HoldInterrupts;
pub use launcher::{LaunchedWorker, ProcessSupervisor, WorkerLauncher};
pub use worker::{WorkerReport, WorkerRuntime, WorkerState, worker_main};

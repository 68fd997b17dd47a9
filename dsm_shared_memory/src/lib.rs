//! # DSM Shared Memory
//!
//! Dynamic shared memory for one coordinator process and its workers. A
//! region is created per parallel operation, described by a keyed
//! directory, and torn down when the coordinator drops it.
//!
//! ## Building blocks
//!
//! - [`Region`]: a file under `/dev/shm` mapped by every participant,
//!   named by an opaque [`RegionHandle`]
//! - [`Directory`]: magic-tagged table of contents at offset 0, mapping
//!   keys to cache-line aligned chunks; sized up front by [`RegionEstimator`]
//! - [`SharedStatus`]: lifecycle flag plus a lock-protected attach counter
//! - [`mq`]: single-producer single-consumer byte queues with blocking and
//!   resumable non-blocking operation and peer-death detection
//!
//! ## Layout
//!
//! ```text
//! ┌──────────────┬───────────────┬──────────────┬──────────────────────────┐
//! │ Directory    │ Entries[cap]  │ SharedStatus │ Queue 0 │ Queue 1 │ ...  │
//! │ magic, sizes │ key→(off,len) │ 64 bytes     │ 16 KiB each              │
//! └──────────────┴───────────────┴──────────────┴──────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,no_run
//! use dsm_shared_memory::{Directory, Region, RegionEstimator, SharedStatus};
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), dsm_shared_memory::ShmError> {
//! let mut estimator = RegionEstimator::new();
//! estimator.estimate_chunk(size_of::<SharedStatus>())?;
//! estimator.estimate_keys(1);
//! let layout = estimator.estimate()?;
//!
//! let region = Arc::new(Region::create(layout.total_size, 1 << 30)?);
//! let directory = Directory::create(region, 0x7157_8a3b, &layout)?;
//! let chunk = SharedStatus::create_in(&directory)?;
//! directory.insert(1, chunk)?;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod mq;
pub mod platform;
pub mod region;
pub mod status;
pub mod toc;

pub use error::{ShmError, ShmResult};
pub use mq::{
    MessageQueue, QueueReceiver, QueueResult, QueueSender, Received, create_queues, queue_offset,
};
pub use region::{Region, RegionHandle, SharedMemorySafe};
pub use status::{ParallelStatus, SharedStatus, StatusSnapshot};
pub use toc::{Chunk, Directory, RegionEstimator, RegionLayout};

/// Initialize tracing for processes that only use this crate
pub fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}

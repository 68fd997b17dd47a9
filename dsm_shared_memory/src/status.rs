//! Shared status object: lifecycle flag plus attached-worker counter.

use crate::error::{ShmError, ShmResult};
use crate::region::SharedMemorySafe;
use crate::toc::{Chunk, Directory};
use dsm::consts::CACHE_LINE_SIZE;
use static_assertions::const_assert_eq;
use std::sync::atomic::{AtomicU32, Ordering};

/// Lifecycle of a parallel operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ParallelStatus {
    /// Workers may still be running.
    Initial = 0,
    /// The coordinator has joined every worker.
    Finished = 1,
}

impl ParallelStatus {
    fn from_raw(raw: u32) -> Self {
        if raw == Self::Finished as u32 {
            Self::Finished
        } else {
            Self::Initial
        }
    }
}

/// Point-in-time copy of a [`SharedStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusSnapshot {
    /// Lifecycle flag.
    pub status: ParallelStatus,
    /// Workers that have attached so far.
    pub attached_workers: u32,
}

/// Status record stored in its own chunk.
#[repr(C, align(64))]
pub struct SharedStatus {
    status: AtomicU32,
    attached_workers: spin::Mutex<u32>,
}

const_assert_eq!(size_of::<SharedStatus>(), CACHE_LINE_SIZE);

unsafe impl SharedMemorySafe for SharedStatus {}

impl Default for SharedStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedStatus {
    /// Status in `Initial` with no attached workers.
    pub const fn new() -> Self {
        Self {
            status: AtomicU32::new(ParallelStatus::Initial as u32),
            attached_workers: spin::Mutex::new(0),
        }
    }

    /// Allocate a chunk for the status and initialize it there.
    ///
    /// The caller publishes the returned chunk under its key.
    pub fn create_in(directory: &Directory) -> ShmResult<Chunk> {
        let chunk = directory.allocate(size_of::<Self>())?;
        // A fresh chunk is not referenced by anyone yet
        let status = unsafe { directory.region().write(chunk.offset, Self::new())? };
        status.init();
        Ok(chunk)
    }

    /// Reset to `Initial` with zero attached workers.
    pub fn init(&self) {
        *self.attached_workers.lock() = 0;
        self.status
            .store(ParallelStatus::Initial as u32, Ordering::Release);
    }

    /// Count one more attached worker and return the new total.
    pub fn increment_attached(&self) -> u32 {
        let mut attached = self.attached_workers.lock();
        *attached += 1;
        *attached
    }

    /// Move `Initial` to `Finished`. Happens at most once.
    pub fn set_finished(&self) -> ShmResult<()> {
        self.status
            .compare_exchange(
                ParallelStatus::Initial as u32,
                ParallelStatus::Finished as u32,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ())
            .map_err(|_| ShmError::StatusAlreadyFinished)
    }

    /// Current lifecycle flag.
    pub fn status(&self) -> ParallelStatus {
        ParallelStatus::from_raw(self.status.load(Ordering::Acquire))
    }

    /// Workers attached so far.
    pub fn attached_workers(&self) -> u32 {
        *self.attached_workers.lock()
    }

    /// Copy both fields.
    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            status: self.status(),
            attached_workers: self.attached_workers(),
        }
    }
}

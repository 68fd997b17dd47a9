//! Shared memory region backed by a file under `/dev/shm`

use crate::error::{ShmError, ShmResult};
use crate::platform::{create_region_file, get_current_pid, map_region, open_region_file};
use dsm::consts::{SHM_DIR, SHM_PREFIX};
use memmap2::MmapMut;
use std::fmt;
use std::path::PathBuf;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Attempts at finding an unused handle before giving up.
const HANDLE_ATTEMPTS: usize = 16;

/// Opaque numeric name of a region, passed to workers on their command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegionHandle(u32);

impl RegionHandle {
    /// Wrap a raw handle value.
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw handle value.
    pub const fn as_raw(self) -> u32 {
        self.0
    }

    /// Backing file path of this handle.
    pub fn path(self) -> PathBuf {
        PathBuf::from(SHM_DIR).join(format!("{SHM_PREFIX}{:08x}", self.0))
    }

    fn generate(attempt: usize) -> Self {
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or(0);
        let count = COUNTER.fetch_add(1, Ordering::Relaxed);
        let raw = get_current_pid().rotate_left(16)
            ^ nanos
            ^ count.wrapping_mul(0x9E37_79B9)
            ^ attempt as u32;
        Self(raw.max(1))
    }
}

impl fmt::Display for RegionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// Marker for types that may be placed inside a region.
///
/// # Safety
///
/// Implementors must be `#[repr(C)]`, contain no pointers or references,
/// and mutate only through atomics or lock types built on atomics, because
/// other processes map the same bytes at different addresses.
pub unsafe trait SharedMemorySafe: Sync {}

/// A mapped region. Shared between the directory and the queues by `Arc`.
///
/// The creating process unlinks the backing file on drop; an attacher only
/// unmaps.
pub struct Region {
    handle: RegionHandle,
    path: PathBuf,
    size: usize,
    owner: bool,
    base: NonNull<u8>,
    _mmap: MmapMut,
}

// The mapping is never remapped or resized; access goes through atomics.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// Create a region of `size` bytes under a fresh handle.
    ///
    /// Returns `ResourceExhausted` when `size` exceeds `max_size` or the
    /// system cannot provide the memory.
    pub fn create(size: usize, max_size: usize) -> ShmResult<Self> {
        if size == 0 {
            return Err(ShmError::InvalidSize { size });
        }
        if size > max_size {
            return Err(ShmError::ResourceExhausted {
                requested: size,
                reason: format!("exceeds region size limit of {max_size} bytes"),
            });
        }

        let mut attempt = 0;
        let (handle, path, file) = loop {
            let handle = RegionHandle::generate(attempt);
            let path = handle.path();
            match create_region_file(&path, size) {
                Ok(file) => break (handle, path, file),
                Err(ShmError::AlreadyExists { name }) if attempt + 1 < HANDLE_ATTEMPTS => {
                    tracing::debug!(%name, "region handle collision, retrying");
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        };

        let mut mmap = match map_region(&file) {
            Ok(mmap) => mmap,
            Err(err) => {
                let _ = std::fs::remove_file(&path);
                return Err(err);
            }
        };
        let base = NonNull::new(mmap.as_mut_ptr()).ok_or(ShmError::InvalidSize { size })?;

        tracing::debug!(%handle, size, "region created");
        Ok(Self {
            handle,
            path,
            size,
            owner: true,
            base,
            _mmap: mmap,
        })
    }

    /// Map an existing region by handle.
    pub fn attach(handle: RegionHandle) -> ShmResult<Self> {
        let path = handle.path();
        let file = open_region_file(&path)?;
        let mut mmap = map_region(&file)?;
        let size = mmap.len();
        let base = NonNull::new(mmap.as_mut_ptr()).ok_or(ShmError::InvalidSize { size })?;

        tracing::debug!(%handle, size, "region attached");
        Ok(Self {
            handle,
            path,
            size,
            owner: false,
            base,
            _mmap: mmap,
        })
    }

    /// Handle other processes attach with.
    pub fn handle(&self) -> RegionHandle {
        self.handle
    }

    /// Mapped size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// True in the process that created the region.
    pub fn is_owner(&self) -> bool {
        self.owner
    }

    fn check_range(&self, offset: usize, len: usize, align: usize) -> ShmResult<()> {
        let end = offset.checked_add(len).ok_or(ShmError::OutOfBounds {
            offset,
            len,
            size: self.size,
        })?;
        if end > self.size {
            return Err(ShmError::OutOfBounds {
                offset,
                len,
                size: self.size,
            });
        }
        // The mapping base is page aligned
        if offset % align != 0 {
            return Err(ShmError::AlignmentError {
                offset,
                alignment: align,
            });
        }
        Ok(())
    }

    /// Reference a `T` already initialized at `offset`.
    pub fn get<T: SharedMemorySafe>(&self, offset: usize) -> ShmResult<&T> {
        self.check_range(offset, size_of::<T>(), align_of::<T>())?;
        Ok(unsafe { &*(self.base.as_ptr().add(offset) as *const T) })
    }

    /// Write `value` at `offset` and return a reference to it.
    ///
    /// # Safety
    ///
    /// No other reference, in this or any process, may point into
    /// `offset..offset + size_of::<T>()` during the call.
    pub(crate) unsafe fn write<T: SharedMemorySafe>(&self, offset: usize, value: T) -> ShmResult<&T> {
        self.check_range(offset, size_of::<T>(), align_of::<T>())?;
        let ptr = unsafe { self.base.as_ptr().add(offset) as *mut T };
        unsafe {
            ptr.write(value);
            Ok(&*ptr)
        }
    }

    /// Raw pointer to `len` bytes at `offset`.
    pub(crate) fn bytes(&self, offset: usize, len: usize) -> ShmResult<NonNull<u8>> {
        self.check_range(offset, len, 1)?;
        // In bounds of a non-null mapping
        Ok(unsafe { NonNull::new_unchecked(self.base.as_ptr().add(offset)) })
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        if self.owner {
            if let Err(e) = std::fs::remove_file(&self.path) {
                tracing::warn!(handle = %self.handle, "failed to unlink region: {e}");
            } else {
                tracing::debug!(handle = %self.handle, "region unlinked");
            }
        }
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("handle", &self.handle)
            .field("size", &self.size)
            .field("owner", &self.owner)
            .finish()
    }
}

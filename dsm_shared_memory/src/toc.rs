//! Keyed directory of chunks inside a region.
//!
//! # Layout
//!
//! ```text
//! 0                 DirectoryHeader (magic, sizes, capacity, entry count)
//! 32                DirectoryEntry[capacity]
//! align_up(.., 64)  chunk area, allocated front to back
//! ```
//!
//! The creator sizes the region with [`RegionEstimator`], then replays the
//! same requests through [`Directory::allocate`]. Entries are published by
//! bumping `nentry` with release ordering, so a lookup that observes an
//! entry also observes everything written to its chunk before the insert.

use crate::error::{ShmError, ShmResult};
use crate::region::{Region, SharedMemorySafe};
use dsm::consts::CACHE_LINE_SIZE;
use static_assertions::const_assert_eq;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Maximum number of chunks the estimator accepts.
pub const MAX_DIRECTORY_CHUNKS: usize = 16;

/// Round `value` up to a multiple of `align` (a power of two).
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

fn checked_align_up(value: usize, align: usize) -> Option<usize> {
    value.checked_add(align - 1).map(|v| v & !(align - 1))
}

/// Directory header at offset 0 of every region.
#[repr(C)]
pub struct DirectoryHeader {
    magic: AtomicU64,
    total_bytes: AtomicU64,
    allocated_bytes: AtomicU64,
    capacity: AtomicU32,
    nentry: AtomicU32,
}

/// One key to byte-range mapping.
#[repr(C)]
pub struct DirectoryEntry {
    key: AtomicU64,
    offset: AtomicU64,
    len: AtomicU64,
}

const_assert_eq!(size_of::<DirectoryHeader>(), 32);
const_assert_eq!(size_of::<DirectoryEntry>(), 24);

unsafe impl SharedMemorySafe for DirectoryHeader {}
unsafe impl SharedMemorySafe for DirectoryEntry {}

/// Byte range of a chunk inside the region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    /// Offset from the start of the region.
    pub offset: usize,
    /// Length requested at allocation.
    pub len: usize,
}

#[derive(Debug, Clone, Copy)]
struct ChunkRequest {
    size: usize,
}

/// Exact size of a region with `capacity` keys and the given chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionLayout {
    /// Bytes the region must be created with.
    pub total_size: usize,
    /// Directory slots reserved.
    pub key_capacity: usize,
    /// First byte of the chunk area.
    pub chunk_start: usize,
}

/// Collects chunk and key requests before the region exists.
#[derive(Debug, Default)]
pub struct RegionEstimator {
    chunks: heapless::Vec<ChunkRequest, MAX_DIRECTORY_CHUNKS>,
    keys: usize,
}

impl RegionEstimator {
    /// Empty estimator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a chunk of `size` bytes.
    pub fn estimate_chunk(&mut self, size: usize) -> ShmResult<()> {
        self.chunks
            .push(ChunkRequest { size })
            .map_err(|_| ShmError::TooManyChunks {
                max: MAX_DIRECTORY_CHUNKS,
            })
    }

    /// Declare `count` directory keys.
    pub fn estimate_keys(&mut self, count: usize) {
        self.keys += count;
    }

    /// Total size the allocation replay will need.
    pub fn estimate(&self) -> ShmResult<RegionLayout> {
        let overflow = || ShmError::ResourceExhausted {
            requested: usize::MAX,
            reason: "region size overflows the address space".to_string(),
        };

        let directory = self
            .keys
            .checked_mul(size_of::<DirectoryEntry>())
            .and_then(|entries| entries.checked_add(size_of::<DirectoryHeader>()))
            .ok_or_else(overflow)?;
        let chunk_start = checked_align_up(directory, CACHE_LINE_SIZE).ok_or_else(overflow)?;

        let mut total = chunk_start;
        for chunk in &self.chunks {
            let aligned = checked_align_up(chunk.size, CACHE_LINE_SIZE).ok_or_else(overflow)?;
            total = total.checked_add(aligned).ok_or_else(overflow)?;
        }

        Ok(RegionLayout {
            total_size: total,
            key_capacity: self.keys,
            chunk_start,
        })
    }
}

/// Handle to the directory of a region.
#[derive(Debug, Clone)]
pub struct Directory {
    region: Arc<Region>,
}

impl Directory {
    /// Write a fresh directory into a newly created region.
    pub fn create(region: Arc<Region>, magic: u64, layout: &RegionLayout) -> ShmResult<Self> {
        if layout.total_size > region.size() {
            return Err(ShmError::InvalidSize {
                size: layout.total_size,
            });
        }
        if layout.key_capacity > u32::MAX as usize {
            return Err(ShmError::DirectoryFull {
                capacity: layout.key_capacity,
            });
        }

        let header = region.get::<DirectoryHeader>(0)?;
        let found = header.magic.load(Ordering::Acquire);
        if found != 0 {
            return Err(ShmError::AlreadyExists {
                name: region.handle().path().display().to_string(),
            });
        }

        header
            .total_bytes
            .store(layout.total_size as u64, Ordering::Relaxed);
        header
            .allocated_bytes
            .store(layout.chunk_start as u64, Ordering::Relaxed);
        header
            .capacity
            .store(layout.key_capacity as u32, Ordering::Relaxed);
        header.nentry.store(0, Ordering::Relaxed);
        header.magic.store(magic, Ordering::Release);

        tracing::debug!(
            handle = %region.handle(),
            total = layout.total_size,
            keys = layout.key_capacity,
            "directory created"
        );
        Ok(Self { region })
    }

    /// Validate and adopt the directory of an attached region.
    pub fn attach(region: Arc<Region>, magic: u64) -> ShmResult<Self> {
        let header = region.get::<DirectoryHeader>(0)?;
        let found = header.magic.load(Ordering::Acquire);
        if found != magic {
            return Err(ShmError::InvalidMagic {
                expected: magic,
                found,
            });
        }
        let total = header.total_bytes.load(Ordering::Relaxed) as usize;
        if total > region.size() {
            return Err(ShmError::InvalidSize { size: total });
        }
        Ok(Self { region })
    }

    /// Region the directory lives in.
    pub fn region(&self) -> &Arc<Region> {
        &self.region
    }

    fn header(&self) -> ShmResult<&DirectoryHeader> {
        self.region.get(0)
    }

    fn entry(&self, index: usize) -> ShmResult<&DirectoryEntry> {
        self.region
            .get(size_of::<DirectoryHeader>() + index * size_of::<DirectoryEntry>())
    }

    /// Carve the next cache-line aligned chunk of `size` bytes.
    pub fn allocate(&self, size: usize) -> ShmResult<Chunk> {
        let header = self.header()?;
        let total = header.total_bytes.load(Ordering::Relaxed) as usize;
        let aligned = checked_align_up(size, CACHE_LINE_SIZE).ok_or(ShmError::LayoutOverflow {
            requested: size,
            remaining: 0,
        })?;

        let mut offset = 0;
        header
            .allocated_bytes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |allocated| {
                let allocated = allocated as usize;
                offset = allocated;
                allocated
                    .checked_add(aligned)
                    .filter(|end| *end <= total)
                    .map(|end| end as u64)
            })
            .map_err(|allocated| ShmError::LayoutOverflow {
                requested: aligned,
                remaining: total.saturating_sub(allocated as usize),
            })?;

        Ok(Chunk { offset, len: size })
    }

    /// Publish `chunk` under `key`.
    pub fn insert(&self, key: u64, chunk: Chunk) -> ShmResult<()> {
        let header = self.header()?;
        let capacity = header.capacity.load(Ordering::Relaxed) as usize;
        let count = header.nentry.load(Ordering::Acquire) as usize;

        for index in 0..count {
            if self.entry(index)?.key.load(Ordering::Relaxed) == key {
                return Err(ShmError::DuplicateKey { key });
            }
        }
        if count >= capacity {
            return Err(ShmError::DirectoryFull { capacity });
        }
        let total = header.total_bytes.load(Ordering::Relaxed) as usize;
        if chunk.offset.checked_add(chunk.len).is_none_or(|end| end > total) {
            return Err(ShmError::OutOfBounds {
                offset: chunk.offset,
                len: chunk.len,
                size: total,
            });
        }

        let entry = self.entry(count)?;
        entry.key.store(key, Ordering::Relaxed);
        entry.offset.store(chunk.offset as u64, Ordering::Relaxed);
        entry.len.store(chunk.len as u64, Ordering::Relaxed);
        header.nentry.store(count as u32 + 1, Ordering::Release);
        Ok(())
    }

    /// Find the chunk published under `key`.
    pub fn lookup(&self, key: u64) -> ShmResult<Chunk> {
        let count = self.header()?.nentry.load(Ordering::Acquire) as usize;
        for index in 0..count {
            let entry = self.entry(index)?;
            if entry.key.load(Ordering::Relaxed) == key {
                return Ok(Chunk {
                    offset: entry.offset.load(Ordering::Relaxed) as usize,
                    len: entry.len.load(Ordering::Relaxed) as usize,
                });
            }
        }
        Err(ShmError::KeyNotFound { key })
    }

    /// Look up `key` and reference the `T` stored at the start of its chunk.
    pub fn get<T: SharedMemorySafe>(&self, key: u64) -> ShmResult<&T> {
        let chunk = self.lookup(key)?;
        if chunk.len < size_of::<T>() {
            return Err(ShmError::OutOfBounds {
                offset: chunk.offset,
                len: size_of::<T>(),
                size: chunk.offset + chunk.len,
            });
        }
        self.region.get(chunk.offset)
    }

    /// Bytes handed out so far, directory included.
    pub fn allocated_bytes(&self) -> ShmResult<usize> {
        Ok(self.header()?.allocated_bytes.load(Ordering::Acquire) as usize)
    }

    /// Number of published entries.
    pub fn entry_count(&self) -> ShmResult<usize> {
        Ok(self.header()?.nentry.load(Ordering::Acquire) as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dsm::consts::{DSM_MAGIC, SHM_MAX_SIZE};

    fn build(chunks: &[usize], keys: usize) -> (RegionLayout, Directory) {
        let mut estimator = RegionEstimator::new();
        for size in chunks {
            estimator.estimate_chunk(*size).unwrap();
        }
        estimator.estimate_keys(keys);
        let layout = estimator.estimate().unwrap();
        let region = Arc::new(Region::create(layout.total_size, SHM_MAX_SIZE).unwrap());
        let directory = Directory::create(region, DSM_MAGIC, &layout).unwrap();
        (layout, directory)
    }

    #[test]
    fn estimate_matches_replay_exactly() {
        let sizes = [1, 64, 100, 16 * 1024 * 3];
        let (layout, directory) = build(&sizes, sizes.len());

        let mut previous_end = layout.chunk_start;
        for (i, size) in sizes.iter().enumerate() {
            let chunk = directory.allocate(*size).unwrap();
            assert_eq!(chunk.offset % CACHE_LINE_SIZE, 0);
            assert_eq!(chunk.offset, previous_end);
            previous_end = chunk.offset + align_up(*size, CACHE_LINE_SIZE);
            directory.insert(i as u64, chunk).unwrap();
        }
        assert_eq!(directory.allocated_bytes().unwrap(), layout.total_size);
        assert_eq!(directory.entry_count().unwrap(), sizes.len());
    }

    #[test]
    fn allocation_past_estimate_overflows() {
        let (_, directory) = build(&[128], 1);
        directory.allocate(128).unwrap();
        assert!(matches!(
            directory.allocate(1),
            Err(ShmError::LayoutOverflow { requested: 64, .. })
        ));
    }

    #[test]
    fn chunk_area_starts_on_cache_line() {
        let mut estimator = RegionEstimator::new();
        estimator.estimate_keys(2);
        let layout = estimator.estimate().unwrap();
        assert_eq!(layout.chunk_start, 128);
        assert_eq!(layout.total_size, 128);
    }

    #[test]
    fn estimator_capacity_is_bounded() {
        let mut estimator = RegionEstimator::new();
        for _ in 0..MAX_DIRECTORY_CHUNKS {
            estimator.estimate_chunk(8).unwrap();
        }
        assert!(matches!(
            estimator.estimate_chunk(8),
            Err(ShmError::TooManyChunks { .. })
        ));
    }

    #[test]
    fn estimate_overflow_is_resource_exhaustion() {
        let mut estimator = RegionEstimator::new();
        estimator.estimate_chunk(usize::MAX - 10).unwrap();
        assert!(matches!(
            estimator.estimate(),
            Err(ShmError::ResourceExhausted { .. })
        ));
    }

    #[test]
    fn lookup_missing_and_duplicate_keys() {
        let (_, directory) = build(&[64, 64], 2);
        let chunk = directory.allocate(64).unwrap();
        directory.insert(7, chunk).unwrap();
        assert_eq!(directory.lookup(7).unwrap(), chunk);
        assert!(matches!(
            directory.lookup(8),
            Err(ShmError::KeyNotFound { key: 8 })
        ));
        assert!(matches!(
            directory.insert(7, chunk),
            Err(ShmError::DuplicateKey { key: 7 })
        ));
    }

    #[test]
    fn insert_beyond_capacity_fails() {
        let (_, directory) = build(&[64, 64], 1);
        let a = directory.allocate(64).unwrap();
        let b = directory.allocate(64).unwrap();
        directory.insert(1, a).unwrap();
        assert!(matches!(
            directory.insert(2, b),
            Err(ShmError::DirectoryFull { capacity: 1 })
        ));
    }

    #[test]
    fn attach_checks_magic() {
        let (_, directory) = build(&[64], 1);
        let chunk = directory.allocate(64).unwrap();
        directory.insert(1, chunk).unwrap();

        let handle = directory.region().handle();
        let peer = Arc::new(Region::attach(handle).unwrap());
        let attached = Directory::attach(peer.clone(), DSM_MAGIC).unwrap();
        assert_eq!(attached.lookup(1).unwrap(), chunk);

        assert!(matches!(
            Directory::attach(peer, DSM_MAGIC ^ 1),
            Err(ShmError::InvalidMagic { expected, found }) if found == DSM_MAGIC && expected == DSM_MAGIC ^ 1
        ));
    }

    #[test]
    fn zeroed_region_has_no_directory() {
        let region = Arc::new(Region::create(4096, SHM_MAX_SIZE).unwrap());
        assert!(matches!(
            Directory::attach(region, DSM_MAGIC),
            Err(ShmError::InvalidMagic { found: 0, .. })
        ));
    }

    #[test]
    fn directory_cannot_be_written_twice() {
        let (layout, directory) = build(&[64], 1);
        assert!(matches!(
            Directory::create(directory.region().clone(), DSM_MAGIC, &layout),
            Err(ShmError::AlreadyExists { .. })
        ));
    }
}

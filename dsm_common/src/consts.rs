//! System-wide constants for the dsm workspace.
//!
//! Coordinator and workers are built from the same constants: a worker only
//! receives a region handle and its index, so everything else it needs to
//! find its queue must be agreed on at compile time.

/// Magic number identifying the directory layout written by this workspace.
pub const DSM_MAGIC: u64 = 0x0000_0000_7157_8a3b;

/// Directory key of the shared status chunk.
pub const DSM_KEY_STATUS: u64 = 0xFFFF_FFFF_FFFF_0001;

/// Directory key of the queue-set chunk.
pub const DSM_KEY_QUEUES: u64 = 0xFFFF_FFFF_FFFF_0002;

/// Bytes reserved per worker queue (header + ring).
///
/// Queue `i` lives at `i * MESSAGE_QUEUE_SIZE` inside the queue-set chunk.
pub const MESSAGE_QUEUE_SIZE: usize = 16 * 1024;

/// CPU cache line size in bytes. Chunk alignment inside a region.
pub const CACHE_LINE_SIZE: usize = 64;

/// Maximum shared memory region size in bytes (1 GiB).
pub const SHM_MAX_SIZE: usize = 1_073_741_824;

/// Directory holding region backing files.
pub const SHM_DIR: &str = "/dev/shm";

/// File name prefix of region backing files.
pub const SHM_PREFIX: &str = "dsm_";

/// Default number of worker slots offered by the process supervisor.
pub const DEFAULT_MAX_WORKER_PROCESSES: usize = 8;

/// Width of the fixed binary side-channel handed to every worker.
pub const WORKER_EXTRA_LEN: usize = 16;

/// Line a worker prints on stdout once its entry point is running.
pub const WORKER_STARTED_TOKEN: &str = "dsm-worker-started";

/// Default configuration file path.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/dsm/dsm.toml";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_distinct() {
        assert_ne!(DSM_KEY_STATUS, DSM_KEY_QUEUES);
    }

    #[test]
    fn queue_size_is_cache_line_multiple() {
        assert_eq!(MESSAGE_QUEUE_SIZE % CACHE_LINE_SIZE, 0);
        assert!(MESSAGE_QUEUE_SIZE < SHM_MAX_SIZE);
    }

    #[test]
    fn index_fits_in_worker_extra() {
        assert!(WORKER_EXTRA_LEN >= core::mem::size_of::<u32>());
    }
}

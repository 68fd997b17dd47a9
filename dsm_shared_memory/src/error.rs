//! Error types for shared memory operations

use thiserror::Error;

/// Errors that can occur during shared memory operations
#[derive(Error, Debug)]
pub enum ShmError {
    /// Region backing file already exists
    #[error("Region already exists: {name}")]
    AlreadyExists {
        /// Backing file name
        name: String,
    },

    /// Region not found
    #[error("Region not found: {name}")]
    NotFound {
        /// Backing file name
        name: String,
    },

    /// Invalid region size
    #[error("Invalid region size: {size} bytes")]
    InvalidSize {
        /// Attempted size in bytes
        size: usize,
    },

    /// System or configured resources exhausted
    #[error("Cannot reserve {requested} bytes of shared memory: {reason}")]
    ResourceExhausted {
        /// Requested size in bytes
        requested: usize,
        /// What ran out
        reason: String,
    },

    /// Directory magic does not match the expected layout
    #[error("Invalid magic number in shared memory directory: expected {expected:#x}, found {found:#x}")]
    InvalidMagic {
        /// Magic the attaching party expects
        expected: u64,
        /// Magic stored in the region
        found: u64,
    },

    /// Directory key lookup failed
    #[error("Key {key:#x} not found in shared memory directory")]
    KeyNotFound {
        /// Missing key
        key: u64,
    },

    /// Key inserted twice
    #[error("Key {key:#x} already present in shared memory directory")]
    DuplicateKey {
        /// Duplicated key
        key: u64,
    },

    /// No free directory slot
    #[error("Shared memory directory is full ({capacity} entries)")]
    DirectoryFull {
        /// Number of slots reserved at estimate time
        capacity: usize,
    },

    /// Estimator request list is full
    #[error("Too many chunks declared (max {max})")]
    TooManyChunks {
        /// Fixed request list capacity
        max: usize,
    },

    /// Allocation replay ran past the estimated size
    #[error("Allocation of {requested} bytes exceeds estimated region size ({remaining} bytes left)")]
    LayoutOverflow {
        /// Aligned size of the failed allocation
        requested: usize,
        /// Bytes left in the region
        remaining: usize,
    },

    /// Access outside the mapped region
    #[error("Range {offset}+{len} outside region of {size} bytes")]
    OutOfBounds {
        /// Start of the access
        offset: usize,
        /// Length of the access
        len: usize,
        /// Region size
        size: usize,
    },

    /// Memory alignment error
    #[error("Memory alignment error: offset {offset:#x} not aligned to {alignment}")]
    AlignmentError {
        /// Offset inside the region
        offset: usize,
        /// Required alignment
        alignment: usize,
    },

    /// Queue header is not usable
    #[error("Invalid message queue at offset {offset:#x}: {reason}")]
    InvalidQueue {
        /// Queue offset inside the region
        offset: usize,
        /// What is wrong with it
        reason: String,
    },

    /// Queue index past the end of the queue set
    #[error("Queue index {index} out of range ({count} queues)")]
    QueueIndexOutOfRange {
        /// Requested index
        index: usize,
        /// Queues in the set
        count: usize,
    },

    /// Sender or receiver already bound to another process
    #[error("Queue {role} already bound to pid {pid}")]
    QueueAlreadyBound {
        /// "sender" or "receiver"
        role: &'static str,
        /// Pid currently bound
        pid: u32,
    },

    /// Attaching an end that is not bound to this process
    #[error("Queue {role} is not bound to this process")]
    QueueNotBound {
        /// "sender" or "receiver"
        role: &'static str,
    },

    /// Status already moved to Finished
    #[error("Shared status already finished")]
    StatusAlreadyFinished,

    /// IO error
    #[error("IO error: {source}")]
    Io {
        /// Source IO error
        #[from]
        source: std::io::Error,
    },

    /// Nix system call error
    #[error("System call error: {source}")]
    Nix {
        /// Source nix error
        #[from]
        source: nix::Error,
    },
}

impl ShmError {
    /// True for failures that mean "this is not the layout we expect".
    pub fn is_protocol_mismatch(&self) -> bool {
        matches!(
            self,
            Self::InvalidMagic { .. }
                | Self::KeyNotFound { .. }
                | Self::InvalidQueue { .. }
                | Self::QueueIndexOutOfRange { .. }
        )
    }
}

/// Result type for shared memory operations
pub type ShmResult<T> = Result<T, ShmError>;

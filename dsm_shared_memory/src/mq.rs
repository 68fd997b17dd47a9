//! Single-producer, single-consumer message queues inside a region.
//!
//! # Layout
//!
//! Each queue is a [`QueueHeader`] followed by a byte ring. Messages are
//! framed as an 8-byte little-endian length, the payload, then zero padding
//! up to the next multiple of 8. `bytes_written` and `bytes_read` grow
//! monotonically; their difference is the number of unread bytes.
//!
//! A message larger than the ring streams through it: the sender blocks (or
//! returns `WouldBlock`) until the receiver frees space, and both ends keep
//! their progress between non-blocking calls.
//!
//! # Peer loss
//!
//! Either end sets `detached` when it goes away. A waiting end also checks
//! the peer's pid and treats a dead process as detached, so a crashed
//! worker never leaves the coordinator blocked forever.

use crate::error::{ShmError, ShmResult};
use crate::platform::{get_current_pid, is_process_alive};
use crate::region::{Region, SharedMemorySafe};
use crate::toc::{Chunk, Directory};
use dsm::consts::{CACHE_LINE_SIZE, MESSAGE_QUEUE_SIZE};
use static_assertions::const_assert_eq;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

const LENGTH_WORD: usize = size_of::<u64>();
const FRAME_ALIGN: usize = 8;

const SPIN_LIMIT: u32 = 64;
const YIELD_LIMIT: u32 = 128;
const SLEEP_INTERVAL: Duration = Duration::from_micros(200);

static PADDING: [u8; FRAME_ALIGN] = [0; FRAME_ALIGN];

/// Bytes a message of `len` bytes occupies in the ring.
pub const fn frame_len(len: usize) -> usize {
    LENGTH_WORD + len.div_ceil(FRAME_ALIGN) * FRAME_ALIGN
}

/// Counter on its own cache line.
#[repr(C, align(64))]
struct CacheAligned<T>(T);

/// Control block at the start of every queue.
#[repr(C, align(64))]
pub struct QueueHeader {
    receiver_pid: AtomicU32,
    sender_pid: AtomicU32,
    detached: AtomicU32,
    _reserved: AtomicU32,
    ring_size: AtomicU64,
    bytes_read: CacheAligned<AtomicU64>,
    bytes_written: CacheAligned<AtomicU64>,
}

/// Bytes taken by the header in front of each ring.
pub const QUEUE_HEADER_SIZE: usize = size_of::<QueueHeader>();

const_assert_eq!(QUEUE_HEADER_SIZE, 3 * CACHE_LINE_SIZE);
const_assert_eq!((MESSAGE_QUEUE_SIZE - QUEUE_HEADER_SIZE) % FRAME_ALIGN, 0);

unsafe impl SharedMemorySafe for QueueHeader {}

/// Outcome of a send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueResult {
    /// The whole message is in the ring.
    Success,
    /// Non-blocking call could not finish; call again with the same bytes.
    WouldBlock,
    /// The receiver is gone.
    Detached,
}

/// Outcome of a receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    /// A complete message.
    Message(Vec<u8>),
    /// Non-blocking call found no complete message yet.
    WouldBlock,
    /// The sender is gone and everything it wrote has been consumed.
    Detached,
}

/// Wait strategy: spin, then yield, then sleep.
struct Backoff {
    step: u32,
}

impl Backoff {
    fn new() -> Self {
        Self { step: 0 }
    }

    fn reset(&mut self) {
        self.step = 0;
    }

    /// Whether this wait round should also check that the peer is alive.
    fn should_check_peer(&self) -> bool {
        self.step == 0 || self.step >= YIELD_LIMIT
    }

    fn snooze(&mut self) {
        if self.step < SPIN_LIMIT {
            std::hint::spin_loop();
        } else if self.step < YIELD_LIMIT {
            std::thread::yield_now();
        } else {
            std::thread::sleep(SLEEP_INTERVAL);
        }
        self.step = self.step.saturating_add(1);
    }
}

/// A queue located inside a region, not yet bound to a role.
pub struct MessageQueue {
    region: Arc<Region>,
    offset: usize,
    header: NonNull<QueueHeader>,
    ring: NonNull<u8>,
    ring_size: usize,
}

// Pointers stay valid while `region` is held; shared state is atomic.
unsafe impl Send for MessageQueue {}

impl MessageQueue {
    /// Initialize a queue of `size` bytes at `offset`.
    pub fn create(region: Arc<Region>, offset: usize, size: usize) -> ShmResult<Self> {
        if size <= QUEUE_HEADER_SIZE + LENGTH_WORD
            || (size - QUEUE_HEADER_SIZE) % FRAME_ALIGN != 0
        {
            return Err(ShmError::InvalidQueue {
                offset,
                reason: format!("unusable queue size {size}"),
            });
        }
        let header: &QueueHeader = region.get(offset)?;
        header.receiver_pid.store(0, Ordering::Relaxed);
        header.sender_pid.store(0, Ordering::Relaxed);
        header.detached.store(0, Ordering::Relaxed);
        header.bytes_read.0.store(0, Ordering::Relaxed);
        header.bytes_written.0.store(0, Ordering::Relaxed);
        header
            .ring_size
            .store((size - QUEUE_HEADER_SIZE) as u64, Ordering::Release);
        Self::attach(region, offset)
    }

    /// Adopt a queue initialized by another process.
    pub fn attach(region: Arc<Region>, offset: usize) -> ShmResult<Self> {
        let header: &QueueHeader = region.get(offset)?;
        let ring_size = header.ring_size.load(Ordering::Acquire) as usize;
        if ring_size <= LENGTH_WORD || ring_size % FRAME_ALIGN != 0 {
            return Err(ShmError::InvalidQueue {
                offset,
                reason: format!("ring size {ring_size}"),
            });
        }
        let header = NonNull::from(header);
        let ring = region.bytes(offset + QUEUE_HEADER_SIZE, ring_size)?;
        Ok(Self {
            region,
            offset,
            header,
            ring,
            ring_size,
        })
    }

    fn header(&self) -> &QueueHeader {
        // Validated in `attach`; the mapping outlives `self`
        unsafe { self.header.as_ref() }
    }

    /// Offset of the queue inside its region.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Capacity of the byte ring.
    pub fn ring_size(&self) -> usize {
        self.ring_size
    }

    /// Region the queue lives in.
    pub fn region(&self) -> &Arc<Region> {
        &self.region
    }

    fn bind(slot: &AtomicU32, role: &'static str, pid: u32) -> ShmResult<()> {
        match slot.compare_exchange(0, pid, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => Ok(()),
            Err(current) if current == pid => Ok(()),
            Err(current) => Err(ShmError::QueueAlreadyBound { role, pid: current }),
        }
    }

    /// Record `pid` as the sending process.
    pub fn set_sender(&self, pid: u32) -> ShmResult<()> {
        Self::bind(&self.header().sender_pid, "sender", pid)
    }

    /// Record `pid` as the receiving process.
    pub fn set_receiver(&self, pid: u32) -> ShmResult<()> {
        Self::bind(&self.header().receiver_pid, "receiver", pid)
    }

    /// Bound sender pid.
    pub fn sender_pid(&self) -> Option<u32> {
        Some(self.header().sender_pid.load(Ordering::Acquire)).filter(|pid| *pid != 0)
    }

    /// Bound receiver pid.
    pub fn receiver_pid(&self) -> Option<u32> {
        Some(self.header().receiver_pid.load(Ordering::Acquire)).filter(|pid| *pid != 0)
    }

    /// True once either end has detached.
    pub fn is_detached(&self) -> bool {
        self.header().detached.load(Ordering::Acquire) != 0
    }

    /// Attach as the sending end. The sender must be this process.
    pub fn into_sender(self) -> ShmResult<QueueSender> {
        if self.sender_pid() != Some(get_current_pid()) {
            return Err(ShmError::QueueNotBound { role: "sender" });
        }
        Ok(QueueSender {
            queue: self,
            peer_handle: None,
            partial: 0,
        })
    }

    /// Attach as the receiving end. The receiver must be this process.
    pub fn into_receiver(self) -> ShmResult<QueueReceiver> {
        if self.receiver_pid() != Some(get_current_pid()) {
            return Err(ShmError::QueueNotBound { role: "receiver" });
        }
        Ok(QueueReceiver {
            queue: self,
            pending: None,
            buffer: Vec::new(),
        })
    }

    fn detach(&self) {
        self.header().detached.store(1, Ordering::Release);
    }
}

impl std::fmt::Debug for MessageQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageQueue")
            .field("offset", &self.offset)
            .field("ring_size", &self.ring_size)
            .field("sender", &self.sender_pid())
            .field("receiver", &self.receiver_pid())
            .finish()
    }
}

/// The writing end of a queue.
#[derive(Debug)]
pub struct QueueSender {
    queue: MessageQueue,
    peer_handle: Option<u32>,
    partial: usize,
}

impl QueueSender {
    /// Watch `pid` for liveness until a receiver binds itself.
    pub fn set_handle(&mut self, pid: u32) {
        self.peer_handle = Some(pid);
    }

    /// Underlying queue.
    pub fn queue(&self) -> &MessageQueue {
        &self.queue
    }

    fn peer_gone(&self) -> bool {
        let watched = self.queue.receiver_pid().or(self.peer_handle);
        watched.is_some_and(|pid| !is_process_alive(pid))
    }

    /// Send one message.
    ///
    /// After `WouldBlock` the next call must pass the same `data`; the bytes
    /// already in the ring are not written again.
    pub fn send(&mut self, data: &[u8], blocking: bool) -> QueueResult {
        let header = self.queue.header();
        let ring = self.queue.ring_size;
        let length = (data.len() as u64).to_le_bytes();
        let total = frame_len(data.len());
        let mut backoff = Backoff::new();

        while self.partial < total {
            if header.detached.load(Ordering::Acquire) != 0 {
                self.partial = 0;
                return QueueResult::Detached;
            }

            let read = header.bytes_read.0.load(Ordering::Acquire);
            let written = header.bytes_written.0.load(Ordering::Relaxed);
            let free = ring - (written - read) as usize;
            if free == 0 {
                if backoff.should_check_peer() && self.peer_gone() {
                    tracing::debug!(offset = self.queue.offset, "receiver is gone");
                    self.queue.detach();
                    self.partial = 0;
                    return QueueResult::Detached;
                }
                if !blocking {
                    return QueueResult::WouldBlock;
                }
                backoff.snooze();
                continue;
            }
            backoff.reset();

            let pos = (written % ring as u64) as usize;
            let piece = frame_piece(&length, data, self.partial, total);
            let n = piece.len().min(free).min(ring - pos);
            unsafe {
                std::ptr::copy_nonoverlapping(
                    piece.as_ptr(),
                    self.queue.ring.as_ptr().add(pos),
                    n,
                );
            }
            header
                .bytes_written
                .0
                .store(written + n as u64, Ordering::Release);
            self.partial += n;
        }

        self.partial = 0;
        QueueResult::Success
    }

    /// Mark the queue detached so the receiver stops waiting.
    pub fn detach(self) {}
}

impl Drop for QueueSender {
    fn drop(&mut self) {
        self.queue.detach();
    }
}

/// Bytes of the frame starting at `pos`, up to the end of the current part.
fn frame_piece<'a>(
    length: &'a [u8; LENGTH_WORD],
    data: &'a [u8],
    pos: usize,
    total: usize,
) -> &'a [u8] {
    if pos < LENGTH_WORD {
        &length[pos..]
    } else if pos < LENGTH_WORD + data.len() {
        &data[pos - LENGTH_WORD..]
    } else {
        &PADDING[..total - pos]
    }
}

/// The reading end of a queue.
#[derive(Debug)]
pub struct QueueReceiver {
    queue: MessageQueue,
    pending: Option<usize>,
    buffer: Vec<u8>,
}

impl QueueReceiver {
    /// Underlying queue.
    pub fn queue(&self) -> &MessageQueue {
        &self.queue
    }

    fn sender_gone(&self) -> bool {
        self.queue
            .sender_pid()
            .is_some_and(|pid| !is_process_alive(pid))
    }

    /// Receive one message.
    ///
    /// Data written before the sender detached is still delivered; only an
    /// empty, detached queue reports `Detached`.
    pub fn receive(&mut self, blocking: bool) -> Received {
        let header = self.queue.header();
        let ring = self.queue.ring_size;
        let ring_base = self.queue.ring.as_ptr();
        let mut backoff = Backoff::new();

        loop {
            let written = header.bytes_written.0.load(Ordering::Acquire);
            let read = header.bytes_read.0.load(Ordering::Relaxed);
            let available = (written - read) as usize;
            let pos = (read % ring as u64) as usize;

            let consumed = match self.pending {
                None if available >= LENGTH_WORD => {
                    // Frames start 8-aligned and the ring is a multiple of 8
                    let mut word = [0u8; LENGTH_WORD];
                    unsafe {
                        std::ptr::copy_nonoverlapping(
                            ring_base.add(pos),
                            word.as_mut_ptr(),
                            LENGTH_WORD,
                        );
                    }
                    let len = u64::from_le_bytes(word) as usize;
                    self.pending = Some(len);
                    self.buffer = Vec::with_capacity(len.min(ring));
                    LENGTH_WORD
                }
                Some(len) if self.buffer.len() < len && available > 0 => {
                    let n = (len - self.buffer.len()).min(available).min(ring - pos);
                    let bytes = unsafe { std::slice::from_raw_parts(ring_base.add(pos), n) };
                    self.buffer.extend_from_slice(bytes);
                    n
                }
                Some(len) if self.buffer.len() == len => {
                    let padding = frame_len(len) - LENGTH_WORD - len;
                    if available >= padding {
                        header
                            .bytes_read
                            .0
                            .store(read + padding as u64, Ordering::Release);
                        self.pending = None;
                        return Received::Message(std::mem::take(&mut self.buffer));
                    }
                    0
                }
                _ => 0,
            };

            if consumed > 0 {
                header
                    .bytes_read
                    .0
                    .store(read + consumed as u64, Ordering::Release);
                backoff.reset();
                continue;
            }

            if header.detached.load(Ordering::Acquire) != 0 {
                if header.bytes_written.0.load(Ordering::Acquire) != written {
                    continue;
                }
                return Received::Detached;
            }
            if backoff.should_check_peer() && self.sender_gone() {
                tracing::debug!(offset = self.queue.offset, "sender is gone");
                self.queue.detach();
                continue;
            }
            if !blocking {
                return Received::WouldBlock;
            }
            backoff.snooze();
        }
    }

    /// Mark the queue detached so the sender stops waiting.
    pub fn detach(self) {}
}

impl Drop for QueueReceiver {
    fn drop(&mut self) {
        self.queue.detach();
    }
}

/// Offset of queue `index` inside the queue-set chunk.
pub fn queue_offset(chunk: Chunk, index: usize) -> ShmResult<usize> {
    let count = chunk.len / MESSAGE_QUEUE_SIZE;
    if index >= count {
        return Err(ShmError::QueueIndexOutOfRange { index, count });
    }
    Ok(chunk.offset + index * MESSAGE_QUEUE_SIZE)
}

/// Allocate `count` queues, bind this process as sender of each, and
/// return the chunk to publish together with the sending ends.
pub fn create_queues(
    directory: &Directory,
    count: usize,
    sender_pid: u32,
) -> ShmResult<(Chunk, Vec<QueueSender>)> {
    let size = count
        .checked_mul(MESSAGE_QUEUE_SIZE)
        .ok_or(ShmError::ResourceExhausted {
            requested: usize::MAX,
            reason: format!("{count} queues overflow the address space"),
        })?;
    let chunk = directory.allocate(size)?;

    let mut senders = Vec::with_capacity(count);
    for index in 0..count {
        let queue = MessageQueue::create(
            directory.region().clone(),
            queue_offset(chunk, index)?,
            MESSAGE_QUEUE_SIZE,
        )?;
        queue.set_sender(sender_pid)?;
        senders.push(queue.into_sender()?);
    }
    tracing::debug!(count, offset = chunk.offset, "queues created");
    Ok((chunk, senders))
}

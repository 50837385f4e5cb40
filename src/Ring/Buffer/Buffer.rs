// The ring buffer view: header + fixed-stride slots inside one region.

use super::layout::RingHeader;
use crate::Core::SharedMemory::SharedMemoryBackend;
use serde::{Deserialize, Serialize};

/// Default maximum payload bytes per slot.
/// This should be tuned per deployment.
pub const DEFAULT_SLOT_SIZE: usize = 16 * 1024;

/// What `publish` does when `head - tail == capacity`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict the oldest unconsumed slot.
    #[default]
    Overwrite,
    /// Fail the publish with `BufferFull` without claiming a sequence.
    Reject,
}

/// A lock-free, multi-producer ring of fixed-size slots with an overwrite-oldest policy.
///
/// The struct itself is a view over a region; the region (heap or /dev/shm)
/// holds the `RingHeader` followed by `capacity` slots.
///
/// ### Concurrency Design:
/// - **Producers**: claim a sequence by atomically incrementing `head`, take the
///   slot's `stamp` (odd = writing), write, then store the even committed stamp.
///   Partially written slots are never readable.
/// - **Cursors**: read non-destructively by sequence and validate the stamp after
///   copying (seqlock); a slot overwritten mid-copy is reported as lost.
/// - **Draining consumer**: claims the `tail` sequence with a CAS after a
///   validated read, so concurrent takers never see the same slot twice.
pub struct RingBuffer {
    /// Owns the memory `header` and `slots_base` point into.
    pub(crate) region: Box<dyn SharedMemoryBackend>,

    /// Pointer to the ring header at the start of the region.
    pub(crate) header: *const RingHeader,

    /// Pointer to the first slot.
    pub(crate) slots_base: *mut u8,

    /// The capacity of the buffer (number of slots).
    pub(crate) capacity: usize,

    /// `capacity - 1`, used to wrap sequence numbers.
    pub(crate) mask: usize,

    /// Maximum payload bytes per slot.
    pub(crate) slot_size: usize,

    /// Byte distance between consecutive slots.
    pub(crate) stride: usize,

    pub(crate) policy: OverflowPolicy,
}

unsafe impl Send for RingBuffer {}
unsafe impl Sync for RingBuffer {}

/// One slot's content as copied out of the ring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingEntry {
    pub sequence: u64,
    pub source_id: u32,
    pub caller_seq_no: u64,
    pub payload: Vec<u8>,
}

/// Result of a poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Polled {
    /// Nothing committed after the cursor.
    Empty,
    /// The next sequence after the cursor.
    Ready(RingEntry),
    /// The requested sequence was overwritten; `entry` is the oldest still
    /// available and `lost` counts the sequences skipped to reach it.
    Gap { lost: u64, entry: RingEntry },
}

impl Polled {
    pub fn is_empty(&self) -> bool {
        matches!(self, Polled::Empty)
    }

    /// Sequences lost before this entry.
    pub fn lost(&self) -> u64 {
        match self {
            Polled::Gap { lost, .. } => *lost,
            _ => 0,
        }
    }

    pub fn entry(&self) -> Option<&RingEntry> {
        match self {
            Polled::Empty => None,
            Polled::Ready(entry) | Polled::Gap { entry, .. } => Some(entry),
        }
    }

    pub fn into_entry(self) -> Option<RingEntry> {
        match self {
            Polled::Empty => None,
            Polled::Ready(entry) | Polled::Gap { entry, .. } => Some(entry),
        }
    }
}

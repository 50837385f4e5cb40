use crossbeam_utils::CachePadded;
use std::sync::atomic::AtomicU64;

/// "ZENITHRB"
pub const RING_MAGIC: u64 = 0x5A45_4E49_5448_5242;

/// Version of the region layout. Bump on any change to `RingHeader` or `SlotHeader`.
pub const RING_LAYOUT_VERSION: u32 = 2;

/// Overflow policy stored in `RingHeader::flags`.
pub const FLAG_REJECT_WHEN_FULL: u32 = 1;

/// The header at the very beginning of a ring region.
///
/// It is the entry point for any process attaching to the ring and holds the
/// atomic cursors shared by every producer and the draining consumer.
#[repr(C, align(128))]
pub struct RingHeader {
    /// A "magic number" identifying the region as a zenith ring.
    pub magic: u64,

    /// The version of the memory layout.
    pub version: u32,

    /// Overflow policy and other per-ring flags.
    pub flags: u32,

    /// Number of slots. Always a power of two.
    pub capacity: u64,

    /// Maximum payload bytes per slot.
    pub slot_size: u64,

    /// Byte distance between consecutive slots.
    pub slot_stride: u64,

    /// Next sequence to be claimed by a producer.
    pub head: CachePadded<AtomicU64>,

    /// Next sequence to be taken by the draining consumer.
    /// Producers push it forward when they evict an unconsumed slot.
    pub tail: CachePadded<AtomicU64>,

    /// Unconsumed slots lost to the overflow policy.
    pub dropped_by_full: CachePadded<AtomicU64>,

    /// Evictions not yet reported to the draining consumer. The next
    /// successful `take` swaps it to zero and reports it as `lost`.
    pub unreported_evictions: CachePadded<AtomicU64>,
}

/// Fixed header preceding each slot's payload bytes.
///
/// `stamp` is the slot's write guard:
/// - `0`: never written
/// - `((seq + 1) << 1) | 1`: a producer is writing `seq`
/// - `(seq + 1) << 1`: `seq` is committed and readable
#[repr(C, align(64))]
pub struct SlotHeader {
    pub stamp: AtomicU64,
    pub sequence: u64,
    pub caller_seq_no: u64,
    pub source_id: u32,
    pub length: u32,
}

#[inline]
pub fn writing_stamp(seq: u64) -> u64 {
    ((seq + 1) << 1) | 1
}

#[inline]
pub fn committed_stamp(seq: u64) -> u64 {
    (seq + 1) << 1
}

/// The sequence a stamp refers to, or `None` for an untouched slot.
#[inline]
pub fn stamp_sequence(stamp: u64) -> Option<u64> {
    (stamp >> 1).checked_sub(1)
}

#[inline]
pub fn stamp_is_writing(stamp: u64) -> bool {
    stamp & 1 == 1
}

use std::fmt;
use std::sync::atomic::Ordering;

use crate::Ring::Buffer::layout::RingHeader;
use crate::Ring::RingBuffer;

/// Debug function for RingHeader
///
/// Shows the geometry and a relaxed snapshot of the shared cursors.
pub fn debug_ring_header(header: &RingHeader, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("RingHeader")
        .field("magic", &format_args!("0x{:016x}", header.magic))
        .field("version", &header.version)
        .field("flags", &header.flags)
        .field("capacity", &header.capacity)
        .field("slot_size", &header.slot_size)
        .field("slot_stride", &header.slot_stride)
        .field("head", &header.head.load(Ordering::Relaxed))
        .field("tail", &header.tail.load(Ordering::Relaxed))
        .field("dropped_by_full", &header.dropped_by_full.load(Ordering::Relaxed))
        .field(
            "unreported_evictions",
            &header.unreported_evictions.load(Ordering::Relaxed),
        )
        .finish()
}

/// Debug function for RingBuffer
///
/// Prints the region address instead of dereferencing slot memory.
pub fn debug_ring_buffer(buffer: &RingBuffer, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("RingBuffer")
        .field("region", &format_args!("{:p}", buffer.region.as_ptr()))
        .field("handle", &buffer.region.raw_handle())
        .field("capacity", &buffer.capacity)
        .field("slot_size", &buffer.slot_size)
        .field("policy", &buffer.policy)
        .field("head", &buffer.head())
        .field("tail", &buffer.tail())
        .finish_non_exhaustive()
}

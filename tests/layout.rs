// Layout conformance tests for ABI stability across processes and languages.
// These assert sizes, alignments and field offsets of the shared ring
// headers and the C ABI structs, printing observed values on mismatch.
use crossbeam_utils::CachePadded;
use memoffset::offset_of;
use std::mem::{align_of, size_of};
use std::sync::atomic::AtomicU64;
use zenith_core::ffi::{ZenithDeliveryMeta, ZenithStats};
use zenith_core::Ring::Buffer::{RingHeader, SlotHeader};

#[test]
fn test_slot_header_layout() {
    let size = size_of::<SlotHeader>();
    let align = align_of::<SlotHeader>();
    let off_stamp = offset_of!(SlotHeader, stamp);
    let off_sequence = offset_of!(SlotHeader, sequence);
    let off_caller_seq_no = offset_of!(SlotHeader, caller_seq_no);
    let off_source_id = offset_of!(SlotHeader, source_id);
    let off_length = offset_of!(SlotHeader, length);

    println!(
        "SlotHeader => size: {size}, align: {align}, offsets: [stamp:{off_stamp}, sequence:{off_sequence}, caller_seq_no:{off_caller_seq_no}, source_id:{off_source_id}, length:{off_length}]"
    );

    assert_eq!(size, 64);
    assert_eq!(align, 64);
    assert_eq!(off_stamp, 0);
    assert_eq!(off_sequence, 8);
    assert_eq!(off_caller_seq_no, 16);
    assert_eq!(off_source_id, 24);
    assert_eq!(off_length, 28);
}

#[test]
fn test_ring_header_layout() {
    let padded = align_of::<CachePadded<AtomicU64>>();
    let padded_size = size_of::<CachePadded<AtomicU64>>();
    // 40 bytes of geometry fields, then the cursors on their own lines
    let expected_head = (40 + padded - 1) & !(padded - 1);

    let off_magic = offset_of!(RingHeader, magic);
    let off_version = offset_of!(RingHeader, version);
    let off_flags = offset_of!(RingHeader, flags);
    let off_capacity = offset_of!(RingHeader, capacity);
    let off_slot_size = offset_of!(RingHeader, slot_size);
    let off_slot_stride = offset_of!(RingHeader, slot_stride);
    let off_head = offset_of!(RingHeader, head);
    let off_tail = offset_of!(RingHeader, tail);
    let off_dropped = offset_of!(RingHeader, dropped_by_full);
    let off_unreported = offset_of!(RingHeader, unreported_evictions);

    println!(
        "RingHeader => size: {}, align: {}, cache line: {padded}, offsets: [head:{off_head}, tail:{off_tail}, dropped_by_full:{off_dropped}, unreported_evictions:{off_unreported}]",
        size_of::<RingHeader>(),
        align_of::<RingHeader>()
    );

    assert_eq!(align_of::<RingHeader>(), 128);
    assert_eq!(off_magic, 0);
    assert_eq!(off_version, 8);
    assert_eq!(off_flags, 12);
    assert_eq!(off_capacity, 16);
    assert_eq!(off_slot_size, 24);
    assert_eq!(off_slot_stride, 32);
    assert_eq!(off_head, expected_head);
    assert_eq!(off_tail, off_head + padded_size);
    assert_eq!(off_dropped, off_tail + padded_size);
    assert_eq!(off_unreported, off_dropped + padded_size);
    assert_eq!(size_of::<RingHeader>() % 128, 0);
}

#[test]
fn test_ffi_struct_layout() {
    assert_eq!(size_of::<ZenithStats>(), 48);
    assert_eq!(offset_of!(ZenithStats, buffer_len), 0);
    assert_eq!(offset_of!(ZenithStats, plugin_count), 8);
    assert_eq!(offset_of!(ZenithStats, published), 16);
    assert_eq!(offset_of!(ZenithStats, dropped_by_full), 24);
    assert_eq!(offset_of!(ZenithStats, dropped_by_plugin), 32);
    assert_eq!(offset_of!(ZenithStats, plugin_faults), 40);

    assert_eq!(size_of::<ZenithDeliveryMeta>(), 32);
    assert_eq!(offset_of!(ZenithDeliveryMeta, sequence), 0);
    assert_eq!(offset_of!(ZenithDeliveryMeta, caller_seq_no), 8);
    assert_eq!(offset_of!(ZenithDeliveryMeta, source_id), 16);
    assert_eq!(offset_of!(ZenithDeliveryMeta, reserved), 20);
    assert_eq!(offset_of!(ZenithDeliveryMeta, lost), 24);
}

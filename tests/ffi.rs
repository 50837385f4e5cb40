// C ABI tests. Handles are process-wide, so every test opens its own.
use std::ptr;
use std::sync::Arc;

use zenith_core::error::*;
use zenith_core::ffi::*;
use zenith_core::Codec::{self, Column, RecordBatch, Schema};

const DROP_ALL: &str = r#"
(module
  (memory (export "memory") 1)
  (func (export "on_frame") (param i32 i32) (result i32)
    i32.const 1))
"#;

fn open(capacity: usize) -> u64 {
    let mut handle = 0u64;
    assert_eq!(zenith_open(capacity, &mut handle), ZENITH_SUCCESS);
    assert_ne!(handle, 0);
    handle
}

fn tick_frame(symbol: &str) -> Vec<u8> {
    let batch = RecordBatch::try_new(
        Arc::new(Schema::market_tick()),
        vec![
            Column::from_strs(&[symbol]),
            Column::from_values(&[187.25f64]),
            Column::from_values(&[300u32]),
            Column::from_values(&[1_700_000_000_000_000_000u64]),
        ],
    )
    .unwrap();
    Codec::encode(&batch)
}

fn publish(handle: u64, frame: &[u8], source_id: u32, seq_no: u64) -> (i32, u64) {
    let mut seq = u64::MAX;
    let rc = zenith_publish(handle, frame.as_ptr(), frame.len(), source_id, seq_no, &mut seq);
    (rc, seq)
}

fn stats(handle: u64) -> ZenithStats {
    let mut stats = ZenithStats::default();
    assert_eq!(zenith_get_stats(handle, &mut stats), ZENITH_SUCCESS);
    stats
}

#[test]
fn test_publish_and_poll() {
    let handle = open(16);
    let frame = tick_frame("AAPL");

    assert_eq!(publish(handle, &frame, 5, 42), (ZENITH_SUCCESS, 0));
    // out_seq is optional
    assert_eq!(
        zenith_publish(handle, frame.as_ptr(), frame.len(), 5, 43, ptr::null_mut()),
        ZENITH_SUCCESS
    );

    // too small: the needed size comes back and the frame is kept
    let mut small = [0u8; 4];
    let mut len = small.len();
    let rc = zenith_poll(handle, small.as_mut_ptr(), &mut len, ptr::null_mut());
    assert_eq!(rc, ZENITH_ERROR_BUFFER_TOO_SMALL);
    assert_eq!(len, frame.len());

    let mut buf = vec![0u8; 4096];
    let mut len = buf.len();
    let mut meta = ZenithDeliveryMeta::default();
    assert_eq!(zenith_poll(handle, buf.as_mut_ptr(), &mut len, &mut meta), ZENITH_SUCCESS);
    assert_eq!(&buf[..len], &frame[..]);
    assert_eq!(meta.sequence, 0);
    assert_eq!(meta.caller_seq_no, 42);
    assert_eq!(meta.source_id, 5);
    assert_eq!(meta.lost, 0);

    let mut len = buf.len();
    assert_eq!(zenith_poll(handle, buf.as_mut_ptr(), &mut len, &mut meta), ZENITH_SUCCESS);
    assert_eq!(meta.caller_seq_no, 43);

    let mut len = buf.len();
    assert_eq!(
        zenith_poll(handle, buf.as_mut_ptr(), &mut len, ptr::null_mut()),
        ZENITH_ERROR_EMPTY
    );

    let decoded = Codec::decode(&frame, &Arc::new(Schema::market_tick())).unwrap();
    assert_eq!(decoded.column(0).unwrap().str_value(0), Some("AAPL"));

    assert_eq!(zenith_close(handle), ZENITH_SUCCESS);
}

#[test]
fn test_register_schema_and_errors() {
    let handle = open(8);
    let frame = tick_frame("MSFT");

    assert_eq!(zenith_register_schema(handle, 1, 0xDEAD_BEEF), ZENITH_SUCCESS);
    assert_eq!(publish(handle, &frame, 1, 0).0, ZENITH_ERROR_SCHEMA_MISMATCH);

    assert_eq!(
        zenith_register_schema(handle, 1, Schema::market_tick().fingerprint()),
        ZENITH_SUCCESS
    );
    assert_eq!(publish(handle, &frame, 1, 0).0, ZENITH_SUCCESS);

    assert_eq!(publish(handle, &[0xFF; 7], 2, 0).0, ZENITH_ERROR_CORRUPT_FRAME);
    assert_eq!(publish(handle, &vec![0u8; 1 << 20], 2, 0).0, ZENITH_ERROR_OVERSIZE_BATCH);

    assert_eq!(zenith_close(handle), ZENITH_SUCCESS);
}

#[test]
fn test_plugin_lifecycle() {
    let handle = open(8);
    let frame = tick_frame("TSLA");

    let mut plugin_id = 0u64;
    let rc = zenith_load_plugin(handle, DROP_ALL.as_ptr(), DROP_ALL.len(), &mut plugin_id);
    assert_eq!(rc, ZENITH_SUCCESS);

    for i in 0..3 {
        assert_eq!(publish(handle, &frame, 1, i).0, ZENITH_DROPPED);
    }
    let s = stats(handle);
    assert_eq!(s.plugin_count, 1);
    assert_eq!(s.published, 3);
    assert_eq!(s.dropped_by_plugin, 3);
    assert_eq!(s.buffer_len, 0);

    let garbage = b"not wasm";
    let mut other = 0u64;
    assert_eq!(
        zenith_load_plugin(handle, garbage.as_ptr(), garbage.len(), &mut other),
        ZENITH_ERROR_INVALID_PLUGIN
    );

    assert_eq!(zenith_unload_plugin(handle, plugin_id), ZENITH_SUCCESS);
    assert_eq!(zenith_unload_plugin(handle, plugin_id), ZENITH_ERROR_INVALID_PLUGIN);
    assert_eq!(publish(handle, &frame, 1, 3), (ZENITH_SUCCESS, 0));
    assert_eq!(stats(handle).plugin_count, 0);

    assert_eq!(zenith_close(handle), ZENITH_SUCCESS);
}

#[test]
fn test_close_is_idempotent() {
    let handle = open(4);
    assert_eq!(zenith_close(handle), ZENITH_SUCCESS);
    assert_eq!(zenith_close(handle), ZENITH_SUCCESS);

    let frame = tick_frame("IBM");
    assert_eq!(publish(handle, &frame, 1, 0).0, ZENITH_ERROR_CLOSED_HANDLE);
    let mut s = ZenithStats::default();
    assert_eq!(zenith_get_stats(handle, &mut s), ZENITH_ERROR_CLOSED_HANDLE);
    let mut buf = [0u8; 64];
    let mut len = buf.len();
    assert_eq!(
        zenith_poll(handle, buf.as_mut_ptr(), &mut len, ptr::null_mut()),
        ZENITH_ERROR_CLOSED_HANDLE
    );
    assert_eq!(zenith_register_schema(handle, 1, 1), ZENITH_ERROR_CLOSED_HANDLE);
    assert_eq!(zenith_unload_plugin(handle, 1), ZENITH_ERROR_CLOSED_HANDLE);

    // never issued
    assert_eq!(zenith_close(u64::MAX), ZENITH_SUCCESS);
}

#[test]
fn test_argument_errors() {
    assert_eq!(zenith_open(16, ptr::null_mut()), ZENITH_ERROR_NULL_POINTER);

    let mut handle = 0u64;
    assert_eq!(zenith_open(0, &mut handle), ZENITH_ERROR_INVALID_CAPACITY);
    assert_eq!(zenith_open(12, &mut handle), ZENITH_ERROR_INVALID_CAPACITY);
    assert_eq!(
        zenith_open_shared(ptr::null(), 16, 0, &mut handle),
        ZENITH_ERROR_NULL_POINTER
    );

    let handle = open(4);
    assert_eq!(
        zenith_publish(handle, ptr::null(), 10, 1, 0, ptr::null_mut()),
        ZENITH_ERROR_NULL_POINTER
    );
    let mut len = 0usize;
    assert_eq!(
        zenith_poll(handle, ptr::null_mut(), &mut len, ptr::null_mut()),
        ZENITH_ERROR_NULL_POINTER
    );
    assert_eq!(zenith_get_stats(handle, ptr::null_mut()), ZENITH_ERROR_NULL_POINTER);
    assert_eq!(
        zenith_load_plugin(handle, ptr::null(), 0, ptr::null_mut()),
        ZENITH_ERROR_NULL_POINTER
    );
    assert_eq!(zenith_close(handle), ZENITH_SUCCESS);
}

#[test]
fn test_overwrite_reports_loss_through_stats() {
    let handle = open(4);
    let frame = tick_frame("NVDA");
    for i in 0..10 {
        assert_eq!(publish(handle, &frame, 1, i).0, ZENITH_SUCCESS);
    }
    let s = stats(handle);
    assert_eq!(s.buffer_len, 4);
    assert_eq!(s.dropped_by_full, 6);

    let mut buf = vec![0u8; 1024];
    let mut len = buf.len();
    let mut meta = ZenithDeliveryMeta::default();
    assert_eq!(zenith_poll(handle, buf.as_mut_ptr(), &mut len, &mut meta), ZENITH_SUCCESS);
    assert_eq!(meta.sequence, 6);
    assert_eq!(meta.caller_seq_no, 6);
    assert_eq!(meta.lost, 6);

    let mut len = buf.len();
    assert_eq!(zenith_poll(handle, buf.as_mut_ptr(), &mut len, &mut meta), ZENITH_SUCCESS);
    assert_eq!(meta.sequence, 7);
    assert_eq!(meta.lost, 0);
    assert_eq!(zenith_close(handle), ZENITH_SUCCESS);
}

#[test]
fn test_poll_meta_counts_evicted_frames() {
    let handle = open(4);
    let frame = tick_frame("AMD");
    for i in 0..6 {
        assert_eq!(publish(handle, &frame, 2, i).0, ZENITH_SUCCESS);
    }

    let mut buf = vec![0u8; 1024];
    let mut len = buf.len();
    let mut meta = ZenithDeliveryMeta::default();
    assert_eq!(zenith_poll(handle, buf.as_mut_ptr(), &mut len, &mut meta), ZENITH_SUCCESS);
    assert_eq!(meta.sequence, 2);
    assert_eq!(meta.lost, 2);
    assert_eq!(zenith_close(handle), ZENITH_SUCCESS);
}

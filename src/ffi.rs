//! C ABI over `Session`.
//!
//! Sessions are addressed by opaque `u64` handles kept in a process-wide
//! registry, so a stale or twice-closed handle is reported instead of
//! dereferenced. All functions return one of the `ZENITH_*` codes.

use std::collections::HashMap;
use std::ffi::{c_char, CStr};
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use lazy_static::lazy_static;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::SessionConfig;
use crate::error::*;
use crate::Plugin::PluginId;
use crate::Session::{Delivery, Published, Session};

/// Counters returned by `zenith_get_stats`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ZenithStats {
    pub buffer_len: u64,
    pub plugin_count: u64,
    pub published: u64,
    pub dropped_by_full: u64,
    pub dropped_by_plugin: u64,
    pub plugin_faults: u64,
}

/// Metadata of a frame returned by `zenith_poll`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ZenithDeliveryMeta {
    pub sequence: u64,
    pub caller_seq_no: u64,
    pub source_id: u32,
    pub reserved: u32,
    pub lost: u64,
}

struct HandleEntry {
    session: Session,
    /// Delivery taken from the ring that did not fit the caller's buffer.
    pending: Mutex<Option<Delivery>>,
}

lazy_static! {
    static ref SESSIONS: Mutex<HashMap<u64, Arc<HandleEntry>>> = Mutex::new(HashMap::new());
}

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

fn register(session: Session, out_handle: *mut u64) -> i32 {
    let handle = NEXT_HANDLE.fetch_add(1, Ordering::Relaxed);
    SESSIONS.lock().insert(
        handle,
        Arc::new(HandleEntry {
            session,
            pending: Mutex::new(None),
        }),
    );
    unsafe { *out_handle = handle };
    ZENITH_SUCCESS
}

fn lookup(handle: u64) -> Option<Arc<HandleEntry>> {
    SESSIONS.lock().get(&handle).cloned()
}

fn report(op: &str, handle: u64, err: &EngineError) -> i32 {
    debug!(op, handle, error = %err, "call failed");
    err.code()
}

/// Open a process-private session with `buffer_size` slots.
///
/// # Returns
/// * 0 and the new handle in `*out_handle`, or a negative error code.
#[no_mangle]
pub extern "C" fn zenith_open(buffer_size: usize, out_handle: *mut u64) -> i32 {
    if out_handle.is_null() {
        return ZENITH_ERROR_NULL_POINTER;
    }
    match Session::open(buffer_size) {
        Ok(session) => register(session, out_handle),
        Err(e) => report("open", 0, &e),
    }
}

/// Open a session whose ring lives in `/dev/shm/<name>`.
///
/// A `slot_size` of 0 selects the default.
#[no_mangle]
pub extern "C" fn zenith_open_shared(
    name: *const c_char,
    buffer_size: usize,
    slot_size: usize,
    out_handle: *mut u64,
) -> i32 {
    if name.is_null() || out_handle.is_null() {
        return ZENITH_ERROR_NULL_POINTER;
    }
    let name = match unsafe { CStr::from_ptr(name) }.to_str() {
        Ok(name) => name,
        Err(_) => return ZENITH_ERROR_INTERNAL,
    };

    let mut config = SessionConfig::new(buffer_size).with_shared_name(name);
    if slot_size != 0 {
        config = config.with_slot_size(slot_size);
    }
    match Session::open_with(config) {
        Ok(session) => register(session, out_handle),
        Err(e) => report("open_shared", 0, &e),
    }
}

/// Require frames from `source_id` to carry `fingerprint`.
#[no_mangle]
pub extern "C" fn zenith_register_schema(handle: u64, source_id: u32, fingerprint: u64) -> i32 {
    let Some(entry) = lookup(handle) else {
        return ZENITH_ERROR_CLOSED_HANDLE;
    };
    match entry.session.register_fingerprint(source_id, fingerprint) {
        Ok(()) => ZENITH_SUCCESS,
        Err(e) => report("register_schema", handle, &e),
    }
}

/// Publish an encoded frame.
///
/// # Returns
/// * 0 with the ring sequence in `*out_seq` (if non-null).
/// * `ZENITH_DROPPED` when the plugin chain dropped the frame.
/// * A negative error code otherwise.
#[no_mangle]
pub extern "C" fn zenith_publish(
    handle: u64,
    frame: *const u8,
    len: usize,
    source_id: u32,
    seq_no: u64,
    out_seq: *mut u64,
) -> i32 {
    if frame.is_null() {
        return ZENITH_ERROR_NULL_POINTER;
    }
    let Some(entry) = lookup(handle) else {
        return ZENITH_ERROR_CLOSED_HANDLE;
    };
    let frame = unsafe { std::slice::from_raw_parts(frame, len) };

    match entry.session.publish_frame(frame, source_id, seq_no) {
        Ok(Published::Sequence(seq)) => {
            if !out_seq.is_null() {
                unsafe { *out_seq = seq };
            }
            ZENITH_SUCCESS
        }
        Ok(Published::Dropped) => ZENITH_DROPPED,
        Err(e) => report("publish", handle, &e),
    }
}

/// Take the next frame from the session's draining cursor.
///
/// # Arguments
/// * `out_buf` - Buffer to copy the frame into.
/// * `inout_len` - Input: size of `out_buf`. Output: frame length.
/// * `out_meta` - Optional frame metadata.
///
/// # Returns
/// * 0 on success.
/// * `ZENITH_ERROR_EMPTY` if no frame is available.
/// * `ZENITH_ERROR_BUFFER_TOO_SMALL` with the needed size in `*inout_len`;
///   the frame is kept for the next call.
#[no_mangle]
pub extern "C" fn zenith_poll(
    handle: u64,
    out_buf: *mut u8,
    inout_len: *mut usize,
    out_meta: *mut ZenithDeliveryMeta,
) -> i32 {
    if out_buf.is_null() || inout_len.is_null() {
        return ZENITH_ERROR_NULL_POINTER;
    }
    let Some(entry) = lookup(handle) else {
        return ZENITH_ERROR_CLOSED_HANDLE;
    };

    let mut pending = entry.pending.lock();
    let delivery = match pending.take() {
        Some(delivery) => delivery,
        None => match entry.session.poll() {
            Ok(Some(delivery)) => delivery,
            Ok(None) => return ZENITH_ERROR_EMPTY,
            Err(e) => return report("poll", handle, &e),
        },
    };

    let capacity = unsafe { *inout_len };
    unsafe { *inout_len = delivery.frame.len() };
    if delivery.frame.len() > capacity {
        *pending = Some(delivery);
        return ZENITH_ERROR_BUFFER_TOO_SMALL;
    }

    unsafe {
        ptr::copy_nonoverlapping(delivery.frame.as_ptr(), out_buf, delivery.frame.len());
        if !out_meta.is_null() {
            *out_meta = ZenithDeliveryMeta {
                sequence: delivery.sequence,
                caller_seq_no: delivery.caller_seq_no,
                source_id: delivery.source_id,
                reserved: 0,
                lost: delivery.lost,
            };
        }
    }
    ZENITH_SUCCESS
}

/// Load a wasm plugin (binary or text) into the session's chain.
#[no_mangle]
pub extern "C" fn zenith_load_plugin(
    handle: u64,
    bytes: *const u8,
    len: usize,
    out_plugin_id: *mut u64,
) -> i32 {
    if bytes.is_null() || out_plugin_id.is_null() {
        return ZENITH_ERROR_NULL_POINTER;
    }
    let Some(entry) = lookup(handle) else {
        return ZENITH_ERROR_CLOSED_HANDLE;
    };
    let module = unsafe { std::slice::from_raw_parts(bytes, len) };

    match entry.session.load_plugin(module) {
        Ok(id) => {
            unsafe { *out_plugin_id = id.0 };
            ZENITH_SUCCESS
        }
        Err(e) => report("load_plugin", handle, &e),
    }
}

/// Remove a plugin from the chain.
///
/// Returns `ZENITH_ERROR_INVALID_PLUGIN` if no such plugin is loaded.
#[no_mangle]
pub extern "C" fn zenith_unload_plugin(handle: u64, plugin_id: u64) -> i32 {
    let Some(entry) = lookup(handle) else {
        return ZENITH_ERROR_CLOSED_HANDLE;
    };
    match entry.session.unload_plugin(PluginId(plugin_id)) {
        Ok(true) => ZENITH_SUCCESS,
        Ok(false) => ZENITH_ERROR_INVALID_PLUGIN,
        Err(e) => report("unload_plugin", handle, &e),
    }
}

#[no_mangle]
pub extern "C" fn zenith_get_stats(handle: u64, out_stats: *mut ZenithStats) -> i32 {
    if out_stats.is_null() {
        return ZENITH_ERROR_NULL_POINTER;
    }
    let Some(entry) = lookup(handle) else {
        return ZENITH_ERROR_CLOSED_HANDLE;
    };
    match entry.session.get_stats() {
        Ok(stats) => {
            unsafe {
                *out_stats = ZenithStats {
                    buffer_len: stats.buffer_len,
                    plugin_count: stats.plugin_count,
                    published: stats.published,
                    dropped_by_full: stats.dropped_by_full,
                    dropped_by_plugin: stats.dropped_by_plugin,
                    plugin_faults: stats.plugin_faults,
                };
            }
            ZENITH_SUCCESS
        }
        Err(e) => report("get_stats", handle, &e),
    }
}

/// Close a session and release its handle.
///
/// Closing an unknown or already closed handle succeeds.
#[no_mangle]
pub extern "C" fn zenith_close(handle: u64) -> i32 {
    let removed = SESSIONS.lock().remove(&handle);
    match removed {
        Some(entry) => {
            // waits for calls still running on other threads
            entry.session.close();
            if let Some(lost) = entry.pending.lock().take() {
                warn!(handle, sequence = lost.sequence, "closing with an undelivered frame");
            }
        }
        None => debug!(handle, "close of unknown handle ignored"),
    }
    ZENITH_SUCCESS
}

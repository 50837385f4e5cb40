use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::CachePadded;
use serde::Serialize;

/// Point-in-time session counters.
///
/// Each field is read with its own atomic load while publishers may still be
/// running, so fields are individually exact but not a consistent snapshot
/// of one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Stats {
    /// Slots not yet taken by the draining consumer.
    pub buffer_len: u64,
    pub plugin_count: u64,
    /// Frames accepted by `publish`, whatever their fate in the chain.
    pub published: u64,
    /// Slots evicted unread, or publishes refused under the reject policy.
    pub dropped_by_full: u64,
    /// Frames dropped by a plugin, including frames lost to plugin faults.
    pub dropped_by_plugin: u64,
    pub plugin_faults: u64,
}

/// Hot-path counters, each on its own cache line.
#[derive(Debug, Default)]
pub(crate) struct SessionCounters {
    pub(crate) published: CachePadded<AtomicU64>,
    pub(crate) dropped_by_plugin: CachePadded<AtomicU64>,
    pub(crate) plugin_faults: CachePadded<AtomicU64>,
}

impl SessionCounters {
    #[inline]
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn read(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

use tracing::debug;

use super::Buffer::{Polled, RingBuffer};

/// A consumer-owned read position over a ring.
///
/// Cursors never touch shared ring state, so any number of them can follow
/// the same ring independently.
#[derive(Debug, Clone, Default)]
pub struct Cursor {
    last_seen: Option<u64>,
    lost: u64,
}

impl Cursor {
    /// A cursor that starts at the oldest sequence ever published.
    pub fn new() -> Self {
        Self::default()
    }

    /// A cursor positioned just after `sequence`.
    pub fn after(sequence: u64) -> Self {
        Self {
            last_seen: Some(sequence),
            lost: 0,
        }
    }

    /// A cursor that only sees sequences published from now on.
    pub fn at_head(ring: &RingBuffer) -> Self {
        Self {
            last_seen: ring.head().checked_sub(1),
            lost: 0,
        }
    }

    /// Read the next slot and advance past it.
    pub fn poll(&mut self, ring: &RingBuffer) -> Polled {
        let polled = ring.poll(self.last_seen);
        if let Some(entry) = polled.entry() {
            let lost = polled.lost();
            if lost > 0 {
                debug!(
                    lost,
                    resumed_at = entry.sequence,
                    "cursor fell behind, sequences overwritten"
                );
                self.lost += lost;
            }
            self.last_seen = Some(entry.sequence);
        }
        polled
    }

    /// Last sequence returned, if any.
    pub fn last_seen(&self) -> Option<u64> {
        self.last_seen
    }

    /// Total sequences this cursor missed because they were overwritten.
    pub fn lost(&self) -> u64 {
        self.lost
    }
}

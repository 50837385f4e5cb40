use std::mem::size_of;
use std::ptr;
use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed, Release};
use std::sync::atomic::{fence, AtomicU64};

use crossbeam_utils::{Backoff, CachePadded};
use tracing::trace;

use super::layout::{
    committed_stamp, stamp_is_writing, stamp_sequence, writing_stamp, RingHeader, SlotHeader,
    FLAG_REJECT_WHEN_FULL, RING_LAYOUT_VERSION, RING_MAGIC,
};
use super::Buffer::{OverflowPolicy, Polled, RingBuffer, RingEntry};
use crate::error::{EngineError, Result};
use crate::Core::SharedMemory::{
    align_up, attach_shared_memory, create_heap_region, create_shared_memory, SharedMemoryBackend,
};

/// Outcome of reading one sequence from its slot.
enum SlotRead {
    Committed(RingEntry),
    /// Claimed but not yet committed, or not claimed at all.
    NotReady,
    /// A newer sequence owns the slot.
    Overwritten,
}

/// Sizes of a ring region: (header bytes, slot stride, total bytes).
fn region_layout(capacity: usize, slot_size: usize) -> Result<(usize, usize, usize)> {
    if capacity == 0 || !capacity.is_power_of_two() {
        return Err(EngineError::InvalidCapacity(format!(
            "capacity must be a power of two and greater than zero, got {capacity}"
        )));
    }
    if slot_size == 0 || slot_size > u32::MAX as usize {
        return Err(EngineError::InvalidCapacity(format!(
            "slot size must be between 1 and {} bytes, got {slot_size}",
            u32::MAX
        )));
    }

    let header_size = align_up(size_of::<RingHeader>());
    let stride = align_up(size_of::<SlotHeader>() + slot_size);
    let total = capacity
        .checked_mul(stride)
        .and_then(|slots| slots.checked_add(header_size))
        .ok_or_else(|| {
            EngineError::InvalidCapacity(format!(
                "{capacity} slots of {slot_size} bytes overflow the address space"
            ))
        })?;
    Ok((header_size, stride, total))
}

impl RingBuffer {
    /// Create a process-private ring with the default overwrite policy.
    pub fn create(capacity: usize, slot_size: usize) -> Result<Self> {
        Self::create_with_policy(capacity, slot_size, OverflowPolicy::Overwrite)
    }

    /// Create a process-private ring.
    pub fn create_with_policy(
        capacity: usize,
        slot_size: usize,
        policy: OverflowPolicy,
    ) -> Result<Self> {
        let (_, _, total) = region_layout(capacity, slot_size)?;
        let region = create_heap_region(total)?;
        unsafe { Self::init(region, capacity, slot_size, policy) }
    }

    /// Create a ring in `/dev/shm/<name>` that other processes can attach to.
    pub fn create_shared(
        name: &str,
        capacity: usize,
        slot_size: usize,
        policy: OverflowPolicy,
    ) -> Result<Self> {
        let (_, _, total) = region_layout(capacity, slot_size)?;
        let region = create_shared_memory(total, name)?;
        unsafe { Self::init(region, capacity, slot_size, policy) }
    }

    /// Attach to a ring created by `create_shared`, possibly in another process.
    pub fn attach(name: &str) -> Result<Self> {
        let region = attach_shared_memory(name)?;
        if region.size() < size_of::<RingHeader>() {
            return Err(invalid_region("region too small for ring header"));
        }

        let header = region.as_ptr() as *const RingHeader;
        let (magic, version, flags, capacity, slot_size, stride) = unsafe {
            let h = &*header;
            (
                h.magic,
                h.version,
                h.flags,
                h.capacity as usize,
                h.slot_size as usize,
                h.slot_stride as usize,
            )
        };

        if magic != RING_MAGIC {
            return Err(invalid_region(
                "invalid magic number - region is not a zenith ring",
            ));
        }
        if version != RING_LAYOUT_VERSION {
            return Err(invalid_region(&format!(
                "ring layout version {version} is not supported (expected {RING_LAYOUT_VERSION})"
            )));
        }

        let (header_size, expected_stride, total) = region_layout(capacity, slot_size)?;
        if stride != expected_stride || region.size() < total {
            return Err(invalid_region("ring geometry does not match region size"));
        }

        let policy = if flags & FLAG_REJECT_WHEN_FULL != 0 {
            OverflowPolicy::Reject
        } else {
            OverflowPolicy::Overwrite
        };
        let slots_base = unsafe { region.as_ptr().add(header_size) };

        Ok(Self {
            region,
            header,
            slots_base,
            capacity,
            mask: capacity - 1,
            slot_size,
            stride,
            policy,
        })
    }

    /// Write a fresh header into `region` and reset every slot.
    ///
    /// # Safety
    /// `region` must be at least as large as `region_layout` reports and not
    /// mapped by any other live ring view.
    unsafe fn init(
        region: Box<dyn SharedMemoryBackend>,
        capacity: usize,
        slot_size: usize,
        policy: OverflowPolicy,
    ) -> Result<Self> {
        let (header_size, stride, total) = region_layout(capacity, slot_size)?;
        if region.size() < total {
            return Err(invalid_region("region smaller than ring layout"));
        }

        let header = region.as_ptr() as *mut RingHeader;
        ptr::write(
            header,
            RingHeader {
                magic: RING_MAGIC,
                version: RING_LAYOUT_VERSION,
                flags: match policy {
                    OverflowPolicy::Overwrite => 0,
                    OverflowPolicy::Reject => FLAG_REJECT_WHEN_FULL,
                },
                capacity: capacity as u64,
                slot_size: slot_size as u64,
                slot_stride: stride as u64,
                head: CachePadded::new(AtomicU64::new(0)),
                tail: CachePadded::new(AtomicU64::new(0)),
                dropped_by_full: CachePadded::new(AtomicU64::new(0)),
                unreported_evictions: CachePadded::new(AtomicU64::new(0)),
            },
        );

        let ring = Self {
            slots_base: region.as_ptr().add(header_size),
            region,
            header,
            capacity,
            mask: capacity - 1,
            slot_size,
            stride,
            policy,
        };
        ring.init_slots();
        Ok(ring)
    }

    /// Mark every slot as never written. Only the creator calls this.
    unsafe fn init_slots(&self) {
        for k in 0..self.capacity {
            let slot = self.slot_mut(k);
            ptr::write(
                slot,
                SlotHeader {
                    stamp: AtomicU64::new(0),
                    sequence: 0,
                    caller_seq_no: 0,
                    source_id: 0,
                    length: 0,
                },
            );
        }
    }

    #[inline]
    pub(crate) fn header(&self) -> &RingHeader {
        // Safety: the header lives as long as `region`, which we own.
        unsafe { &*self.header }
    }

    #[inline]
    unsafe fn slot_mut(&self, index: usize) -> *mut SlotHeader {
        self.slots_base.add(index * self.stride) as *mut SlotHeader
    }

    #[inline]
    unsafe fn payload_mut(slot: *mut SlotHeader) -> *mut u8 {
        (slot as *mut u8).add(size_of::<SlotHeader>())
    }

    /// Publish `payload`, returning its transport-assigned sequence.
    ///
    /// Never waits for consumers. Under `Overwrite` a full ring evicts its
    /// oldest unconsumed slot and counts it in `dropped_by_full`; under
    /// `Reject` the call fails with `BufferFull`.
    ///
    /// Under `Overwrite` a producer lapped by `capacity` newer publishes
    /// before it could write still gets its sequence back, but the frame never
    /// reaches the ring. Readers see that sequence as lost.
    pub fn publish(&self, payload: &[u8], source_id: u32, caller_seq_no: u64) -> Result<u64> {
        if payload.len() > self.slot_size {
            return Err(EngineError::OversizeBatch {
                len: payload.len(),
                max: self.slot_size,
            });
        }

        let seq = match self.policy {
            OverflowPolicy::Overwrite => self.claim_overwriting(),
            OverflowPolicy::Reject => self.claim_if_space()?,
        };
        if !self.write_slot(seq, payload, source_id, caller_seq_no) {
            trace!(sequence = seq, source_id, "slot lapped before write, frame lost");
        }
        Ok(seq)
    }

    fn claim_overwriting(&self) -> u64 {
        let header = self.header();
        let cap = self.capacity as u64;
        let seq = header.head.fetch_add(1, AcqRel);

        if seq >= cap {
            // everything below `floor` shares a slot with a newer sequence
            let floor = seq + 1 - cap;
            let prev = header.tail.fetch_max(floor, AcqRel);
            if floor > prev {
                header.dropped_by_full.fetch_add(floor - prev, Relaxed);
                header.unreported_evictions.fetch_add(floor - prev, Relaxed);
                trace!(sequence = seq, evicted = floor - prev, "ring full, evicted oldest");
            }
        }
        seq
    }

    fn claim_if_space(&self) -> Result<u64> {
        let header = self.header();
        let cap = self.capacity as u64;
        let backoff = Backoff::new();

        loop {
            let head = header.head.load(Acquire);
            let tail = header.tail.load(Acquire);
            if head.saturating_sub(tail) >= cap {
                header.dropped_by_full.fetch_add(1, Relaxed);
                return Err(EngineError::BufferFull);
            }
            if header
                .head
                .compare_exchange_weak(head, head + 1, AcqRel, Relaxed)
                .is_ok()
            {
                return Ok(head);
            }
            // logical contention, retry
            backoff.spin();
        }
    }

    /// Take exclusive ownership of `seq`'s slot, write it and commit.
    /// Returns false when a newer lap already owns the slot; the sequence is
    /// then lost and was counted by the producer that lapped it.
    fn write_slot(&self, seq: u64, payload: &[u8], source_id: u32, caller_seq_no: u64) -> bool {
        let slot = unsafe { self.slot_mut((seq as usize) & self.mask) };
        let stamp = unsafe { &(*slot).stamp };
        let backoff = Backoff::new();

        loop {
            let current = stamp.load(Acquire);
            if let Some(owner) = stamp_sequence(current) {
                if owner >= seq {
                    return false;
                }
            }
            if stamp_is_writing(current) {
                // an older lap is still writing this slot
                backoff.snooze();
                continue;
            }
            if stamp
                .compare_exchange_weak(current, writing_stamp(seq), AcqRel, Relaxed)
                .is_ok()
            {
                break;
            }
        }

        unsafe {
            ptr::addr_of_mut!((*slot).sequence).write_volatile(seq);
            ptr::addr_of_mut!((*slot).caller_seq_no).write_volatile(caller_seq_no);
            ptr::addr_of_mut!((*slot).source_id).write_volatile(source_id);
            ptr::addr_of_mut!((*slot).length).write_volatile(payload.len() as u32);
            ptr::copy_nonoverlapping(payload.as_ptr(), Self::payload_mut(slot), payload.len());
        }

        // Publish
        stamp.store(committed_stamp(seq), Release);
        true
    }

    /// Copy `seq` out of its slot, validating the stamp around the copy.
    fn read_slot(&self, seq: u64) -> SlotRead {
        let slot = unsafe { self.slot_mut((seq as usize) & self.mask) };
        let stamp = unsafe { &(*slot).stamp };

        let before = stamp.load(Acquire);
        match stamp_sequence(before) {
            Some(owner) if owner > seq => return SlotRead::Overwritten,
            Some(owner) if owner == seq && !stamp_is_writing(before) => {}
            _ => return SlotRead::NotReady,
        }

        let entry = unsafe {
            let length = ptr::addr_of!((*slot).length).read_volatile() as usize;
            let length = length.min(self.slot_size);
            let mut payload = vec![0u8; length];
            ptr::copy_nonoverlapping(Self::payload_mut(slot), payload.as_mut_ptr(), length);
            RingEntry {
                sequence: ptr::addr_of!((*slot).sequence).read_volatile(),
                source_id: ptr::addr_of!((*slot).source_id).read_volatile(),
                caller_seq_no: ptr::addr_of!((*slot).caller_seq_no).read_volatile(),
                payload,
            }
        };

        fence(Acquire);
        if stamp.load(Relaxed) != before {
            // a newer lap took the slot while we copied
            return SlotRead::Overwritten;
        }
        SlotRead::Committed(entry)
    }

    /// Read the first slot with `sequence > last_seen` without consuming it.
    ///
    /// `None` reads from the very beginning. If that sequence was already
    /// overwritten, the oldest still-available slot is returned as a `Gap`.
    pub fn poll(&self, last_seen: Option<u64>) -> Polled {
        let requested = last_seen.map_or(0, |seq| seq.saturating_add(1));
        let cap = self.capacity as u64;
        let mut next = requested;

        loop {
            let head = self.header().head.load(Acquire);
            if next >= head {
                return Polled::Empty;
            }
            let oldest = head.saturating_sub(cap);
            if next < oldest {
                next = oldest;
            }

            match self.read_slot(next) {
                SlotRead::Committed(entry) => {
                    return if next > requested {
                        Polled::Gap {
                            lost: next - requested,
                            entry,
                        }
                    } else {
                        Polled::Ready(entry)
                    };
                }
                SlotRead::NotReady => return Polled::Empty,
                SlotRead::Overwritten => next += 1,
            }
        }
    }

    /// Consume the slot at `tail` for the ring's draining consumer.
    ///
    /// Slots evicted since the previous successful take are reported as a
    /// `Gap` on the next one. With several takers the count goes to
    /// whichever takes next; the total across takers is exact.
    pub fn take(&self) -> Polled {
        let header = self.header();
        let backoff = Backoff::new();

        loop {
            let tail = header.tail.load(Acquire);
            let head = header.head.load(Acquire);
            if tail >= head {
                return Polled::Empty;
            }

            match self.read_slot(tail) {
                SlotRead::Committed(entry) => {
                    if header
                        .tail
                        .compare_exchange(tail, tail + 1, AcqRel, Relaxed)
                        .is_ok()
                    {
                        let lost = header.unreported_evictions.swap(0, AcqRel);
                        if lost > 0 {
                            return Polled::Gap { lost, entry };
                        }
                        return Polled::Ready(entry);
                    }
                    // another taker won or a producer evicted it
                }
                SlotRead::NotReady => return Polled::Empty,
                SlotRead::Overwritten => backoff.spin(),
            }
        }
    }

    /// Unread slot count relative to the draining consumer.
    pub fn len(&self) -> usize {
        let header = self.header();
        let tail = header.tail.load(Acquire);
        let head = header.head.load(Acquire);
        (head.saturating_sub(tail) as usize).min(self.capacity)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Next sequence a producer will claim.
    pub fn head(&self) -> u64 {
        self.header().head.load(Acquire)
    }

    /// Next sequence the draining consumer will take.
    pub fn tail(&self) -> u64 {
        self.header().tail.load(Acquire)
    }

    /// Oldest sequence that can still be read.
    pub fn oldest_available(&self) -> u64 {
        self.head().saturating_sub(self.capacity as u64)
    }

    pub fn dropped_by_full(&self) -> u64 {
        self.header().dropped_by_full.load(Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    /// Size in bytes of one slot stride in memory.
    pub fn slot_stride(&self) -> usize {
        self.stride
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }
}

fn invalid_region(msg: &str) -> EngineError {
    EngineError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, msg.to_string()))
}

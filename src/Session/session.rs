//! Session lifecycle and the publish/poll data path.
//!
//! Every operation registers itself in `in_flight` before checking the
//! state, and `close` flips the state before waiting for `in_flight` to
//! drain. Both sides use `SeqCst`, so once `close` observes zero in-flight
//! calls no operation can still be holding, or later obtain, a reference to
//! the session's resources.

use std::cell::UnsafeCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize};
use std::sync::Arc;

use crossbeam_utils::{Backoff, CachePadded};
use parking_lot::RwLock;
use tracing::{debug, info, trace, warn};

use super::stats::{SessionCounters, Stats};
use crate::config::SessionConfig;
use crate::error::{EngineError, Expected, Result};
use crate::Codec::{self, RecordBatch, Schema};
use crate::Plugin::{run_chain, Action, CallContext, PluginChain, PluginHost, PluginId, PluginStats};
use crate::Ring::{Cursor, Polled, RingBuffer, RingEntry};

const OPEN: u8 = 0;
const CLOSING: u8 = 1;
const CLOSED: u8 = 2;

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    /// `close` is waiting for in-flight calls to finish.
    Closing,
    Closed,
}

/// Result of a successful `publish`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Published {
    /// Written to the ring at this sequence.
    Sequence(u64),
    /// Dropped by the plugin chain.
    Dropped,
}

impl Published {
    pub fn sequence(self) -> Option<u64> {
        match self {
            Published::Sequence(seq) => Some(seq),
            Published::Dropped => None,
        }
    }

    pub fn is_dropped(self) -> bool {
        self == Published::Dropped
    }
}

/// A frame read back from the ring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub sequence: u64,
    pub source_id: u32,
    pub caller_seq_no: u64,
    pub frame: Vec<u8>,
    /// Sequences overwritten between the previous read and this one.
    pub lost: u64,
}

impl Delivery {
    fn from_entry(entry: RingEntry, lost: u64) -> Self {
        Self {
            sequence: entry.sequence,
            source_id: entry.source_id,
            caller_seq_no: entry.caller_seq_no,
            frame: entry.payload,
            lost,
        }
    }
}

/// What a source is known to publish.
#[derive(Debug, Clone)]
struct Registration {
    fingerprint: u64,
    /// Absent when only the fingerprint was registered.
    schema: Option<Arc<Schema>>,
}

/// Resources released exactly once by `close`.
struct Inner {
    ring: RingBuffer,
    host: PluginHost,
    chain: PluginChain,
    schemas: RwLock<HashMap<u32, Registration>>,
    next_plugin_id: AtomicU64,
}

/// One data plane: a ring, a plugin chain and a schema registry.
pub struct Session {
    config: SessionConfig,
    state: AtomicU8,
    in_flight: CachePadded<AtomicUsize>,
    counters: SessionCounters,
    inner: UnsafeCell<Option<Inner>>,
}

// Safety: `inner` is only mutated by the `close` call that won the
// Open -> Closing transition, after `in_flight` reached zero.
unsafe impl Sync for Session {}

/// Keeps `close` waiting while an operation is running.
struct CallGuard<'a> {
    in_flight: &'a AtomicUsize,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, SeqCst);
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state())
            .field("config", &self.config)
            .field("in_flight", &self.in_flight.load(SeqCst))
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Open a process-private session with `buffer_size` ring slots and
    /// default settings otherwise.
    pub fn open(buffer_size: usize) -> Result<Self> {
        Self::open_with(SessionConfig::new(buffer_size))
    }

    pub fn open_with(config: SessionConfig) -> Result<Self> {
        config.validate()?;
        let ring = match &config.shared_name {
            Some(name) => RingBuffer::create_shared(
                name,
                config.capacity,
                config.slot_size,
                config.overflow,
            )?,
            None => {
                RingBuffer::create_with_policy(config.capacity, config.slot_size, config.overflow)?
            }
        };
        let session = Self::with_ring(config, ring)?;
        info!(
            capacity = session.config.capacity,
            slot_size = session.config.slot_size,
            overflow = ?session.config.overflow,
            shared = ?session.config.shared_name,
            "session opened"
        );
        Ok(session)
    }

    /// Open a session over a ring another process created with a shared name.
    pub fn attach(name: &str) -> Result<Self> {
        let ring = RingBuffer::attach(name)?;
        let config = SessionConfig::new(ring.capacity())
            .with_slot_size(ring.slot_size())
            .with_overflow(ring.policy())
            .with_shared_name(name);
        let session = Self::with_ring(config, ring)?;
        info!(shm = name, head = session.ring_head(), "session attached to shared ring");
        Ok(session)
    }

    fn with_ring(config: SessionConfig, ring: RingBuffer) -> Result<Self> {
        let host = PluginHost::new(config.sandbox.clone())?;
        Ok(Self {
            config,
            state: AtomicU8::new(OPEN),
            in_flight: CachePadded::new(AtomicUsize::new(0)),
            counters: SessionCounters::default(),
            inner: UnsafeCell::new(Some(Inner {
                ring,
                host,
                chain: PluginChain::new(),
                schemas: RwLock::new(HashMap::new()),
                next_plugin_id: AtomicU64::new(1),
            })),
        })
    }

    fn ring_head(&self) -> u64 {
        self.with_inner(|inner| Ok(inner.ring.head())).unwrap_or(0)
    }

    /// Run `f` against the open session's resources.
    fn with_inner<R>(&self, f: impl FnOnce(&Inner) -> Result<R>) -> Result<R> {
        self.in_flight.fetch_add(1, SeqCst);
        let _guard = CallGuard {
            in_flight: &self.in_flight,
        };
        if self.state.load(SeqCst) != OPEN {
            return Err(EngineError::ClosedHandle);
        }
        // Safety: state was Open after we registered in `in_flight`, so
        // `close` cannot take `inner` until `_guard` drops.
        let inner = unsafe { (*self.inner.get()).as_ref() }.ok_or(EngineError::ClosedHandle)?;
        f(inner)
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        match self.state.load(SeqCst) {
            OPEN => SessionState::Open,
            CLOSING => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state() != SessionState::Open
    }

    /// Encode `batch`, run it through the plugin chain and write the result
    /// to the ring.
    pub fn publish(&self, batch: &RecordBatch, source_id: u32, caller_seq_no: u64) -> Result<Published> {
        self.with_inner(|inner| {
            inner.check_fingerprint(source_id, batch.fingerprint())?;
            let len = Codec::encoded_len(batch);
            if len > inner.ring.slot_size() {
                return Err(EngineError::OversizeBatch {
                    len,
                    max: inner.ring.slot_size(),
                });
            }
            let frame = Codec::encode(batch);
            self.dispatch(inner, &frame, source_id, caller_seq_no)
        })
    }

    /// Publish an already encoded frame.
    pub fn publish_frame(&self, frame: &[u8], source_id: u32, caller_seq_no: u64) -> Result<Published> {
        self.with_inner(|inner| {
            if frame.len() > inner.ring.slot_size() {
                return Err(EngineError::OversizeBatch {
                    len: frame.len(),
                    max: inner.ring.slot_size(),
                });
            }
            let info = Codec::inspect(frame)?;
            inner.check_fingerprint(source_id, info.fingerprint)?;
            self.dispatch(inner, frame, source_id, caller_seq_no)
        })
    }

    fn dispatch(
        &self,
        inner: &Inner,
        frame: &[u8],
        source_id: u32,
        caller_seq_no: u64,
    ) -> Result<Published> {
        SessionCounters::bump(&self.counters.published);

        let chain = inner.chain.snapshot();
        let action = if chain.is_empty() {
            Ok(Action::Pass)
        } else {
            run_chain(&chain, frame, CallContext { source_id, caller_seq_no })
        };

        let sequence = match action {
            Ok(Action::Pass) => inner.ring.publish(frame, source_id, caller_seq_no)?,
            Ok(Action::Replace(replacement)) => {
                inner.ring.publish(&replacement, source_id, caller_seq_no)?
            }
            Ok(Action::Drop) => {
                SessionCounters::bump(&self.counters.dropped_by_plugin);
                return Ok(Published::Dropped);
            }
            Err(_fault) => {
                SessionCounters::bump(&self.counters.plugin_faults);
                SessionCounters::bump(&self.counters.dropped_by_plugin);
                return Ok(Published::Dropped);
            }
        };
        trace!(sequence, source_id, caller_seq_no, "frame published");
        Ok(Published::Sequence(sequence))
    }

    /// Take the next frame from the ring's shared draining cursor.
    ///
    /// `lost` on the delivery counts frames evicted unread since the
    /// previous poll.
    pub fn poll(&self) -> Result<Option<Delivery>> {
        self.with_inner(|inner| {
            Ok(match inner.ring.take() {
                Polled::Empty => None,
                Polled::Ready(entry) => {
                    trace!(sequence = entry.sequence, "frame delivered");
                    Some(Delivery::from_entry(entry, 0))
                }
                Polled::Gap { lost, entry } => {
                    debug!(lost, resumed_at = entry.sequence, "draining poll fell behind");
                    Some(Delivery::from_entry(entry, lost))
                }
            })
        })
    }

    /// Read the next frame after `cursor` without consuming it for others.
    pub fn poll_from(&self, cursor: &mut Cursor) -> Result<Option<Delivery>> {
        self.with_inner(|inner| {
            Ok(match cursor.poll(&inner.ring) {
                Polled::Empty => None,
                Polled::Ready(entry) => Some(Delivery::from_entry(entry, 0)),
                Polled::Gap { lost, entry } => Some(Delivery::from_entry(entry, lost)),
            })
        })
    }

    /// A cursor that starts at the oldest frame still in the ring.
    pub fn subscribe(&self) -> Result<Cursor> {
        self.with_inner(|_| Ok(Cursor::new()))
    }

    /// A cursor that only sees frames published after this call.
    pub fn subscribe_latest(&self) -> Result<Cursor> {
        self.with_inner(|inner| Ok(Cursor::at_head(&inner.ring)))
    }

    /// Decode a delivery with the schema registered for its source.
    pub fn decode(&self, delivery: &Delivery) -> Result<RecordBatch> {
        self.with_inner(|inner| {
            let schema = inner
                .schemas
                .read()
                .get(&delivery.source_id)
                .and_then(|r| r.schema.clone());
            match schema {
                Some(schema) => Codec::decode(&delivery.frame, &schema),
                None => Err(EngineError::SchemaMismatch {
                    expected: Expected::Unregistered,
                    found: Codec::peek_fingerprint(&delivery.frame)?,
                }),
            }
        })
    }

    /// Bind `source_id` to `schema`; later publishes from that source must
    /// carry its fingerprint.
    pub fn register_schema(&self, source_id: u32, schema: Schema) -> Result<()> {
        self.with_inner(|inner| {
            let fingerprint = schema.fingerprint();
            debug!(source_id, schema = schema.name(), fingerprint, "schema registered");
            inner.schemas.write().insert(
                source_id,
                Registration {
                    fingerprint,
                    schema: Some(Arc::new(schema)),
                },
            );
            Ok(())
        })
    }

    /// Bind `source_id` to a bare fingerprint. Frames are checked but
    /// `decode` has no schema for this source.
    pub fn register_fingerprint(&self, source_id: u32, fingerprint: u64) -> Result<()> {
        self.with_inner(|inner| {
            debug!(source_id, fingerprint, "fingerprint registered");
            inner.schemas.write().insert(
                source_id,
                Registration {
                    fingerprint,
                    schema: None,
                },
            );
            Ok(())
        })
    }

    /// Load a wasm plugin and append it to the chain.
    pub fn load_plugin(&self, module_bytes: &[u8]) -> Result<PluginId> {
        self.with_inner(|inner| {
            let id = PluginId(inner.next_plugin_id.fetch_add(1, SeqCst));
            let plugin = inner
                .host
                .load(id, module_bytes, inner.ring.slot_size())
                .inspect_err(|e| warn!(plugin = %id, error = %e, "plugin rejected"))?;
            info!(plugin = %id, entry = plugin.entry_name(), "plugin loaded");
            inner.chain.push(Arc::new(plugin));
            Ok(id)
        })
    }

    /// Remove a plugin from future publishes. Returns false if it was not loaded.
    pub fn unload_plugin(&self, id: PluginId) -> Result<bool> {
        self.with_inner(|inner| {
            let removed = inner.chain.remove(id);
            if removed.is_some() {
                info!(plugin = %id, "plugin unloaded");
            }
            Ok(removed.is_some())
        })
    }

    pub fn plugin_stats(&self) -> Result<Vec<PluginStats>> {
        self.with_inner(|inner| Ok(inner.chain.stats()))
    }

    pub fn get_stats(&self) -> Result<Stats> {
        self.with_inner(|inner| {
            Ok(Stats {
                buffer_len: inner.ring.len() as u64,
                plugin_count: inner.chain.len() as u64,
                published: SessionCounters::read(&self.counters.published),
                dropped_by_full: inner.ring.dropped_by_full(),
                dropped_by_plugin: SessionCounters::read(&self.counters.dropped_by_plugin),
                plugin_faults: SessionCounters::read(&self.counters.plugin_faults),
            })
        })
    }

    /// Close the session, waiting for in-flight calls to finish.
    ///
    /// Idempotent: closing a closed (or closing) session returns at once.
    pub fn close(&self) {
        if self
            .state
            .compare_exchange(OPEN, CLOSING, SeqCst, SeqCst)
            .is_err()
        {
            return;
        }

        let backoff = Backoff::new();
        while self.in_flight.load(SeqCst) != 0 {
            backoff.snooze();
        }

        // Safety: we won the Open -> Closing transition and no call is in
        // flight, so nothing else can observe `inner`.
        let inner = unsafe { (*self.inner.get()).take() };
        self.state.store(CLOSED, SeqCst);

        if let Some(inner) = inner {
            info!(
                published = SessionCounters::read(&self.counters.published),
                dropped_by_full = inner.ring.dropped_by_full(),
                dropped_by_plugin = SessionCounters::read(&self.counters.dropped_by_plugin),
                plugin_faults = SessionCounters::read(&self.counters.plugin_faults),
                "session closed"
            );
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

impl Inner {
    fn check_fingerprint(&self, source_id: u32, found: u64) -> Result<()> {
        match self.schemas.read().get(&source_id) {
            Some(registered) if registered.fingerprint != found => {
                Err(EngineError::mismatch(registered.fingerprint, found))
            }
            _ => Ok(()),
        }
    }
}

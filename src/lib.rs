// Module naming follows project convention (capitalized component modules)
#[allow(non_snake_case)]
pub mod Ring {
    pub mod Buffer {
        pub mod Buffer;
        pub mod Buffer_impl;
        pub mod layout;
        pub use Buffer::{OverflowPolicy, Polled, RingBuffer, RingEntry, DEFAULT_SLOT_SIZE}; // re-export for stable path
        pub use layout::{RingHeader, SlotHeader};
    }
    pub mod cursor;
    mod debug;
    pub use cursor::Cursor;
    pub use Buffer::{OverflowPolicy, Polled, RingBuffer, RingEntry, DEFAULT_SLOT_SIZE};
}
#[allow(non_snake_case)]
pub mod Codec {
    pub mod batch;
    pub mod frame;
    pub mod schema;
    pub use batch::{bitmap_len, Column, NativeValue, RecordBatch};
    pub use frame::{
        decode, encode, encode_into, encoded_len, inspect, peek_fingerprint, FrameInfo,
        FRAME_HEADER_LEN,
    };
    pub use schema::{DataType, Field, Schema};
}
#[allow(non_snake_case)]
pub mod Plugin {
    pub mod chain;
    pub mod sandbox;
    pub use chain::{run_chain, PluginChain};
    pub use sandbox::{
        Action, CallContext, Plugin, PluginHost, PluginId, PluginStats, SandboxConfig,
        ACTION_DROP, ACTION_PASS, ACTION_REPLACE, CALL_CONTEXT_LEN,
    };
}
#[allow(non_snake_case)]
pub mod Session {
    pub mod session;
    pub mod stats;
    pub use session::{Delivery, Published, Session, SessionState};
    pub use stats::Stats;
}
#[allow(non_snake_case)]
pub mod Core {
    pub mod SharedMemory;
    pub use SharedMemory::{attach_shared_memory, create_shared_memory, RawHandle, SharedMemoryBackend};
}
#[allow(non_snake_case)]
pub mod Debug {
    pub mod StructDebug;
}

pub mod config;
pub mod error;
pub mod ffi;

pub use config::SessionConfig;
pub use error::{EngineError, Expected, Result};

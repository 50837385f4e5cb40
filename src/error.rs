//! Engine error taxonomy.
//!
//! Transport and codec malformations surface synchronously to the caller.
//! Plugin faults are recorded against the plugin and never returned from
//! `publish`. Every variant maps to a stable C ABI return code.

use thiserror::Error;

// C ABI return codes
pub const ZENITH_SUCCESS: i32 = 0;
pub const ZENITH_DROPPED: i32 = 1;
pub const ZENITH_ERROR_NULL_POINTER: i32 = -1;
pub const ZENITH_ERROR_INVALID_CAPACITY: i32 = -2;
pub const ZENITH_ERROR_OVERSIZE_BATCH: i32 = -3;
pub const ZENITH_ERROR_SCHEMA_MISMATCH: i32 = -4;
pub const ZENITH_ERROR_CORRUPT_FRAME: i32 = -5;
pub const ZENITH_ERROR_INVALID_PLUGIN: i32 = -6;
pub const ZENITH_ERROR_PLUGIN_INIT_TIMEOUT: i32 = -7;
pub const ZENITH_ERROR_CLOSED_HANDLE: i32 = -8;
pub const ZENITH_ERROR_EMPTY: i32 = -9;
pub const ZENITH_ERROR_BUFFER_TOO_SMALL: i32 = -10;
pub const ZENITH_ERROR_BUFFER_FULL: i32 = -11;
pub const ZENITH_ERROR_INTERNAL: i32 = -12;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("invalid capacity: {0}")]
    InvalidCapacity(String),

    #[error("oversize batch: {len} bytes exceeds slot size of {max} bytes")]
    OversizeBatch { len: usize, max: usize },

    #[error("schema mismatch: expected fingerprint {expected}, found {found:#018x}")]
    SchemaMismatch { expected: Expected, found: u64 },

    #[error("corrupt frame: {0}")]
    CorruptFrame(String),

    #[error("invalid batch: {0}")]
    InvalidBatch(String),

    #[error("invalid plugin: {0}")]
    InvalidPlugin(String),

    #[error("plugin initialization exceeded its fuel budget")]
    PluginInitTimeout,

    #[error("plugin {plugin} faulted: {reason}")]
    PluginFault { plugin: String, reason: String },

    #[error("session is closed")]
    ClosedHandle,

    #[error("ring buffer is full")]
    BufferFull,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// What a fingerprint check expected to see.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expected {
    Fingerprint(u64),
    /// No schema is registered for the frame's source.
    Unregistered,
}

impl std::fmt::Display for Expected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Expected::Fingerprint(fp) => write!(f, "{fp:#018x}"),
            Expected::Unregistered => f.write_str("<unregistered source>"),
        }
    }
}

impl EngineError {
    pub(crate) fn corrupt(reason: impl Into<String>) -> Self {
        EngineError::CorruptFrame(reason.into())
    }

    pub(crate) fn invalid_batch(reason: impl Into<String>) -> Self {
        EngineError::InvalidBatch(reason.into())
    }

    pub(crate) fn mismatch(expected: u64, found: u64) -> Self {
        EngineError::SchemaMismatch {
            expected: Expected::Fingerprint(expected),
            found,
        }
    }

    /// The C ABI return code for this error.
    pub fn code(&self) -> i32 {
        match self {
            EngineError::InvalidCapacity(_) => ZENITH_ERROR_INVALID_CAPACITY,
            EngineError::OversizeBatch { .. } => ZENITH_ERROR_OVERSIZE_BATCH,
            EngineError::SchemaMismatch { .. } => ZENITH_ERROR_SCHEMA_MISMATCH,
            EngineError::CorruptFrame(_) => ZENITH_ERROR_CORRUPT_FRAME,
            EngineError::InvalidPlugin(_) => ZENITH_ERROR_INVALID_PLUGIN,
            EngineError::PluginInitTimeout => ZENITH_ERROR_PLUGIN_INIT_TIMEOUT,
            EngineError::ClosedHandle => ZENITH_ERROR_CLOSED_HANDLE,
            EngineError::BufferFull => ZENITH_ERROR_BUFFER_FULL,
            EngineError::InvalidBatch(_)
            | EngineError::PluginFault { .. }
            | EngineError::Config(_)
            | EngineError::Io(_) => ZENITH_ERROR_INTERNAL,
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

//! Session configuration.
//!
//! Loadable from JSON (missing keys take their defaults), from `ZENITH_*`
//! environment variables, or assembled with the `with_*` setters.

use std::fmt::Display;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::Plugin::SandboxConfig;
use crate::Ring::{OverflowPolicy, DEFAULT_SLOT_SIZE};

pub const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Ring slots; must be a power of two.
    pub capacity: usize,
    /// Maximum frame bytes per slot.
    pub slot_size: usize,
    pub overflow: OverflowPolicy,
    /// Place the ring in `/dev/shm/<name>` instead of process memory.
    pub shared_name: Option<String>,
    pub sandbox: SandboxConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            slot_size: DEFAULT_SLOT_SIZE,
            overflow: OverflowPolicy::default(),
            shared_name: None,
            sandbox: SandboxConfig::default(),
        }
    }
}

impl SessionConfig {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            ..Self::default()
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_slot_size(mut self, slot_size: usize) -> Self {
        self.slot_size = slot_size;
        self
    }

    pub fn with_overflow(mut self, overflow: OverflowPolicy) -> Self {
        self.overflow = overflow;
        self
    }

    pub fn with_shared_name(mut self, name: impl Into<String>) -> Self {
        self.shared_name = Some(name.into());
        self
    }

    pub fn with_sandbox(mut self, sandbox: SandboxConfig) -> Self {
        self.sandbox = sandbox;
        self
    }

    /// Defaults overridden by `ZENITH_CAPACITY`, `ZENITH_SLOT_SIZE`,
    /// `ZENITH_OVERFLOW` (`overwrite` | `reject`), `ZENITH_SHM_NAME` and the
    /// `ZENITH_PLUGIN_*` sandbox variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self {
            sandbox: SandboxConfig::from_env()?,
            ..Self::default()
        };
        if let Some(capacity) = env_parse("ZENITH_CAPACITY")? {
            config.capacity = capacity;
        }
        if let Some(slot_size) = env_parse("ZENITH_SLOT_SIZE")? {
            config.slot_size = slot_size;
        }
        if let Some(overflow) = env_parse("ZENITH_OVERFLOW")? {
            config.overflow = overflow;
        }
        if let Some(name) = env_parse::<String>("ZENITH_SHM_NAME")? {
            if !name.is_empty() {
                config.shared_name = Some(name);
            }
        }
        Ok(config)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| EngineError::Config(format!("invalid session config: {e}")))
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 || !self.capacity.is_power_of_two() {
            return Err(EngineError::InvalidCapacity(format!(
                "capacity {} is not a non-zero power of two",
                self.capacity
            )));
        }
        if self.slot_size == 0 {
            return Err(EngineError::InvalidCapacity("slot size must be non-zero".into()));
        }
        self.sandbox.validate()
    }
}

impl FromStr for OverflowPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "overwrite" => Ok(OverflowPolicy::Overwrite),
            "reject" => Ok(OverflowPolicy::Reject),
            other => Err(format!("unknown overflow policy `{other}`")),
        }
    }
}

/// Parse an environment variable; unset yields `None`.
pub(crate) fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| EngineError::Config(format!("{key}={raw}: {e}"))),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(EngineError::Config(format!("{key}: {e}"))),
    }
}

//! Wasm plugin sandbox.
//!
//! Each plugin is a core wasm module instantiated in its own store with a
//! fuel budget and a memory ceiling. The host reserves an I/O window at the
//! end of the module's linear memory at load time:
//!
//! ```text
//! io_base +  0  out_ptr:u32        replacement frame address (REPLACE)
//! io_base +  4  out_len:u32        replacement frame length (REPLACE)
//! io_base +  8  source_id:u32
//! io_base + 12  reserved:u32
//! io_base + 16  caller_seq_no:u64
//! io_base + 24  frame bytes        <- ptr passed to the entry point
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;
use wasmtime::{
    Config, Engine, ExternType, Instance, Memory, Module, Store, StoreLimits, StoreLimitsBuilder,
    Trap, TypedFunc, ValType,
};

use crate::config::env_parse;
use crate::error::{EngineError, Result};
use crate::Codec::frame;

pub const WASM_PAGE_SIZE: usize = 64 * 1024;
/// Bytes of call context in front of the frame.
pub const CALL_CONTEXT_LEN: usize = 24;

pub const ACTION_PASS: i32 = 0;
pub const ACTION_DROP: i32 = 1;
pub const ACTION_REPLACE: i32 = 2;

const DEFAULT_FUEL: u64 = 1_000_000;
const DEFAULT_MEMORY_LIMIT: usize = 32 * 1024 * 1024;

/// Resource limits applied to every plugin of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Fuel available to instantiation, including the start function.
    pub init_fuel: u64,
    /// Fuel granted afresh to every frame invocation.
    pub call_fuel: u64,
    /// Linear memory ceiling in bytes.
    pub memory_limit: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            init_fuel: DEFAULT_FUEL,
            call_fuel: DEFAULT_FUEL,
            memory_limit: DEFAULT_MEMORY_LIMIT,
        }
    }
}

impl SandboxConfig {
    /// Defaults overridden by `ZENITH_PLUGIN_INIT_FUEL`,
    /// `ZENITH_PLUGIN_FUEL_LIMIT` and `ZENITH_PLUGIN_MEMORY_LIMIT_MB`.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Some(fuel) = env_parse::<u64>("ZENITH_PLUGIN_INIT_FUEL")? {
            config.init_fuel = fuel;
        }
        if let Some(fuel) = env_parse::<u64>("ZENITH_PLUGIN_FUEL_LIMIT")? {
            config.call_fuel = fuel;
        }
        if let Some(mb) = env_parse::<usize>("ZENITH_PLUGIN_MEMORY_LIMIT_MB")? {
            config.memory_limit = mb.saturating_mul(1024 * 1024);
        }
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.init_fuel == 0 || self.call_fuel == 0 {
            return Err(EngineError::Config("plugin fuel budgets must be non-zero".into()));
        }
        if self.memory_limit < WASM_PAGE_SIZE {
            return Err(EngineError::Config(format!(
                "plugin memory limit of {} bytes is below one wasm page",
                self.memory_limit
            )));
        }
        Ok(())
    }
}

/// Session-scoped plugin identifier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PluginId(pub u64);

impl fmt::Display for PluginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "plugin-{}", self.0)
    }
}

/// Metadata written in front of the frame for each invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallContext {
    pub source_id: u32,
    pub caller_seq_no: u64,
}

/// What a plugin (or a whole chain) decided for a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Pass,
    Drop,
    Replace(Vec<u8>),
}

/// Snapshot of one plugin's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PluginStats {
    pub id: PluginId,
    pub invocations: u64,
    pub passed: u64,
    pub dropped: u64,
    pub replaced: u64,
    pub faults: u64,
}

#[derive(Default)]
struct Counters {
    invocations: AtomicU64,
    passed: AtomicU64,
    dropped: AtomicU64,
    replaced: AtomicU64,
    faults: AtomicU64,
}

struct SandboxState {
    limits: StoreLimits,
}

/// Compiles and instantiates plugins against one shared wasm engine.
pub struct PluginHost {
    engine: Engine,
    config: SandboxConfig,
}

impl fmt::Debug for PluginHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginHost")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl PluginHost {
    pub fn new(config: SandboxConfig) -> Result<Self> {
        config.validate()?;
        let mut wasm = Config::new();
        wasm.consume_fuel(true);
        let engine = Engine::new(&wasm)
            .map_err(|e| EngineError::Config(format!("wasm engine setup failed: {e}")))?;
        Ok(Self { engine, config })
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Compile, validate and instantiate a plugin whose I/O window can hold
    /// frames of up to `max_frame` bytes.
    ///
    /// `module_bytes` may be a binary module or WebAssembly text.
    pub fn load(&self, id: PluginId, module_bytes: &[u8], max_frame: usize) -> Result<Plugin> {
        let module = Module::new(&self.engine, module_bytes)
            .map_err(|e| invalid(format!("compilation failed: {e}")))?;
        let entry_name = validate_exports(&module)?;

        let limits = StoreLimitsBuilder::new()
            .memory_size(self.config.memory_limit)
            .trap_on_grow_failure(true)
            .build();
        let mut store = Store::new(&self.engine, SandboxState { limits });
        store.limiter(|state| &mut state.limits);
        store
            .set_fuel(self.config.init_fuel)
            .map_err(|e| EngineError::Config(format!("fuel accounting unavailable: {e}")))?;

        let instance = Instance::new(&mut store, &module, &[]).map_err(|e| {
            if is_out_of_fuel(&e) {
                EngineError::PluginInitTimeout
            } else {
                invalid(format!("instantiation failed: {e}"))
            }
        })?;

        let memory = instance
            .get_memory(&mut store, "memory")
            .ok_or_else(|| invalid("missing exported memory `memory`"))?;
        let entry = instance
            .get_typed_func::<(i32, i32), i32>(&mut store, &entry_name)
            .map_err(|e| invalid(format!("entry point `{entry_name}`: {e}")))?;

        let io_base = memory.data_size(&store);
        let window = CALL_CONTEXT_LEN + max_frame;
        if io_base + window > u32::MAX as usize {
            return Err(invalid("I/O window does not fit a 32-bit address space"));
        }
        memory
            .grow(&mut store, window.div_ceil(WASM_PAGE_SIZE) as u64)
            .map_err(|e| {
                invalid(format!(
                    "cannot reserve a {window}-byte I/O window within the memory limit: {e}"
                ))
            })?;

        debug!(
            plugin = %id,
            entry = %entry_name,
            io_base,
            window,
            "plugin instantiated"
        );

        Ok(Plugin {
            id,
            entry_name,
            store: Mutex::new(store),
            entry,
            memory,
            io_base,
            max_frame,
            call_fuel: self.config.call_fuel,
            counters: Counters::default(),
        })
    }
}

fn invalid(reason: impl Into<String>) -> EngineError {
    EngineError::InvalidPlugin(reason.into())
}

fn is_out_of_fuel(err: &wasmtime::Error) -> bool {
    matches!(err.downcast_ref::<Trap>(), Some(Trap::OutOfFuel))
}

/// Check the module's imports and exports; returns the entry point name.
fn validate_exports(module: &Module) -> Result<String> {
    if let Some(import) = module.imports().next() {
        return Err(invalid(format!(
            "imports are not allowed, found `{}::{}`",
            import.module(),
            import.name()
        )));
    }

    let mut has_memory = false;
    let mut entries = Vec::new();
    for export in module.exports() {
        match export.ty() {
            ExternType::Memory(_) if export.name() == "memory" => has_memory = true,
            ExternType::Func(func) => {
                let params: Vec<ValType> = func.params().collect();
                let results: Vec<ValType> = func.results().collect();
                let is_entry = params.len() == 2
                    && params.iter().all(|t| matches!(t, ValType::I32))
                    && results.len() == 1
                    && matches!(results[0], ValType::I32);
                if is_entry {
                    entries.push(export.name().to_string());
                }
            }
            _ => {}
        }
    }

    if !has_memory {
        return Err(invalid("missing exported memory `memory`"));
    }
    match entries.len() {
        1 => Ok(entries.remove(0)),
        0 => Err(invalid("no exported function of type (i32, i32) -> i32")),
        n => Err(invalid(format!(
            "{n} exported functions of type (i32, i32) -> i32, expected exactly one: {}",
            entries.join(", ")
        ))),
    }
}

/// A loaded plugin. Invocations are serialized on the plugin's store.
pub struct Plugin {
    id: PluginId,
    entry_name: String,
    store: Mutex<Store<SandboxState>>,
    entry: TypedFunc<(i32, i32), i32>,
    memory: Memory,
    io_base: usize,
    max_frame: usize,
    call_fuel: u64,
    counters: Counters,
}

impl fmt::Debug for Plugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Plugin")
            .field("id", &self.id)
            .field("entry", &self.entry_name)
            .field("io_base", &self.io_base)
            .field("max_frame", &self.max_frame)
            .finish_non_exhaustive()
    }
}

impl Plugin {
    pub fn id(&self) -> PluginId {
        self.id
    }

    pub fn entry_name(&self) -> &str {
        &self.entry_name
    }

    /// Run the plugin over one frame and count the outcome.
    ///
    /// `Err` carries the fault reason; the caller drops the frame.
    pub fn invoke(&self, frame: &[u8], ctx: CallContext) -> std::result::Result<Action, String> {
        self.counters.invocations.fetch_add(1, Ordering::Relaxed);
        let outcome = self.run(frame, ctx);
        let counter = match &outcome {
            Ok(Action::Pass) => &self.counters.passed,
            Ok(Action::Drop) => &self.counters.dropped,
            Ok(Action::Replace(_)) => &self.counters.replaced,
            Err(_) => &self.counters.faults,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        outcome
    }

    fn run(&self, frame: &[u8], ctx: CallContext) -> std::result::Result<Action, String> {
        if frame.len() > self.max_frame {
            return Err(format!(
                "frame of {} bytes exceeds the {}-byte I/O window",
                frame.len(),
                self.max_frame
            ));
        }

        let mut store = self.store.lock();
        store
            .set_fuel(self.call_fuel)
            .map_err(|e| format!("fuel reset failed: {e}"))?;

        let mut context = [0u8; CALL_CONTEXT_LEN];
        context[8..12].copy_from_slice(&ctx.source_id.to_le_bytes());
        context[16..24].copy_from_slice(&ctx.caller_seq_no.to_le_bytes());
        self.memory
            .write(&mut *store, self.io_base, &context)
            .map_err(|e| format!("writing call context: {e}"))?;
        self.memory
            .write(&mut *store, self.io_base + CALL_CONTEXT_LEN, frame)
            .map_err(|e| format!("writing frame: {e}"))?;

        let ptr = (self.io_base + CALL_CONTEXT_LEN) as u32 as i32;
        let code = self
            .entry
            .call(&mut *store, (ptr, frame.len() as i32))
            .map_err(|e| {
                if is_out_of_fuel(&e) {
                    format!("fuel exhausted after {} units", self.call_fuel)
                } else {
                    format!("trapped: {e}")
                }
            })?;

        match code {
            ACTION_PASS => Ok(Action::Pass),
            ACTION_DROP => Ok(Action::Drop),
            ACTION_REPLACE => self.read_replacement(&store).map(Action::Replace),
            other => Err(format!("unknown action code {other}")),
        }
    }

    fn read_replacement(&self, store: &Store<SandboxState>) -> std::result::Result<Vec<u8>, String> {
        let mut descriptor = [0u8; 8];
        self.memory
            .read(store, self.io_base, &mut descriptor)
            .map_err(|e| format!("reading replacement descriptor: {e}"))?;
        let out_ptr = u32::from_le_bytes([descriptor[0], descriptor[1], descriptor[2], descriptor[3]])
            as usize;
        let out_len = u32::from_le_bytes([descriptor[4], descriptor[5], descriptor[6], descriptor[7]])
            as usize;

        if out_len > self.max_frame {
            return Err(format!(
                "replacement of {out_len} bytes exceeds the {}-byte slot",
                self.max_frame
            ));
        }
        let data = self.memory.data(store);
        let bytes = out_ptr
            .checked_add(out_len)
            .and_then(|end| data.get(out_ptr..end))
            .ok_or_else(|| {
                format!("replacement at {out_ptr}+{out_len} is outside linear memory")
            })?
            .to_vec();
        frame::inspect(&bytes).map_err(|e| format!("invalid replacement: {e}"))?;
        Ok(bytes)
    }

    pub fn stats(&self) -> PluginStats {
        PluginStats {
            id: self.id,
            invocations: self.counters.invocations.load(Ordering::Relaxed),
            passed: self.counters.passed.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            replaced: self.counters.replaced.load(Ordering::Relaxed),
            faults: self.counters.faults.load(Ordering::Relaxed),
        }
    }
}

impl Drop for Plugin {
    fn drop(&mut self) {
        debug!(plugin = %self.id, "plugin sandbox released");
    }
}

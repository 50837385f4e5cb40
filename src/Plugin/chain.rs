use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{trace, warn};

use super::sandbox::{Action, CallContext, Plugin, PluginId, PluginStats};
use crate::error::{EngineError, Result};

/// Ordered plugin list published as immutable snapshots.
///
/// Load and unload swap the snapshot under a short write lock; each publish
/// clones the current `Arc` and runs against it, so an unload never affects
/// a chain run already in progress.
#[derive(Debug)]
pub struct PluginChain {
    plugins: RwLock<Arc<[Arc<Plugin>]>>,
}

impl PluginChain {
    pub fn new() -> Self {
        Self {
            plugins: RwLock::new(Arc::from(Vec::new())),
        }
    }

    pub fn snapshot(&self) -> Arc<[Arc<Plugin>]> {
        self.plugins.read().clone()
    }

    pub fn push(&self, plugin: Arc<Plugin>) {
        let mut plugins = self.plugins.write();
        let mut next: Vec<Arc<Plugin>> = plugins.iter().cloned().collect();
        next.push(plugin);
        *plugins = next.into();
    }

    /// Remove a plugin from future snapshots.
    pub fn remove(&self, id: PluginId) -> Option<Arc<Plugin>> {
        let mut plugins = self.plugins.write();
        let index = plugins.iter().position(|p| p.id() == id)?;
        let mut next: Vec<Arc<Plugin>> = plugins.iter().cloned().collect();
        let removed = next.remove(index);
        *plugins = next.into();
        Some(removed)
    }

    pub fn len(&self) -> usize {
        self.plugins.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> Vec<PluginStats> {
        self.snapshot().iter().map(|p| p.stats()).collect()
    }
}

impl Default for PluginChain {
    fn default() -> Self {
        Self::new()
    }
}

/// Run `frame` through `chain` in registration order.
///
/// Returns `Pass` when every plugin passed the original frame, `Replace`
/// with the last replacement when any plugin rewrote it, and `Drop` as soon
/// as one plugin drops it. A faulting plugin yields `Err(PluginFault)`; the
/// fault is already counted against the plugin and the frame must be
/// discarded.
pub fn run_chain(chain: &[Arc<Plugin>], frame: &[u8], ctx: CallContext) -> Result<Action> {
    let mut replaced: Option<Vec<u8>> = None;

    for plugin in chain {
        let current = replaced.as_deref().unwrap_or(frame);
        match plugin.invoke(current, ctx) {
            Ok(Action::Pass) => {}
            Ok(Action::Drop) => {
                trace!(plugin = %plugin.id(), source_id = ctx.source_id, "frame dropped by plugin");
                return Ok(Action::Drop);
            }
            Ok(Action::Replace(next)) => replaced = Some(next),
            Err(reason) => {
                warn!(
                    plugin = %plugin.id(),
                    source_id = ctx.source_id,
                    caller_seq_no = ctx.caller_seq_no,
                    %reason,
                    "plugin fault, frame dropped"
                );
                return Err(EngineError::PluginFault {
                    plugin: plugin.id().to_string(),
                    reason,
                });
            }
        }
    }

    Ok(replaced.map_or(Action::Pass, Action::Replace))
}

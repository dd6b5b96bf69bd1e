//! Interfaces between the harness and an emulation engine.
//!
//! The engine owns instruction execution. Whenever guest code touches
//! bus-mapped memory or reaches the end of a sync quantum, the engine calls
//! back into the harness through a [BusClient] or [SyncHandler] on its own
//! thread.

use std::fmt;
use std::sync::Arc;

use tlmu_core::bus::dmi::DmiDescriptor;
use tlmu_core::bus::prim::{BusFault, Transaction};

use crate::back::Backend;
use crate::sync::SyncHandler;

/// Whether a core starts executing immediately or waits to be woken.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum BootState {
    #[default]
    Running,
    Sleeping,
}

/// Per-instance state carried back to the harness in every callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreContext {
    pub name: String,
    pub index: usize,
}

/// A span of RAM the engine should treat as bus-mapped memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RamMapping {
    pub name: String,
    pub base: u64,
    pub size: u64,
    /// True when the engine allocates the backing store itself, false when
    /// the harness (or another engine) owns it.
    pub internal: bool,
}

/// Callbacks an engine uses to reach the bus.
pub trait BusClient: Send + Sync {
    fn bus_access(&self, ctx: &CoreContext, txn: &mut Transaction<'_>) -> Result<(), BusFault>;

    /// Debug access (debugger reads and writes). Must not have side effects
    /// beyond the data transfer.
    fn bus_access_dbg(&self, ctx: &CoreContext, txn: &mut Transaction<'_>) -> Result<(), BusFault> {
        txn.debug = true;
        self.bus_access(ctx, txn)
    }

    fn get_dmi(&self, ctx: &CoreContext, addr: u64) -> DmiDescriptor;
}

/// Everything an engine is handed when it is configured.
pub struct EngineSetup {
    pub name: String,
    pub args: Vec<String>,
    pub ctx: Arc<CoreContext>,
    pub client: Arc<dyn BusClient>,
    pub sync: Arc<dyn SyncHandler>,
    pub sync_period_ns: u64,
    pub boot_state: BootState,
    pub ram: Vec<RamMapping>,
}
impl EngineSetup {
    /// Value following the first occurrence of some flag in the argument
    /// list, e.g. `arg_value("-cpu")`.
    pub fn arg_value(&self, flag: &str) -> Option<&str> {
        self.args.iter()
            .position(|a| a == flag)
            .and_then(|idx| self.args.get(idx + 1))
            .map(String::as_str)
    }
}

impl fmt::Debug for EngineSetup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineSetup")
            .field("name", &self.name)
            .field("args", &self.args)
            .field("ctx", &self.ctx)
            .field("sync_period_ns", &self.sync_period_ns)
            .field("boot_state", &self.boot_state)
            .field("ram", &self.ram)
            .finish()
    }
}

/// An emulation engine: configured once, then run on a dedicated thread.
pub trait Engine: Backend + Send {
    fn configure(&mut self, setup: EngineSetup) -> anyhow::Result<()>;
}

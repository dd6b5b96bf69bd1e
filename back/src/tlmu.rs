//! Configuration of a single engine instance.
//!
//! A [Tlmu] collects everything the harness wants to tell an engine
//! (arguments, callbacks, memory map) and hands it over in one piece when
//! the instance is realized.

use std::sync::Arc;

use anyhow::{anyhow, Context};
use log::{debug, info};

use crate::engine::*;
use crate::registry::{BackendRegistry, LoadError};
use crate::sync::{NullSync, SyncHandler, DEFAULT_SYNC_PERIOD_NS};

pub struct Tlmu {
    name: String,
    backend: Option<String>,
    engine: Option<Box<dyn Engine>>,
    args: Vec<String>,
    ctx: Option<Arc<CoreContext>>,
    client: Option<Arc<dyn BusClient>>,
    sync: Option<Arc<dyn SyncHandler>>,
    sync_period_ns: u64,
    boot_state: BootState,
    ram: Vec<RamMapping>,
}
impl Tlmu {
    pub fn new(name: impl Into<String>) -> Self {
        Tlmu {
            name: name.into(),
            backend: None,
            engine: None,
            args: Vec::new(),
            ctx: None,
            client: None,
            sync: None,
            sync_period_ns: DEFAULT_SYNC_PERIOD_NS,
            boot_state: BootState::Running,
            ram: Vec::new(),
        }
    }

    pub fn name(&self) -> &str { &self.name }
    pub fn args(&self) -> &[String] { &self.args }
    pub fn ram(&self) -> &[RamMapping] { &self.ram }
    pub fn is_loaded(&self) -> bool { self.engine.is_some() }

    /// Instantiate the engine from some backend.
    pub fn load(&mut self, registry: &BackendRegistry, backend: &str) -> Result<(), LoadError> {
        self.engine = Some(registry.load(backend)?);
        self.backend = Some(backend.to_owned());
        debug!(target: "CORE", "{}: loaded {backend}", self.name);
        Ok(())
    }

    pub fn append_arg(&mut self, arg: impl Into<String>) {
        self.args.push(arg.into());
    }

    /// Register the per-instance context carried back in callbacks.
    pub fn set_opaque(&mut self, ctx: Arc<CoreContext>) {
        self.ctx = Some(ctx);
    }

    /// Register the bus access, debug access and DMI callbacks.
    pub fn set_bus_client(&mut self, client: Arc<dyn BusClient>) {
        self.client = Some(client);
    }

    pub fn set_sync(&mut self, sync: Arc<dyn SyncHandler>) {
        self.sync = Some(sync);
    }

    pub fn set_sync_period_ns(&mut self, period: u64) {
        self.sync_period_ns = period;
    }

    pub fn set_boot_state(&mut self, state: BootState) {
        self.boot_state = state;
    }

    /// Tell the engine about RAM that lives on the bus.
    pub fn map_ram(&mut self, name: impl Into<String>, base: u64, size: u64, internal: bool) {
        self.ram.push(RamMapping { name: name.into(), base, size, internal });
    }

    /// Hand the collected configuration to the engine, returning the
    /// configured engine ready to be run.
    pub fn realize(self) -> anyhow::Result<Box<dyn Engine>> {
        let mut engine = self.engine
            .ok_or_else(|| anyhow!("{}: no backend loaded", self.name))?;
        let client = self.client
            .ok_or_else(|| anyhow!("{}: no bus callbacks registered", self.name))?;
        let ctx = self.ctx.unwrap_or_else(|| Arc::new(CoreContext {
            name: self.name.clone(), index: 0,
        }));
        let sync = self.sync.unwrap_or_else(|| Arc::new(NullSync));

        info!(target: "CORE", "{}: {} {}", self.name,
            self.backend.as_deref().unwrap_or("?"), self.args.join(" "));
        let name = self.name;
        engine.configure(EngineSetup {
            name: name.clone(),
            args: self.args,
            ctx,
            client,
            sync,
            sync_period_ns: self.sync_period_ns,
            boot_state: self.boot_state,
            ram: self.ram,
        }).context(format!("{name}: engine rejected configuration"))?;
        Ok(engine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::back::Backend;
    use parking_lot::Mutex;
    use tlmu_core::bus::dmi::DmiDescriptor;
    use tlmu_core::bus::prim::{BusFault, Transaction};

    struct NoBus;
    impl BusClient for NoBus {
        fn bus_access(&self, _: &CoreContext, _: &mut Transaction<'_>) -> Result<(), BusFault> {
            Ok(())
        }
        fn get_dmi(&self, _: &CoreContext, _: u64) -> DmiDescriptor {
            DmiDescriptor::default()
        }
    }

    /// Engine that records the setup it was given.
    struct Recorder(Arc<Mutex<Option<EngineSetup>>>);
    impl Backend for Recorder {
        fn run(&mut self) -> anyhow::Result<()> { Ok(()) }
    }
    impl Engine for Recorder {
        fn configure(&mut self, setup: EngineSetup) -> anyhow::Result<()> {
            *self.0.lock() = Some(setup);
            Ok(())
        }
    }

    #[test]
    fn realize_passes_everything_through() {
        let seen = Arc::new(Mutex::new(None));
        let mut reg = BackendRegistry::new();
        let slot = seen.clone();
        reg.register("rec", move || Box::new(Recorder(slot.clone())));

        let mut t = Tlmu::new("ARM");
        t.load(&reg, "rec").unwrap();
        t.append_arg("-cpu");
        t.append_arg("arm1176");
        t.set_opaque(Arc::new(CoreContext { name: "ARM".into(), index: 3 }));
        t.set_bus_client(Arc::new(NoBus));
        t.set_sync_period_ns(5000);
        t.set_boot_state(BootState::Sleeping);
        t.map_ram("sdram", 0, 0x10_0000, false);
        let mut engine = t.realize().unwrap();
        engine.run().unwrap();

        let setup = seen.lock().take().unwrap();
        assert_eq!(setup.name, "ARM");
        assert_eq!(setup.arg_value("-cpu"), Some("arm1176"));
        assert_eq!(setup.arg_value("-kernel"), None);
        assert_eq!(setup.ctx.index, 3);
        assert_eq!(setup.sync_period_ns, 5000);
        assert_eq!(setup.boot_state, BootState::Sleeping);
        assert_eq!(setup.ram, vec![RamMapping { name: "sdram".into(), base: 0, size: 0x10_0000, internal: false }]);
    }

    #[test]
    fn load_failure_leaves_instance_unloaded() {
        let mut t = Tlmu::new("PPC");
        assert!(t.load(&BackendRegistry::new(), "libtlmu-ppc.so").is_err());
        assert!(!t.is_loaded());
        assert!(t.realize().is_err());
    }

    #[test]
    fn realize_requires_bus_callbacks() {
        let mut t = Tlmu::new("ARM");
        t.load(&BackendRegistry::builtin(), crate::registry::SCRIPT_BACKEND).unwrap();
        let err = t.realize().err().unwrap();
        assert!(err.to_string().contains("no bus callbacks"));
    }
}

//! Core runners and the harness that drives them.
//!
//! Each core goes through `Unconfigured -> Configured -> Running -> Stopped`.
//! Every running core gets its own OS thread which belongs to the engine
//! until the guest halts; the harness thread only starts and joins them.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::thread::{Builder, JoinHandle};

use anyhow::{anyhow, Context};
use log::{error, info, warn};
use thiserror::Error;

use tlmu_core::bus::Bus;
use tlmu_core::bus::dmi::DmiDescriptor;
use tlmu_core::bus::prim::{BusFault, Transaction};

use crate::engine::*;
use crate::registry::BackendRegistry;
use crate::sync::{NullSync, SyncHandler, DEFAULT_SYNC_PERIOD_NS};
use crate::tlmu::Tlmu;

/// Connects engines to a shared [Bus].
pub struct BusPort {
    bus: Arc<Bus>,
}
impl BusPort {
    pub fn new(bus: Arc<Bus>) -> Self {
        BusPort { bus }
    }
}

impl BusClient for BusPort {
    fn bus_access(&self, ctx: &CoreContext, txn: &mut Transaction<'_>) -> Result<(), BusFault> {
        self.bus.access(txn)
            .inspect_err(|fault| warn!(target: "BUS", "{}: {fault}", ctx.name))
    }

    fn bus_access_dbg(&self, _ctx: &CoreContext, txn: &mut Transaction<'_>) -> Result<(), BusFault> {
        self.bus.access_dbg(txn)
    }

    fn get_dmi(&self, _ctx: &CoreContext, addr: u64) -> DmiDescriptor {
        self.bus.get_dmi(addr)
    }
}

/// Settings shared by every core in the harness.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    /// Machine model passed with `-M`.
    pub machine: String,
    /// Instruction counting shift passed with `-icount`.
    pub icount: u32,
    pub sync_period_ns: u64,
    pub boot_state: BootState,
    /// Ask engines to trace executed code.
    pub trace: bool,
}
impl Default for HarnessConfig {
    fn default() -> Self {
        HarnessConfig {
            machine: "tlm-mach".to_owned(),
            icount: 1,
            sync_period_ns: DEFAULT_SYNC_PERIOD_NS,
            boot_state: BootState::Running,
            trace: false,
        }
    }
}

/// Which engine to run for a core, and what to run on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreSpec {
    pub name: String,
    pub backend: String,
    pub cpu: String,
    pub image: PathBuf,
}
impl CoreSpec {
    pub fn new(name: &str, backend: &str, cpu: &str, image: impl Into<PathBuf>) -> Self {
        CoreSpec {
            name: name.to_owned(),
            backend: backend.to_owned(),
            cpu: cpu.to_owned(),
            image: image.into(),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("expected NAME:BACKEND:CPU:IMAGE, got '{0}'")]
pub struct CoreSpecError(String);

impl FromStr for CoreSpec {
    type Err = CoreSpecError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.splitn(4, ':').collect();
        match parts[..] {
            [name, backend, cpu, image]
                if !name.is_empty() && !backend.is_empty() && !image.is_empty() =>
                Ok(CoreSpec::new(name, backend, cpu, image)),
            _ => Err(CoreSpecError(s.to_owned())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum CoreState { Unconfigured, Configured, Running, Stopped }

/// How a core ended up after the harness finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreOutcome {
    /// Never ran; configuration failed.
    Skipped(String),
    /// The engine returned normally.
    Halted,
    /// The engine returned an error.
    Failed(String),
    /// The engine thread panicked.
    Panicked,
}

/// One engine instance and its execution thread.
pub struct CoreRunner {
    pub spec: CoreSpec,
    ctx: Arc<CoreContext>,
    state: CoreState,
    engine: Option<Box<dyn Engine>>,
    thread: Option<JoinHandle<anyhow::Result<()>>>,
}
impl CoreRunner {
    pub fn new(index: usize, spec: CoreSpec) -> Self {
        CoreRunner {
            ctx: Arc::new(CoreContext { name: spec.name.clone(), index }),
            spec,
            state: CoreState::Unconfigured,
            engine: None,
            thread: None,
        }
    }

    pub fn state(&self) -> CoreState {
        self.state
    }

    /// Load the backend and hand the engine its arguments, callbacks and
    /// memory map.
    pub fn configure(&mut self, cfg: &HarnessConfig, registry: &BackendRegistry, bus: &Bus,
        client: Arc<dyn BusClient>, sync: Arc<dyn SyncHandler>) -> anyhow::Result<()>
    {
        let spec = &self.spec;
        let mut t = Tlmu::new(spec.name.as_str());
        t.load(registry, &spec.backend)?;

        // Use the bare CPU core.
        t.append_arg("-M");
        t.append_arg(cfg.machine.as_str());
        t.append_arg("-icount");
        t.append_arg(cfg.icount.to_string());
        if cfg.trace {
            t.append_arg("-d");
            t.append_arg("in_asm,exec,cpu");
        }
        t.append_arg("-cpu");
        t.append_arg(spec.cpu.as_str());
        t.append_arg("-kernel");
        t.append_arg(spec.image.to_string_lossy());

        t.set_opaque(self.ctx.clone());
        t.set_bus_client(client);
        t.set_sync(sync);
        t.set_sync_period_ns(cfg.sync_period_ns);
        t.set_boot_state(cfg.boot_state);

        // The harness owns the backing store for everything on the bus.
        for region in bus.regions() {
            t.map_ram(region.name(), region.base(), region.size(), false);
        }

        self.engine = Some(t.realize()?);
        self.state = CoreState::Configured;
        Ok(())
    }

    /// Spawn the execution thread for a configured core.
    pub fn start(&mut self) -> anyhow::Result<()> {
        let mut engine = self.engine.take()
            .ok_or_else(|| anyhow!("{} is not configured", self.spec.name))?;
        let name = self.spec.name.clone();
        let handle = Builder::new().name(name.clone()).spawn(move || {
            info!(target: "CORE", "{name} running");
            engine.run()
        }).context(format!("failed to spawn thread for {}", self.spec.name))?;
        self.thread = Some(handle);
        self.state = CoreState::Running;
        Ok(())
    }

    /// Block until the engine returns.
    pub fn join(&mut self) -> CoreOutcome {
        let handle = match self.thread.take() {
            Some(handle) => handle,
            None => return CoreOutcome::Skipped(format!("{} never started", self.spec.name)),
        };
        self.state = CoreState::Stopped;
        match handle.join() {
            Ok(Ok(())) => CoreOutcome::Halted,
            Ok(Err(reason)) => CoreOutcome::Failed(format!("{reason:#}")),
            Err(_) => CoreOutcome::Panicked,
        }
    }
}

impl fmt::Debug for CoreRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoreRunner")
            .field("spec", &self.spec)
            .field("ctx", &self.ctx)
            .field("state", &self.state)
            .finish()
    }
}

/// Outcome of every core, in the order they were added.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HarnessReport {
    pub outcomes: Vec<(String, CoreOutcome)>,
}
impl HarnessReport {
    pub fn outcome(&self, name: &str) -> Option<&CoreOutcome> {
        self.outcomes.iter().find(|(n, _)| n == name).map(|(_, o)| o)
    }
    pub fn halted(&self) -> usize {
        self.outcomes.iter().filter(|(_, o)| *o == CoreOutcome::Halted).count()
    }
    pub fn skipped(&self) -> usize {
        self.outcomes.iter().filter(|(_, o)| matches!(o, CoreOutcome::Skipped(_))).count()
    }
}

/// A set of cores sharing one bus.
pub struct Harness {
    bus: Arc<Bus>,
    registry: BackendRegistry,
    sync: Arc<dyn SyncHandler>,
    cfg: HarnessConfig,
    cores: Vec<CoreRunner>,
}
impl Harness {
    pub fn new(bus: Arc<Bus>, registry: BackendRegistry, cfg: HarnessConfig) -> Self {
        Harness { bus, registry, sync: Arc::new(NullSync), cfg, cores: Vec::new() }
    }

    pub fn with_sync(mut self, sync: Arc<dyn SyncHandler>) -> Self {
        self.sync = sync;
        self
    }

    pub fn add_core(&mut self, spec: CoreSpec) {
        let idx = self.cores.len();
        self.cores.push(CoreRunner::new(idx, spec));
    }

    pub fn bus(&self) -> &Arc<Bus> { &self.bus }
    pub fn cores(&self) -> &[CoreRunner] { &self.cores }

    /// Configure and start every core, then wait for all of them to stop.
    ///
    /// A core that fails to configure is reported and skipped; the others
    /// still run.
    pub fn run(&mut self) -> HarnessReport {
        let client: Arc<dyn BusClient> = Arc::new(BusPort::new(self.bus.clone()));
        let mut skipped = vec![None; self.cores.len()];

        for (idx, core) in self.cores.iter_mut().enumerate() {
            let res = core.configure(&self.cfg, &self.registry, &self.bus,
                client.clone(), self.sync.clone())
                .and_then(|_| core.start());
            if let Err(reason) = res {
                error!(target: "CORE", "{}: {reason:#}", core.spec.name);
                skipped[idx] = Some(format!("{reason:#}"));
            }
        }

        let mut report = HarnessReport::default();
        for (core, skip) in self.cores.iter_mut().zip(skipped) {
            let outcome = match skip {
                Some(reason) => CoreOutcome::Skipped(reason),
                None => core.join(),
            };
            match &outcome {
                CoreOutcome::Halted => info!(target: "CORE", "{} stopped", core.spec.name),
                CoreOutcome::Failed(reason) => error!(target: "CORE", "{} stopped with error: {reason}", core.spec.name),
                CoreOutcome::Panicked => error!(target: "CORE", "{} panicked", core.spec.name),
                CoreOutcome::Skipped(_) => {},
            }
            report.outcomes.push((core.spec.name.clone(), outcome));
        }
        report
    }
}

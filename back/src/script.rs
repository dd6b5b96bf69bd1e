//! Built-in engine that runs a scripted guest.
//!
//! There is no instruction set here: the "guest image" is a text file
//! listing bus operations, one per line. It lets the harness run end to end
//! without an external emulator, and exercises the same callbacks a real
//! engine would use.
//!
//! ```text
//! # comments start with '#'
//! dmi   0x2000_0000              # request and cache a DMI descriptor
//! write 0x100 aabbccdd           # bytes in the order given
//! read  0x100 4 aabbccdd         # optional expected bytes
//! peek  0x2000_0000 16           # debug read, logged
//! idle  250000                   # advance virtual time (ns)
//! halt
//! ```

use std::fs;
use std::path::Path;

use anyhow::{anyhow, bail, Context};
use log::{debug, error, info};
use thiserror::Error;

use tlmu_core::bus::dmi::DmiDescriptor;
use tlmu_core::bus::prim::{BusFault, Payload, Transaction};

use crate::back::Backend;
use crate::engine::{BootState, Engine, EngineSetup};

/// Largest single read or peek a guest may issue.
pub const MAX_ACCESS_LEN: usize = 0x1_0000;
/// Longest span a single `idle` may cover (one minute of virtual time).
pub const MAX_IDLE_NS: u64 = 60 * 1000 * 1000 * 1000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScriptError {
    #[error("line {line}: unknown operation '{op}'")]
    UnknownOp { line: usize, op: String },
    #[error("line {line}: {msg}")]
    Syntax { line: usize, msg: String },
}

/// A single guest operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Write { addr: u64, data: Vec<u8> },
    Read { addr: u64, len: usize, expect: Option<Vec<u8>> },
    Peek { addr: u64, len: usize },
    Dmi { addr: u64 },
    Idle { ns: u64 },
    Halt,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Script {
    pub ops: Vec<Op>,
}

fn parse_num(s: &str) -> Option<u64> {
    let s = s.replace('_', "");
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}

fn parse_hex(s: &str) -> Option<Vec<u8>> {
    let s = s.replace('_', "");
    if s.is_empty() || s.len() % 2 != 0 {
        return None;
    }
    (0..s.len()).step_by(2)
        .map(|i| u8::from_str_radix(s.get(i..i + 2)?, 16).ok())
        .collect()
}

fn hex_string(data: &[u8]) -> String {
    data.iter().map(|b| format!("{b:02x}")).collect()
}

impl Script {
    pub fn parse(src: &str) -> Result<Self, ScriptError> {
        let mut ops = Vec::new();
        for (idx, raw) in src.lines().enumerate() {
            let line = idx + 1;
            let text = raw.split('#').next().unwrap_or("").trim();
            if text.is_empty() {
                continue;
            }
            let words: Vec<&str> = text.split_whitespace().collect();
            let syntax = |msg: &str| ScriptError::Syntax { line, msg: msg.to_owned() };
            let num = |i: usize, what: &str| words.get(i)
                .and_then(|w| parse_num(w))
                .ok_or_else(|| syntax(&format!("expected {what}")));
            let bytes = |i: usize| words.get(i)
                .and_then(|w| parse_hex(w))
                .ok_or_else(|| syntax("expected hex bytes"));

            let len = |i: usize| match num(i, "length")? {
                n if n <= MAX_ACCESS_LEN as u64 => Ok(n as usize),
                _ => Err(syntax(&format!("length exceeds {MAX_ACCESS_LEN:#x} bytes"))),
            };

            let op = match words[0] {
                "write" => Op::Write { addr: num(1, "address")?, data: bytes(2)? },
                "read" => Op::Read {
                    addr: num(1, "address")?,
                    len: len(2)?,
                    expect: if words.len() > 3 { Some(bytes(3)?) } else { None },
                },
                "peek" => Op::Peek { addr: num(1, "address")?, len: len(2)? },
                "dmi" => Op::Dmi { addr: num(1, "address")? },
                "idle" => match num(1, "duration")? {
                    ns if ns <= MAX_IDLE_NS => Op::Idle { ns },
                    _ => return Err(syntax(&format!("idle exceeds {MAX_IDLE_NS}ns"))),
                },
                "halt" => Op::Halt,
                other => return Err(ScriptError::UnknownOp { line, op: other.to_owned() }),
            };
            if let Op::Read { len, expect: Some(expect), .. } = &op {
                if expect.len() != *len {
                    return Err(syntax("expected bytes don't match read length"));
                }
            }
            ops.push(op);
        }
        Ok(Script { ops })
    }

    pub fn load(filename: &impl AsRef<Path>) -> anyhow::Result<Self> {
        let filename = filename.as_ref();
        let src = fs::read_to_string(filename)
            .map_err(|ioerr| anyhow!("Error opening guest image: {}. Got error: {ioerr}", filename.display()))?;
        Self::parse(&src).context(format!("in {}", filename.display()))
    }
}

/// Engine that executes a [Script] against the bus.
#[derive(Default)]
pub struct ScriptEngine {
    script: Option<Script>,
    setup: Option<EngineSetup>,
    /// Virtual time charged per operation, from `-icount`.
    op_cost_ns: u64,

    /// Number of operations executed by the last run.
    pub executed: u64,
    /// Virtual time at the end of the last run.
    pub clock_ns: u64,
}
impl ScriptEngine {
    pub fn new() -> Self {
        ScriptEngine { op_cost_ns: 1, ..Default::default() }
    }

    /// Engine with a guest already loaded; `-kernel` becomes optional.
    pub fn with_script(script: Script) -> Self {
        ScriptEngine { script: Some(script), ..Self::new() }
    }
}

impl Engine for ScriptEngine {
    fn configure(&mut self, setup: EngineSetup) -> anyhow::Result<()> {
        if let Some(shift) = setup.arg_value("-icount") {
            let shift: u32 = shift.parse().context("-icount expects a shift value")?;
            if shift > 32 {
                bail!("-icount shift {shift} is too large");
            }
            self.op_cost_ns = 1 << shift;
        }
        if setup.sync_period_ns == 0 {
            bail!("sync period must be non-zero");
        }
        if let Some(kernel) = setup.arg_value("-kernel") {
            if self.script.is_none() {
                self.script = Some(Script::load(&kernel)?);
            }
        }
        if self.script.is_none() {
            bail!("no guest image given (-kernel)");
        }
        debug!(target: "SCRIPT", "{}: machine={} cpu={} {}ns/op, {} mapped RAMs",
            setup.name,
            setup.arg_value("-M").unwrap_or("-"),
            setup.arg_value("-cpu").unwrap_or("-"),
            self.op_cost_ns,
            setup.ram.len());
        self.setup = Some(setup);
        Ok(())
    }
}

impl Backend for ScriptEngine {
    fn run(&mut self) -> anyhow::Result<()> {
        let setup = self.setup.take().ok_or_else(|| anyhow!("engine was never configured"))?;
        let script = self.script.take().unwrap_or_default();
        if setup.boot_state == BootState::Sleeping {
            info!(target: "SCRIPT", "{} booted sleeping, nothing to wake it", setup.name);
            return Ok(());
        }

        let mut core = ScriptCore {
            setup: &setup,
            op_cost_ns: self.op_cost_ns,
            clock_ns: 0,
            next_sync_ns: setup.sync_period_ns,
            dmi: Vec::new(),
            executed: 0,
        };
        let res = core.execute(&script.ops);
        self.executed = core.executed;
        self.clock_ns = core.clock_ns;
        if let Err(reason) = &res {
            error!(target: "SCRIPT", "{} halted on error after {} ops: {reason}",
                setup.name, self.executed);
        }
        res
    }
}

/// Run state of a single scripted core.
struct ScriptCore<'a> {
    setup: &'a EngineSetup,
    op_cost_ns: u64,
    clock_ns: u64,
    next_sync_ns: u64,
    dmi: Vec<DmiDescriptor>,
    executed: u64,
}
impl ScriptCore<'_> {
    fn execute(&mut self, ops: &[Op]) -> anyhow::Result<()> {
        for op in ops {
            self.step(op)?;
            self.executed += 1;
            if *op == Op::Halt {
                break;
            }
        }
        self.setup.sync.sync(&self.setup.ctx, self.clock_ns);
        info!(target: "SCRIPT", "{} halted at {}ns", self.setup.name, self.clock_ns);
        Ok(())
    }

    fn step(&mut self, op: &Op) -> anyhow::Result<()> {
        match op {
            Op::Write { addr, data } => {
                let mut txn = Transaction::write(*addr, data).at(self.clock_ns as i64);
                self.access(&mut txn).context("guest write failed")?;
            },
            Op::Read { addr, len, expect } => {
                let mut buf = vec![0u8; *len];
                let mut txn = Transaction::read(*addr, &mut buf).at(self.clock_ns as i64);
                self.access(&mut txn).context("guest read failed")?;
                if let Some(expect) = expect {
                    if *expect != buf {
                        bail!("read at {addr:#010x}: expected {} got {}",
                            hex_string(expect), hex_string(&buf));
                    }
                }
            },
            Op::Peek { addr, len } => {
                let mut buf = vec![0u8; *len];
                let mut txn = Transaction::read(*addr, &mut buf).at(self.clock_ns as i64);
                self.setup.client.bus_access_dbg(&self.setup.ctx, &mut txn)?;
                info!(target: "SCRIPT", "{} peek {addr:#010x}: {}", self.setup.name, hex_string(&buf));
            },
            Op::Dmi { addr } => {
                let dmi = self.setup.client.get_dmi(&self.setup.ctx, *addr);
                if dmi.is_valid() {
                    debug!(target: "SCRIPT", "{} caching {dmi:?}", self.setup.name);
                    self.dmi.retain(|d| d.base != dmi.base);
                    self.dmi.push(dmi);
                } else {
                    debug!(target: "SCRIPT", "{} no DMI for {addr:#010x}", self.setup.name);
                }
            },
            Op::Idle { ns } => return self.advance(*ns),
            Op::Halt => return Ok(()),
        }
        self.advance(self.op_cost_ns)
    }

    /// Memory access through a cached DMI descriptor if one covers it,
    /// otherwise through the bus.
    fn access(&self, txn: &mut Transaction<'_>) -> Result<(), BusFault> {
        let (dir, addr, len) = (txn.direction(), txn.addr, txn.len());
        match self.dmi.iter().find(|d| d.permits(dir, addr, len)) {
            Some(dmi) => match &mut txn.payload {
                Payload::Read(dst) => dmi.read_buf(addr, dst),
                Payload::Write(src) => dmi.write_buf(addr, src),
            },
            None => self.setup.client.bus_access(&self.setup.ctx, txn),
        }
    }

    /// Move virtual time forward, yielding at every quantum boundary.
    fn advance(&mut self, ns: u64) -> anyhow::Result<()> {
        let target = self.clock_ns.checked_add(ns)
            .ok_or_else(|| anyhow!("virtual clock overflow at {}ns", self.clock_ns))?;
        while self.next_sync_ns <= target {
            self.clock_ns = self.next_sync_ns;
            self.setup.sync.sync(&self.setup.ctx, self.clock_ns);
            self.next_sync_ns = self.next_sync_ns.checked_add(self.setup.sync_period_ns)
                .ok_or_else(|| anyhow!("virtual clock overflow at {}ns", self.clock_ns))?;
        }
        self.clock_ns = target;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use parking_lot::Mutex;
    use tlmu_core::bus::Bus;
    use crate::engine::{BusClient, CoreContext};
    use crate::sync::{SyncHandler, QuantumKeeper};

    /// Bus client that counts how many accesses went through the bus.
    struct Counting {
        bus: Bus,
        accesses: Mutex<u64>,
    }
    impl BusClient for Counting {
        fn bus_access(&self, _: &CoreContext, txn: &mut Transaction<'_>) -> Result<(), BusFault> {
            *self.accesses.lock() += 1;
            self.bus.access(txn)
        }
        fn get_dmi(&self, _: &CoreContext, addr: u64) -> DmiDescriptor {
            self.bus.get_dmi(addr)
        }
    }

    fn setup(client: Arc<Counting>, sync: Arc<dyn SyncHandler>, args: &[&str]) -> EngineSetup {
        EngineSetup {
            name: "T".into(),
            args: args.iter().map(|s| s.to_string()).collect(),
            ctx: Arc::new(CoreContext { name: "T".into(), index: 0 }),
            client,
            sync,
            sync_period_ns: 1000,
            boot_state: BootState::Running,
            ram: Vec::new(),
        }
    }

    fn client() -> Arc<Counting> {
        Arc::new(Counting { bus: Bus::with_default_map().unwrap(), accesses: Mutex::new(0) })
    }

    #[test]
    fn parse_all_ops() {
        let s = Script::parse("
            # header
            dmi 0x2000_0000
            write 0x100 aabbccdd   # trailing
            read 0x100 4 aabbccdd
            read 256 2
            peek 0x2000_0000 8
            idle 1000
            halt
        ").unwrap();
        assert_eq!(s.ops, vec![
            Op::Dmi { addr: 0x2000_0000 },
            Op::Write { addr: 0x100, data: vec![0xaa, 0xbb, 0xcc, 0xdd] },
            Op::Read { addr: 0x100, len: 4, expect: Some(vec![0xaa, 0xbb, 0xcc, 0xdd]) },
            Op::Read { addr: 0x100, len: 2, expect: None },
            Op::Peek { addr: 0x2000_0000, len: 8 },
            Op::Idle { ns: 1000 },
            Op::Halt,
        ]);
    }

    #[test]
    fn parse_errors_name_the_line() {
        assert_eq!(Script::parse("halt\njump 0x0").unwrap_err(),
            ScriptError::UnknownOp { line: 2, op: "jump".into() });
        assert!(matches!(Script::parse("write 0x10 abc"), Err(ScriptError::Syntax { line: 1, .. })));
        assert!(matches!(Script::parse("read 0x10 2 aabbcc"), Err(ScriptError::Syntax { .. })));
        assert!(matches!(Script::parse("idle"), Err(ScriptError::Syntax { .. })));
    }

    #[test]
    fn oversized_lengths_and_idles_rejected() {
        assert!(matches!(Script::parse("read 0 18446744073709551615"),
            Err(ScriptError::Syntax { line: 1, .. })));
        assert!(matches!(Script::parse("halt\npeek 0x0 0x10001"),
            Err(ScriptError::Syntax { line: 2, .. })));
        assert!(Script::parse("read 0 0x10000").is_ok());

        assert!(matches!(Script::parse("idle 18446744073709551615\nhalt"),
            Err(ScriptError::Syntax { line: 1, .. })));
        assert!(Script::parse(&format!("idle {MAX_IDLE_NS}")).is_ok());
    }

    #[test]
    fn clock_overflow_is_an_error() {
        let s = setup(client(), Arc::new(crate::sync::NullSync), &[]);
        let mut core = ScriptCore {
            setup: &s,
            op_cost_ns: 1,
            clock_ns: u64::MAX - 10,
            next_sync_ns: u64::MAX,
            dmi: Vec::new(),
            executed: 0,
        };
        assert!(core.advance(MAX_IDLE_NS).is_err());
        assert!(core.execute(&[Op::Idle { ns: 100 }]).is_err());

        // Reaching the last sync boundary must not wrap around either.
        core.clock_ns = u64::MAX - 1000;
        core.next_sync_ns = u64::MAX - 500;
        assert!(core.advance(600).is_err());
    }

    #[test]
    fn runs_against_the_bus() {
        let c = client();
        let script = Script::parse("write 0x100 aabbccdd\nread 0x100 4 aabbccdd\nread 0x20000000 4 00000000").unwrap();
        let mut e = ScriptEngine::with_script(script);
        e.configure(setup(c.clone(), Arc::new(crate::sync::NullSync), &["-icount", "2"])).unwrap();
        e.run().unwrap();
        assert_eq!(e.executed, 3);
        assert_eq!(e.clock_ns, 12);
        assert_eq!(*c.accesses.lock(), 3);
        assert_eq!(c.bus.read::<u32>(0x100).unwrap(), 0xddcc_bbaa);
    }

    #[test]
    fn dmi_bypasses_the_bus() {
        let c = client();
        let script = Script::parse("dmi 0x20000000\nwrite 0x20000010 0102\nread 0x20000010 2 0102\nwrite 0x40 ff").unwrap();
        let mut e = ScriptEngine::with_script(script);
        e.configure(setup(c.clone(), Arc::new(crate::sync::NullSync), &[])).unwrap();
        e.run().unwrap();
        // Only the sdram write missed the cached descriptor.
        assert_eq!(*c.accesses.lock(), 1);
        assert_eq!(c.bus.read::<u16>(0x2000_0010).unwrap(), 0x0201);
    }

    #[test]
    fn mismatch_and_fault_are_errors() {
        let c = client();
        let mut e = ScriptEngine::with_script(Script::parse("read 0x0 1 01").unwrap());
        e.configure(setup(c.clone(), Arc::new(crate::sync::NullSync), &[])).unwrap();
        assert!(e.run().unwrap_err().to_string().contains("expected 01 got 00"));

        let mut e = ScriptEngine::with_script(Script::parse("write 0x10000000 01\nhalt").unwrap());
        e.configure(setup(c, Arc::new(crate::sync::NullSync), &[])).unwrap();
        assert!(e.run().is_err());
        assert_eq!(e.executed, 0);
    }

    #[test]
    fn syncs_once_per_quantum() {
        let qk = Arc::new(QuantumKeeper::new(1000));
        let mut e = ScriptEngine::with_script(Script::parse("idle 3500\nwrite 0x0 00\nhalt").unwrap());
        e.configure(setup(client(), qk.clone(), &[])).unwrap();
        e.run().unwrap();
        let t = qk.core_time("T").unwrap();
        // Boundaries at 1000, 2000 and 3000, plus the final sync at halt.
        assert_eq!(t.syncs, 4);
        assert_eq!(t.elapsed_ns, 3501);
    }

    #[test]
    fn sleeping_core_does_nothing() {
        let c = client();
        let mut e = ScriptEngine::with_script(Script::parse("write 0x0 01").unwrap());
        let mut s = setup(c.clone(), Arc::new(crate::sync::NullSync), &[]);
        s.boot_state = BootState::Sleeping;
        e.configure(s).unwrap();
        e.run().unwrap();
        assert_eq!(*c.accesses.lock(), 0);
    }

    #[test]
    fn configure_needs_a_guest() {
        let mut e = ScriptEngine::new();
        let err = e.configure(setup(client(), Arc::new(crate::sync::NullSync), &[])).unwrap_err();
        assert!(err.to_string().contains("no guest image"));

        let mut e = ScriptEngine::new();
        let err = e.configure(setup(client(), Arc::new(crate::sync::NullSync),
            &["-kernel", "/nonexistent/guest.txt"])).unwrap_err();
        assert!(err.to_string().contains("Error opening guest image"));
    }

    #[test]
    fn loads_guest_from_kernel_arg() {
        let mut path = std::env::temp_dir();
        path.push(format!("tlmu-guest-{}.txt", std::process::id()));
        fs::write(&path, "write 0x8 0badf00d\nhalt\n").unwrap();

        let c = client();
        let mut e = ScriptEngine::new();
        e.configure(setup(c.clone(), Arc::new(crate::sync::NullSync),
            &["-kernel", path.to_str().unwrap()])).unwrap();
        e.run().unwrap();
        assert_eq!(c.bus.read::<u32>(0x8).unwrap(), 0x0df0_ad0b);
        let _ = fs::remove_file(&path);
    }
}

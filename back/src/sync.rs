//! Synchronization between cores.
//!
//! Every engine yields to its [SyncHandler] at least once per sync period
//! of virtual time. This is the only point where the harness gets to look
//! at a core while it is running.

use fxhash::FxHashMap;
use log::{trace, warn};
use parking_lot::Mutex;

use crate::engine::CoreContext;

/// How often (in nanoseconds of virtual time) engines yield to the harness.
pub const DEFAULT_SYNC_PERIOD_NS: u64 = 100 * 1000;

pub trait SyncHandler: Send + Sync {
    /// Called from the engine's thread with its elapsed virtual time.
    fn sync(&self, ctx: &CoreContext, elapsed_ns: u64);
}

/// Sync handler that does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSync;
impl SyncHandler for NullSync {
    fn sync(&self, _ctx: &CoreContext, _elapsed_ns: u64) {}
}

/// Virtual time reported by one core.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CoreTime {
    pub elapsed_ns: u64,
    pub syncs: u64,
}

/// Sync handler that keeps track of where each core is in virtual time.
#[derive(Debug)]
pub struct QuantumKeeper {
    quantum_ns: u64,
    cores: Mutex<FxHashMap<String, CoreTime>>,
}
impl QuantumKeeper {
    pub fn new(quantum_ns: u64) -> Self {
        QuantumKeeper { quantum_ns, cores: Mutex::new(FxHashMap::default()) }
    }

    pub fn quantum_ns(&self) -> u64 {
        self.quantum_ns
    }

    pub fn core_time(&self, name: &str) -> Option<CoreTime> {
        self.cores.lock().get(name).copied()
    }

    /// Distance in virtual time between the furthest ahead and furthest
    /// behind core.
    pub fn skew_ns(&self) -> u64 {
        let cores = self.cores.lock();
        let times = cores.values().map(|t| t.elapsed_ns);
        match (times.clone().max(), times.min()) {
            (Some(max), Some(min)) => max - min,
            _ => 0,
        }
    }

    pub fn snapshot(&self) -> Vec<(String, CoreTime)> {
        let mut res: Vec<_> = self.cores.lock().iter()
            .map(|(name, t)| (name.clone(), *t))
            .collect();
        res.sort_by(|a, b| a.0.cmp(&b.0));
        res
    }
}

impl SyncHandler for QuantumKeeper {
    fn sync(&self, ctx: &CoreContext, elapsed_ns: u64) {
        let mut cores = self.cores.lock();
        let entry = cores.entry(ctx.name.clone()).or_default();
        let since_last = elapsed_ns.saturating_sub(entry.elapsed_ns);
        if entry.syncs != 0 && since_last > self.quantum_ns {
            warn!(target: "SYNC", "{} yielded {since_last}ns after its last sync (quantum {}ns)",
                ctx.name, self.quantum_ns);
        }
        entry.elapsed_ns = entry.elapsed_ns.max(elapsed_ns);
        entry.syncs += 1;
        trace!(target: "SYNC", "{} at {elapsed_ns}ns", ctx.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(name: &str, index: usize) -> CoreContext {
        CoreContext { name: name.to_owned(), index }
    }

    #[test]
    fn keeper_tracks_each_core() {
        let qk = QuantumKeeper::new(DEFAULT_SYNC_PERIOD_NS);
        let (a, b) = (ctx("a", 0), ctx("b", 1));
        qk.sync(&a, 100_000);
        qk.sync(&a, 200_000);
        qk.sync(&b, 50_000);

        assert_eq!(qk.core_time("a"), Some(CoreTime { elapsed_ns: 200_000, syncs: 2 }));
        assert_eq!(qk.core_time("b"), Some(CoreTime { elapsed_ns: 50_000, syncs: 1 }));
        assert_eq!(qk.core_time("c"), None);
        assert_eq!(qk.skew_ns(), 150_000);
        assert_eq!(qk.snapshot()[0].0, "a");
    }

    #[test]
    fn keeper_time_never_goes_backwards() {
        let qk = QuantumKeeper::new(10);
        let a = ctx("a", 0);
        qk.sync(&a, 30);
        qk.sync(&a, 20);
        assert_eq!(qk.core_time("a").unwrap().elapsed_ns, 30);
    }

    #[test]
    fn empty_keeper_has_no_skew() {
        assert_eq!(QuantumKeeper::new(1).skew_ns(), 0);
    }
}

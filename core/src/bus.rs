pub mod prim;
pub mod dmi;

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering::Relaxed;

use iset::IntervalMap;
use log::{debug, info, trace};

use crate::bus::prim::*;
use crate::mem::Region;

/// Counters for non-debug traffic on the bus.
#[derive(Debug, Default)]
pub struct BusStats {
    pub reads: AtomicU64,
    pub writes: AtomicU64,
    pub faults: AtomicU64,
}

/// Implementation of an emulated bus.
///
/// In this model, the bus owns a fixed set of non-overlapping memory
/// regions. Accesses are dispatched to the region containing the target
/// address; the bus itself has no other state and is shared between all
/// core threads behind an [Arc].
pub struct Bus {
    regions: Vec<Arc<Region>>,
    /// Address ranges mapped to indices into `regions`.
    map: IntervalMap<u64, usize>,
    pub stats: BusStats,
}
impl std::fmt::Debug for Bus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bus").field("regions", &self.regions).finish()
    }
}

impl Bus {
    pub fn new(regions: Vec<Region>) -> Result<Self, BusError> {
        let mut map: IntervalMap<u64, usize> = IntervalMap::new();
        for (idx, region) in regions.iter().enumerate() {
            if region.size() == 0 {
                return Err(BusError::EmptyRegion(region.name().to_owned()));
            }
            let end = region.base().checked_add(region.size())
                .ok_or_else(|| BusError::AddressOverflow(region.name().to_owned()))?;
            if let Some((_, &other)) = map.iter(region.base()..end).next() {
                return Err(BusError::Overlap {
                    name: region.name().to_owned(),
                    other: regions[other].name().to_owned(),
                });
            }
            map.insert(region.base()..end, idx);
            debug!(target: "BUS", "mapped {} at {:#010x}..={:#010x}",
                region.name(), region.base(), region.tail());
        }
        Ok(Bus {
            regions: regions.into_iter().map(Arc::new).collect(),
            map,
            stats: BusStats::default(),
        })
    }

    pub fn regions(&self) -> &[Arc<Region>] {
        &self.regions
    }

    /// Find the region containing some address.
    pub fn resolve(&self, addr: u64) -> Option<&Arc<Region>> {
        self.map.overlap(addr).next().map(|(_, &idx)| &self.regions[idx])
    }

    pub fn region_by_name(&self, name: &str) -> Option<&Arc<Region>> {
        self.regions.iter().find(|r| r.name() == name)
    }
}

/// Dispatch of transactions.
impl Bus {
    /// Route a transaction to the region that owns its address and perform
    /// the copy.
    pub fn access(&self, txn: &mut Transaction<'_>) -> Result<(), BusFault> {
        let res = self.dispatch(txn);
        if !txn.debug {
            match (&res, txn.direction()) {
                (Err(_), _) => self.stats.faults.fetch_add(1, Relaxed),
                (Ok(()), Direction::Read) => self.stats.reads.fetch_add(1, Relaxed),
                (Ok(()), Direction::Write) => self.stats.writes.fetch_add(1, Relaxed),
            };
        }
        res
    }

    /// Debug variant of [Bus::access]: only moves data.
    pub fn access_dbg(&self, txn: &mut Transaction<'_>) -> Result<(), BusFault> {
        txn.debug = true;
        self.dispatch(txn)
    }

    fn dispatch(&self, txn: &mut Transaction<'_>) -> Result<(), BusFault> {
        let dir = txn.direction();
        let (addr, len) = (txn.addr, txn.len());
        let region = match self.resolve(addr) {
            Some(region) => region,
            None => return Err(BusFault::Unmapped { dir, addr, len }),
        };
        if !txn.debug && !region.prot().allows(dir) {
            return Err(BusFault::Protection { dir, addr, region: region.name().to_owned() });
        }
        trace!(target: "BUS", "{dir} {len} bytes at {addr:#010x} ({}) clk={}{}",
            region.name(), txn.clock, if txn.debug { " dbg" } else { "" });
        match &mut txn.payload {
            Payload::Read(dst) => region.read_buf(addr, dst),
            Payload::Write(src) => region.write_buf(addr, src),
        }
    }

    pub fn read_buf(&self, addr: u64, dst: &mut [u8]) -> Result<(), BusFault> {
        self.access(&mut Transaction::read(addr, dst))
    }
    pub fn write_buf(&self, addr: u64, src: &[u8]) -> Result<(), BusFault> {
        self.access(&mut Transaction::write(addr, src))
    }

    pub fn read<T: AccessWidth>(&self, addr: u64) -> Result<T, BusFault> {
        let mut buf = [0u8; 8];
        self.read_buf(addr, &mut buf[..T::WIDTH])?;
        Ok(T::from_le_slice(&buf[..T::WIDTH]))
    }
    pub fn write<T: AccessWidth>(&self, addr: u64, val: T) -> Result<(), BusFault> {
        let mut buf = [0u8; 8];
        val.write_le_slice(&mut buf[..T::WIDTH]);
        self.write_buf(addr, &buf[..T::WIDTH])
    }
}

impl Bus {
    /// Write the contents of every region to `<dir>/<name>.<suffix>`.
    pub fn dump_memory(&self, dir: &Path, suffix: &str) -> anyhow::Result<()> {
        for region in &self.regions {
            let mut path = dir.to_path_buf();
            path.push(region.name());
            path.set_extension(suffix);
            region.dump(&path)?;
            info!(target: "BUS", "{} -> {} (crc32 {:08x})", region.name(),
                path.display(), region.checksum());
        }
        Ok(())
    }

    pub fn log_stats(&self) {
        info!(target: "BUS", "reads={} writes={} faults={}",
            self.stats.reads.load(Relaxed),
            self.stats.writes.load(Relaxed),
            self.stats.faults.load(Relaxed));
    }
}

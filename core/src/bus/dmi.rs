//! Direct memory interface.
//!
//! A core that expects to hit the same memory repeatedly can ask the bus
//! for a [DmiDescriptor] and access the backing region directly, skipping
//! address dispatch on every access.

use std::fmt;
use std::sync::Arc;

use log::trace;

use crate::bus::Bus;
use crate::bus::prim::{BusFault, Direction};
use crate::mem::{Prot, Region};

/// A direct view onto the region backing some address.
///
/// The descriptor holds a reference to the region, so the backing buffer
/// lives at least as long as the descriptor. Regions are never remapped
/// once the bus is built, so a valid descriptor never goes stale.
#[derive(Clone, Default)]
pub struct DmiDescriptor {
    region: Option<Arc<Region>>,
    pub base: u64,
    pub size: u64,
    pub prot: Prot,
}
impl DmiDescriptor {
    /// False for the descriptor returned on unmapped addresses.
    pub fn is_valid(&self) -> bool {
        self.region.is_some()
    }

    pub fn region(&self) -> Option<&Arc<Region>> {
        self.region.as_ref()
    }

    pub fn contains(&self, addr: u64) -> bool {
        self.is_valid() && addr >= self.base && addr - self.base < self.size
    }

    /// True when an access of `len` bytes at `addr` can go through this
    /// descriptor.
    pub fn permits(&self, dir: Direction, addr: u64, len: usize) -> bool {
        match &self.region {
            Some(region) => self.prot.allows(dir) && region.contains_range(addr, len),
            None => false,
        }
    }

    fn target(&self, dir: Direction, addr: u64, len: usize) -> Result<&Region, BusFault> {
        let region = match &self.region {
            Some(region) if self.contains(addr) => region,
            _ => return Err(BusFault::Unmapped { dir, addr, len }),
        };
        if !self.prot.allows(dir) {
            return Err(BusFault::Protection { dir, addr, region: region.name().to_owned() });
        }
        Ok(region.as_ref())
    }

    pub fn read_buf(&self, addr: u64, dst: &mut [u8]) -> Result<(), BusFault> {
        self.target(Direction::Read, addr, dst.len())?.read_buf(addr, dst)
    }

    pub fn write_buf(&self, addr: u64, src: &[u8]) -> Result<(), BusFault> {
        self.target(Direction::Write, addr, src.len())?.write_buf(addr, src)
    }
}

impl fmt::Debug for DmiDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmiDescriptor")
            .field("region", &self.region.as_ref().map(|r| r.name()))
            .field("base", &format_args!("{:#010x}", self.base))
            .field("size", &format_args!("{:#x}", self.size))
            .field("prot", &self.prot.bits())
            .finish()
    }
}

impl Bus {
    /// Get a descriptor for the region containing `addr`.
    ///
    /// Unmapped addresses yield [DmiDescriptor::default], with every field
    /// zeroed.
    pub fn get_dmi(&self, addr: u64) -> DmiDescriptor {
        match self.resolve(addr) {
            Some(region) => {
                trace!(target: "DMI", "{addr:#010x} -> {}", region.name());
                DmiDescriptor {
                    region: Some(region.clone()),
                    base: region.base(),
                    size: region.size(),
                    prot: region.prot(),
                }
            },
            None => {
                trace!(target: "DMI", "{addr:#010x} unmapped");
                DmiDescriptor::default()
            },
        }
    }
}

//! Fixed address map shared by every core.

use crate::bus::Bus;
use crate::bus::prim::BusError;
use crate::mem::{Prot, Region};

// Sizes of physical memory devices.
pub const IO_RAM_SIZE:  u64 = 0x0100_0000;
pub const SDRAM_SIZE:   u64 = 0x0010_0000;

// Base addresses for physical memory devices.
pub const IO_RAM_BASE:  u64 = 0x2000_0000;
pub const SDRAM_BASE:   u64 = 0x0000_0000;

// Tail addresses for physical memory devices.
pub const IO_RAM_TAIL:  u64 = IO_RAM_BASE + IO_RAM_SIZE - 1;
pub const SDRAM_TAIL:   u64 = SDRAM_BASE + SDRAM_SIZE - 1;

pub const IO_RAM_NAME:  &str = "io_ram";
pub const SDRAM_NAME:   &str = "sdram";

/// Zeroed regions for the default address map.
pub fn default_regions() -> Vec<Region> {
    vec![
        Region::zeroed(IO_RAM_NAME, IO_RAM_BASE, IO_RAM_SIZE as usize, Prot::RW),
        Region::zeroed(SDRAM_NAME, SDRAM_BASE, SDRAM_SIZE as usize, Prot::RW),
    ]
}

impl Bus {
    /// Build a bus with the default address map.
    pub fn with_default_map() -> Result<Self, BusError> {
        Bus::new(default_regions())
    }
}

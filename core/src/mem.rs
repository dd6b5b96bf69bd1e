use std::fmt;
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use anyhow::Context;
use log::debug;
use parking_lot::RwLock;

use crate::bus::prim::{BusFault, Direction};

/// Access permissions on a region of memory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Prot {
    pub read: bool,
    pub write: bool,
}
impl Prot {
    pub const NONE: Prot = Prot { read: false, write: false };
    pub const RO: Prot = Prot { read: true, write: false };
    pub const RW: Prot = Prot { read: true, write: true };

    /// Encoding used on DMI descriptors (bit 0: read, bit 1: write).
    pub fn bits(self) -> u32 {
        (self.read as u32) | ((self.write as u32) << 1)
    }

    pub fn allows(self, dir: Direction) -> bool {
        match dir {
            Direction::Read => self.read,
            Direction::Write => self.write,
        }
    }
}

/// A named span of flat RAM visible on the bus.
///
/// The backing buffer is owned by the region and is never resized. Every
/// access takes the region lock, so cores on different threads can share
/// a region safely.
pub struct Region {
    name: String,
    base: u64,
    size: u64,
    prot: Prot,
    data: RwLock<Vec<u8>>,
}
impl Region {
    /// Wrap an existing buffer; the region size is the buffer length.
    pub fn new(name: impl Into<String>, base: u64, data: Vec<u8>, prot: Prot) -> Self {
        Region {
            name: name.into(),
            base,
            size: data.len() as u64,
            prot,
            data: RwLock::new(data),
        }
    }

    pub fn zeroed(name: impl Into<String>, base: u64, size: usize, prot: Prot) -> Self {
        Self::new(name, base, vec![0u8; size], prot)
    }

    /// Create a region and fill it from the start of some file.
    pub fn from_file(name: impl Into<String>, base: u64, size: usize, prot: Prot,
        filename: &impl AsRef<Path>) -> anyhow::Result<Self>
    {
        let filename = filename.as_ref();
        let mut f = File::open(filename)
            .context(format!("Region: Couldn't open init file: {}", filename.display()))?;
        let mut data = vec![0u8; size];
        let len = f.read(&mut data)?; // ignore partial read
        let res = Self::new(name, base, data, prot);
        debug!(target: "MEM", "{}: loaded {len:#x} bytes from {}", res.name, filename.display());
        Ok(res)
    }

    pub fn name(&self) -> &str { &self.name }
    pub fn base(&self) -> u64 { self.base }
    pub fn size(&self) -> u64 { self.size }
    pub fn prot(&self) -> Prot { self.prot }

    /// Last address (inclusive) covered by this region. An empty region
    /// reports its base.
    pub fn tail(&self) -> u64 {
        self.base + self.size.saturating_sub(1)
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr - self.base < self.size
    }

    /// True when all of `[addr, addr+len)` lies inside this region.
    pub fn contains_range(&self, addr: u64, len: usize) -> bool {
        self.contains(addr) && (addr - self.base).saturating_add(len as u64) <= self.size
    }

    /// CRC32 of the current contents.
    pub fn checksum(&self) -> u32 {
        crc32fast::hash(&self.data.read())
    }

    pub fn dump(&self, filename: &impl AsRef<Path>) -> anyhow::Result<()> {
        let filename = filename.as_ref();
        let mut f = File::create(filename)
            .context(format!("Region: Couldn't create dump file: {}", filename.to_string_lossy()))?;
        let data = self.data.read();
        f.write_all(data.as_slice())?;
        debug!(target: "MEM", "Dumped {} to {} (crc32 {:08x})", self.name,
            filename.display(), crc32fast::hash(&data));
        Ok(())
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("name", &self.name)
            .field("base", &format_args!("{:#010x}", self.base))
            .field("size", &format_args!("{:#x}", self.size))
            .field("prot", &self.prot)
            .finish()
    }
}

/// Bulk reads and writes, addressed by bus address.
///
/// Protection is not checked here; that is up to the bus or the DMI
/// descriptor making the access.
impl Region {
    fn offset(&self, dir: Direction, addr: u64, len: usize) -> Result<usize, BusFault> {
        if !self.contains_range(addr, len) {
            return Err(BusFault::OutOfBounds {
                dir, addr, len, region: self.name.clone(),
            });
        }
        Ok((addr - self.base) as usize)
    }

    pub fn read_buf(&self, addr: u64, dst: &mut [u8]) -> Result<(), BusFault> {
        let off = self.offset(Direction::Read, addr, dst.len())?;
        dst.copy_from_slice(&self.data.read()[off..off + dst.len()]);
        Ok(())
    }

    pub fn write_buf(&self, addr: u64, src: &[u8]) -> Result<(), BusFault> {
        let off = self.offset(Direction::Write, addr, src.len())?;
        self.data.write()[off..off + src.len()].copy_from_slice(src);
        Ok(())
    }

    pub fn memset(&self, addr: u64, len: usize, val: u8) -> Result<(), BusFault> {
        let off = self.offset(Direction::Write, addr, len)?;
        self.data.write()[off..off + len].fill(val);
        Ok(())
    }
}

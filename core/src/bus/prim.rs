use thiserror::Error;

/// Helper functions implemented on numeric primitives.
///
/// These let us easily convert between numeric primitives and the
/// little-endian byte slices moved across the bus.
pub trait AccessWidth: Sized + Copy {
    const WIDTH: usize;
    fn from_le_slice(data: &[u8]) -> Self;
    fn write_le_slice(self, dst: &mut [u8]);
}

/// Macro to make implementing AccessWidth a bit less verbose.
macro_rules! impl_accesswidth {
    ($type:ident) => {
        impl AccessWidth for $type {
            const WIDTH: usize = std::mem::size_of::<$type>();
            fn from_le_slice(data: &[u8]) -> Self {
                let mut buf = [0u8; std::mem::size_of::<$type>()];
                buf.copy_from_slice(data);
                Self::from_le_bytes(buf)
            }
            fn write_le_slice(self, dst: &mut [u8]) {
                dst.copy_from_slice(&self.to_le_bytes());
            }
        }
    };
}

// Implement AccessWidth for the supported numeric primitives.
impl_accesswidth!(u64);
impl_accesswidth!(u32);
impl_accesswidth!(u16);
impl_accesswidth!(u8);

/// Direction of an access on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Direction { Read, Write }

/// Data carried by a transaction.
#[derive(Debug)]
pub enum Payload<'a> {
    /// Destination buffer for a read.
    Read(&'a mut [u8]),
    /// Source data for a write.
    Write(&'a [u8]),
}

/// A single access on the bus.
///
/// Transactions are built by an engine for each access, handed to the bus
/// and dropped once the access completes.
#[derive(Debug)]
pub struct Transaction<'a> {
    pub addr: u64,
    pub payload: Payload<'a>,
    /// Logical clock of the issuing core, in nanoseconds.
    pub clock: i64,
    /// Debug accesses (debugger peeks/pokes) ignore protection and are
    /// not counted.
    pub debug: bool,
}
impl<'a> Transaction<'a> {
    pub fn read(addr: u64, dst: &'a mut [u8]) -> Self {
        Transaction { addr, payload: Payload::Read(dst), clock: 0, debug: false }
    }
    pub fn write(addr: u64, src: &'a [u8]) -> Self {
        Transaction { addr, payload: Payload::Write(src), clock: 0, debug: false }
    }
    pub fn at(mut self, clock: i64) -> Self {
        self.clock = clock;
        self
    }
    pub fn debug(mut self) -> Self {
        self.debug = true;
        self
    }

    pub fn direction(&self) -> Direction {
        match self.payload {
            Payload::Read(_) => Direction::Read,
            Payload::Write(_) => Direction::Write,
        }
    }
    pub fn len(&self) -> usize {
        match &self.payload {
            Payload::Read(dst) => dst.len(),
            Payload::Write(src) => src.len(),
        }
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Reasons an access on the bus can fail.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusFault {
    #[error("unmapped {dir} of {len} bytes at {addr:#010x}")]
    Unmapped { dir: Direction, addr: u64, len: usize },
    #[error("{dir} of {len} bytes at {addr:#010x} runs past the end of {region}")]
    OutOfBounds { dir: Direction, addr: u64, len: usize, region: String },
    #[error("{dir} at {addr:#010x} not permitted on {region}")]
    Protection { dir: Direction, addr: u64, region: String },
}

/// Reasons a set of regions can't be assembled into a bus.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("region {0} is empty")]
    EmptyRegion(String),
    #[error("region {0} extends past the end of the address space")]
    AddressOverflow(String),
    #[error("region {name} overlaps region {other}")]
    Overlap { name: String, other: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accesswidth_is_little_endian() {
        let mut buf = [0u8; 4];
        0xaabb_ccddu32.write_le_slice(&mut buf);
        assert_eq!(buf, [0xdd, 0xcc, 0xbb, 0xaa]);
        assert_eq!(u16::from_le_slice(&buf[2..]), 0xaabb);
        assert_eq!(<u64 as AccessWidth>::WIDTH, 8);
    }

    #[test]
    fn transaction_shape() {
        let mut dst = [0u8; 2];
        let t = Transaction::read(0x10, &mut dst).at(42).debug();
        assert_eq!(t.direction(), Direction::Read);
        assert_eq!(t.len(), 2);
        assert_eq!(t.clock, 42);
        assert!(t.debug);
        assert_eq!(Transaction::write(0, &[1, 2, 3]).direction(), Direction::Write);
    }

    #[test]
    fn fault_messages() {
        let f = BusFault::Unmapped { dir: Direction::Write, addr: 0x1000_0000, len: 4 };
        assert_eq!(f.to_string(), "unmapped write of 4 bytes at 0x10000000");
    }
}

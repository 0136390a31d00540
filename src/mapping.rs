//! Segment Mapping Primitive
//!
//! The loader never touches the address space directly: mapping, unmapping,
//! protection changes, and all reads/writes of mapped memory go through the
//! [`SegmentMapper`] capability. In a live process this is the OS
//! mmap/mprotect layer; under test it is the in-memory arena in
//! [`crate::testing`], which also enforces protections so the engine's
//! write discipline is checked rather than assumed.

use crate::image::Protection;

/// Errors reported by the mapping primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    /// The address space (or the arena) cannot satisfy the request.
    Exhausted,
    /// The address does not fall inside any mapped region.
    Unmapped {
        /// The faulting address.
        addr: u64,
    },
    /// The access violates the region's current protection.
    ProtectionViolation {
        /// The faulting address.
        addr: u64,
    },
    /// The range does not correspond to a single mapped region.
    BadRange,
}

impl core::fmt::Display for MapError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Exhausted => write!(f, "address space exhausted"),
            Self::Unmapped { addr } => write!(f, "address {:#x} not mapped", addr),
            Self::ProtectionViolation { addr } => {
                write!(f, "protection violation at {:#x}", addr)
            }
            Self::BadRange => write!(f, "range is not a mapped region"),
        }
    }
}

/// Memory-mapping and protection capability.
///
/// Regions are created writable so image contents and fixups can be written,
/// then dropped to their final protection by the caller. Reads are always
/// permitted; writes honor the region's current protection.
pub trait SegmentMapper: Send + Sync {
    /// Reserve a region of `size` bytes for the named image.
    ///
    /// Returns the region's base address.
    fn map(&self, path: &str, size: u64) -> Result<u64, MapError>;

    /// Release a mapped region.
    fn unmap(&self, base: u64, size: u64);

    /// Change a range's protection.
    fn set_protection(&self, base: u64, size: u64, prot: Protection) -> Result<(), MapError>;

    /// Read bytes from mapped memory.
    fn read(&self, addr: u64, buf: &mut [u8]) -> Result<(), MapError>;

    /// Write bytes to mapped memory.
    fn write(&self, addr: u64, bytes: &[u8]) -> Result<(), MapError>;

    /// Read one pointer-sized little-endian value.
    fn read_u64(&self, addr: u64) -> Result<u64, MapError> {
        let mut buf = [0u8; 8];
        self.read(addr, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Write one pointer-sized little-endian value.
    fn write_u64(&self, addr: u64, value: u64) -> Result<(), MapError> {
        self.write(addr, &value.to_le_bytes())
    }
}

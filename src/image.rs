//! Image Records
//!
//! In-memory representation of one mapped binary (the program or a shared
//! library): its segments, symbol tables, dependency links, reference count,
//! and load-state lifecycle.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use bitflags::bitflags;
use hashbrown::HashMap;
use spin::Mutex;

use crate::format::InitRoutine;

bitflags! {
    /// Memory protection for a mapped segment.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Protection: u8 {
        /// Segment is readable.
        const READ = 1;
        /// Segment is writable.
        const WRITE = 2;
        /// Segment is executable.
        const EXECUTE = 4;
    }
}

impl Protection {
    /// Read-write data.
    pub const RW: Protection = Protection::READ.union(Protection::WRITE);

    /// Read-execute text.
    pub const RX: Protection = Protection::READ.union(Protection::EXECUTE);

    /// Check if the protection allows writes.
    pub fn is_writable(&self) -> bool {
        self.contains(Protection::WRITE)
    }

    /// Check if the protection allows execution.
    pub fn is_executable(&self) -> bool {
        self.contains(Protection::EXECUTE)
    }
}

/// One segment of an image.
///
/// Offsets are relative to the image's start; the segment's resident address
/// is the image base plus `offset`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentSpec {
    /// Offset of the segment from the image start.
    pub offset: u64,
    /// Size of the segment in bytes.
    pub size: u64,
    /// Final protection of the segment.
    pub prot: Protection,
    /// Offset of the first fixup-chain slot from the segment start, if the
    /// segment carries a chain.
    pub chain_start: Option<u64>,
    /// Constant data that is written during fixup application and then
    /// re-protected to read-only.
    pub read_only_data: bool,
}

/// A dependency declared by an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyRef {
    /// Identifier the resolver locates the dependency by.
    pub identifier: String,
    /// Capability version the requester needs (interpreted by the
    /// compatibility policy).
    pub required_capability: u32,
}

/// Lifecycle of an image within a load transaction.
///
/// Success path: `Unmapped → Mapped → Rebased → Bound → Initialized →
/// Registered`. Any failure moves the image to `Unwound` and discards it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LoadState {
    /// Located but not yet resident.
    Unmapped = 0,
    /// Segments resident in the address space.
    Mapped = 1,
    /// Internal (rebase) fixups applied.
    Rebased = 2,
    /// External (bind) fixups applied.
    Bound = 3,
    /// Initializer routines have run.
    Initialized = 4,
    /// Visible in the process image registry.
    Registered = 5,
    /// Discarded by a failed transaction.
    Unwound = 6,
}

impl LoadState {
    fn from_u8(raw: u8) -> LoadState {
        match raw {
            0 => LoadState::Unmapped,
            1 => LoadState::Mapped,
            2 => LoadState::Rebased,
            3 => LoadState::Bound,
            4 => LoadState::Initialized,
            5 => LoadState::Registered,
            _ => LoadState::Unwound,
        }
    }
}

/// One mapped binary and its load-state metadata.
///
/// A record is owned by the in-flight transaction until it reaches
/// `Registered`, at which point the registry holds it for the rest of its
/// life. Reference counts track explicit load handles plus dependent images.
pub struct ImageRecord {
    path: String,
    base: u64,
    slide: u64,
    total_size: u64,
    segments: Vec<SegmentSpec>,
    declared_deps: Vec<DependencyRef>,
    imports: Vec<String>,
    exports: HashMap<String, u64>,
    initializers: Vec<InitRoutine>,
    capability: u32,
    dependencies: Mutex<Vec<Arc<ImageRecord>>>,
    ref_count: AtomicUsize,
    state: AtomicU8,
}

impl ImageRecord {
    /// Create a record for an image mapped at `base`.
    ///
    /// `slide` is the wrapping difference between the actual base and the
    /// image's preferred base.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        path: String,
        base: u64,
        slide: u64,
        total_size: u64,
        segments: Vec<SegmentSpec>,
        declared_deps: Vec<DependencyRef>,
        imports: Vec<String>,
        exports: HashMap<String, u64>,
        initializers: Vec<InitRoutine>,
        capability: u32,
    ) -> Self {
        Self {
            path,
            base,
            slide,
            total_size,
            segments,
            declared_deps,
            imports,
            exports,
            initializers,
            capability,
            dependencies: Mutex::new(Vec::new()),
            ref_count: AtomicUsize::new(0),
            state: AtomicU8::new(LoadState::Mapped as u8),
        }
    }

    /// Identifying path of the image.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Actual load (base) address.
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Address-space displacement (actual base minus preferred base).
    pub fn slide(&self) -> u64 {
        self.slide
    }

    /// Total mapped extent in bytes.
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Ordered segment list.
    pub fn segments(&self) -> &[SegmentSpec] {
        &self.segments
    }

    /// Resident address of a segment.
    pub fn segment_base(&self, segment: &SegmentSpec) -> u64 {
        self.base.wrapping_add(segment.offset)
    }

    /// Dependencies declared in the image header, in declaration order.
    pub fn declared_deps(&self) -> &[DependencyRef] {
        &self.declared_deps
    }

    /// External-symbol-name table, indexed by bind ordinal.
    pub fn imports(&self) -> &[String] {
        &self.imports
    }

    /// Address of an exported symbol, if the image exports `name`.
    pub fn export_address(&self, name: &str) -> Option<u64> {
        self.exports
            .get(name)
            .map(|offset| self.base.wrapping_add(*offset))
    }

    /// Initializer routines in declaration order.
    pub fn initializers(&self) -> &[InitRoutine] {
        &self.initializers
    }

    /// Capability version this image provides.
    pub fn capability(&self) -> u32 {
        self.capability
    }

    /// Resolved dependency records, set once by the resolver.
    pub fn dependencies(&self) -> Vec<Arc<ImageRecord>> {
        self.dependencies.lock().clone()
    }

    /// Record the resolved dependency images.
    pub fn set_dependencies(&self, deps: Vec<Arc<ImageRecord>>) {
        *self.dependencies.lock() = deps;
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LoadState {
        LoadState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Advance the lifecycle state.
    pub fn set_state(&self, state: LoadState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Current reference count.
    pub fn ref_count(&self) -> usize {
        self.ref_count.load(Ordering::Acquire)
    }

    /// Take a reference (load handle or dependent image).
    pub fn retain(&self) {
        self.ref_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop a reference; returns the remaining count.
    pub fn release(&self) -> usize {
        let previous = self.ref_count.fetch_sub(1, Ordering::AcqRel);
        previous.saturating_sub(1)
    }
}

impl core::fmt::Debug for ImageRecord {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ImageRecord")
            .field("path", &self.path)
            .field("base", &self.base)
            .field("slide", &self.slide)
            .field("state", &self.state())
            .field("ref_count", &self.ref_count())
            .finish()
    }
}

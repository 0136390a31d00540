//! In-Memory Capability Implementations
//!
//! Reference implementations of the loader's collaborator traits, shipped
//! in the tree so the engine can be exercised end-to-end on a host:
//!
//! - [`ArenaMapper`] — an address-space arena standing in for the OS
//!   mapping layer. It enforces protections on writes and keeps an
//!   operation log, so tests can verify *when* the engine wrote and
//!   re-protected, not just what ended up in memory.
//! - [`ImageStore`] + [`ImageBuilder`] — a synthetic binary format: images
//!   are described programmatically and the builder encodes real fixup
//!   chains into their contents.
//! - [`FixedThread`] — a constant thread-identity source.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use hashbrown::HashMap;
use spin::Mutex;

use crate::fixup::{encode_bind, encode_rebase, SLOT_SIZE};
use crate::format::{AnyVersion, Export, ImageFormat, ImageLayout, InitRoutine};
use crate::image::{DependencyRef, Protection, SegmentSpec};
use crate::loader::Loader;
use crate::mapping::{MapError, SegmentMapper};
use crate::sync::{ThreadIdSource, ThreadToken};

/// One operation the arena performed, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArenaEvent {
    /// A region was mapped.
    Map {
        /// Image path given to `map`.
        path: String,
        /// Assigned base address.
        base: u64,
        /// Region size.
        size: u64,
    },
    /// A region was unmapped.
    Unmap {
        /// Region base.
        base: u64,
        /// Region size.
        size: u64,
    },
    /// A range's protection changed.
    Protect {
        /// Range base.
        base: u64,
        /// Range size.
        size: u64,
        /// New protection.
        prot: Protection,
    },
    /// Bytes were written.
    Write {
        /// Write address.
        addr: u64,
        /// Write length.
        len: usize,
    },
}

struct Region {
    path: String,
    base: u64,
    size: u64,
    data: Vec<u8>,
    /// Protection overrides applied by `set_protection`, latest wins.
    overrides: Vec<(u64, u64, Protection)>,
}

impl Region {
    fn contains(&self, addr: u64, len: u64) -> bool {
        addr >= self.base && addr.wrapping_add(len) <= self.base + self.size
    }

    fn effective_prot(&self, addr: u64, len: u64) -> Protection {
        for (start, size, prot) in self.overrides.iter().rev() {
            let end = start + size;
            if addr + len > *start && addr < end {
                return *prot;
            }
        }
        Protection::RW
    }
}

struct ArenaState {
    regions: Vec<Region>,
    next_base: u64,
    events: Vec<ArenaEvent>,
    maps_before_failure: Option<usize>,
}

/// In-memory address-space arena.
pub struct ArenaMapper {
    state: Mutex<ArenaState>,
}

impl ArenaMapper {
    /// Create an empty arena.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ArenaState {
                regions: Vec::new(),
                next_base: 0x1000_0000,
                events: Vec::new(),
                maps_before_failure: None,
            }),
        }
    }

    /// Allow `remaining` more `map` calls, then fail every one after.
    pub fn fail_after_maps(&self, remaining: usize) {
        self.state.lock().maps_before_failure = Some(remaining);
    }

    /// Currently resident regions as `(path, base, size)`.
    pub fn resident(&self) -> Vec<(String, u64, u64)> {
        self.state
            .lock()
            .regions
            .iter()
            .map(|r| (r.path.clone(), r.base, r.size))
            .collect()
    }

    /// Number of `map` calls made for `path` over the arena's lifetime.
    pub fn map_calls(&self, path: &str) -> usize {
        self.state
            .lock()
            .events
            .iter()
            .filter(|e| matches!(e, ArenaEvent::Map { path: p, .. } if p == path))
            .count()
    }

    /// Operation log so far.
    pub fn events(&self) -> Vec<ArenaEvent> {
        self.state.lock().events.clone()
    }

    /// Check whether a write of `len` bytes at `addr` would be allowed.
    pub fn is_writable(&self, addr: u64, len: u64) -> bool {
        let state = self.state.lock();
        state
            .regions
            .iter()
            .find(|r| r.contains(addr, len))
            .map(|r| r.effective_prot(addr, len).is_writable())
            .unwrap_or(false)
    }
}

impl Default for ArenaMapper {
    fn default() -> Self {
        Self::new()
    }
}

impl SegmentMapper for ArenaMapper {
    fn map(&self, path: &str, size: u64) -> Result<u64, MapError> {
        let mut state = self.state.lock();

        if let Some(remaining) = state.maps_before_failure.as_mut() {
            if *remaining == 0 {
                return Err(MapError::Exhausted);
            }
            *remaining -= 1;
        }

        let base = state.next_base;
        let span = (size + 0xFFFF) & !0xFFFF;
        state.next_base += span + 0x10000;
        state.regions.push(Region {
            path: String::from(path),
            base,
            size,
            data: vec![0u8; size as usize],
            overrides: Vec::new(),
        });
        state.events.push(ArenaEvent::Map {
            path: String::from(path),
            base,
            size,
        });
        Ok(base)
    }

    fn unmap(&self, base: u64, size: u64) {
        let mut state = self.state.lock();
        state.regions.retain(|r| r.base != base);
        state.events.push(ArenaEvent::Unmap { base, size });
    }

    fn set_protection(&self, base: u64, size: u64, prot: Protection) -> Result<(), MapError> {
        let mut state = self.state.lock();
        let region = state
            .regions
            .iter_mut()
            .find(|r| r.contains(base, size))
            .ok_or(MapError::BadRange)?;
        region.overrides.push((base, size, prot));
        state.events.push(ArenaEvent::Protect { base, size, prot });
        Ok(())
    }

    fn read(&self, addr: u64, buf: &mut [u8]) -> Result<(), MapError> {
        let state = self.state.lock();
        let region = state
            .regions
            .iter()
            .find(|r| r.contains(addr, buf.len() as u64))
            .ok_or(MapError::Unmapped { addr })?;
        let start = (addr - region.base) as usize;
        buf.copy_from_slice(&region.data[start..start + buf.len()]);
        Ok(())
    }

    fn write(&self, addr: u64, bytes: &[u8]) -> Result<(), MapError> {
        let mut state = self.state.lock();
        let region = state
            .regions
            .iter_mut()
            .find(|r| r.contains(addr, bytes.len() as u64))
            .ok_or(MapError::Unmapped { addr })?;
        if !region.effective_prot(addr, bytes.len() as u64).is_writable() {
            return Err(MapError::ProtectionViolation { addr });
        }
        let start = (addr - region.base) as usize;
        region.data[start..start + bytes.len()].copy_from_slice(bytes);
        state.events.push(ArenaEvent::Write {
            addr,
            len: bytes.len(),
        });
        Ok(())
    }
}

/// Synthetic binary-format store: identifier → layout.
pub struct ImageStore {
    images: Mutex<HashMap<String, ImageLayout>>,
}

impl ImageStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            images: Mutex::new(HashMap::new()),
        }
    }

    /// Add (or replace) an image.
    pub fn insert(&self, layout: ImageLayout) {
        self.images.lock().insert(layout.path.clone(), layout);
    }
}

impl Default for ImageStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageFormat for ImageStore {
    fn locate(&self, identifier: &str) -> Option<ImageLayout> {
        self.images.lock().get(identifier).cloned()
    }
}

/// Constant thread-identity source.
pub struct FixedThread(pub u64);

impl ThreadIdSource for FixedThread {
    fn current_thread(&self) -> ThreadToken {
        ThreadToken(self.0)
    }
}

/// Loader wired to a store and an arena with default thread identity and
/// compatibility policy.
pub fn test_loader(store: Arc<ImageStore>, mapper: Arc<ArenaMapper>) -> Loader {
    Loader::new(store, mapper, Arc::new(FixedThread(1)), Arc::new(AnyVersion))
}

/// Map a layout into an arena and copy its contents in, the way the Map
/// step would. Returns the assigned base.
pub fn map_image(mapper: &ArenaMapper, layout: &ImageLayout) -> u64 {
    let base = mapper
        .map(&layout.path, layout.total_size())
        .expect("arena map");
    mapper.write(base, &layout.contents).expect("arena write");
    base
}

/// Size of each conventional segment built by [`ImageBuilder`].
pub const SEGMENT_SIZE: u64 = 0x1000;

const TEXT_OFFSET: u64 = 0;
const DATA_OFFSET: u64 = SEGMENT_SIZE;
const CONST_OFFSET: u64 = 2 * SEGMENT_SIZE;

/// Builds a synthetic image with the conventional three-segment layout:
/// text (read-execute) at 0, data (read-write) at 0x1000, constant data
/// (read-only after fixups) at 0x2000. Fixup chains are encoded into the
/// contents exactly as the decoder expects them.
pub struct ImageBuilder {
    path: String,
    preferred_base: u64,
    dependencies: Vec<DependencyRef>,
    imports: Vec<String>,
    exports: Vec<Export>,
    initializers: Vec<InitRoutine>,
    capability: u32,
    data_slots: Vec<(u64, SlotKind)>,
    const_slots: Vec<(u64, SlotKind)>,
}

enum SlotKind {
    Rebase { target_offset: u64 },
    Bind { ordinal: u32, addend: i64 },
}

impl ImageBuilder {
    /// Start an image named `path`.
    pub fn new(path: &str) -> Self {
        Self {
            path: String::from(path),
            preferred_base: 0x10_0000,
            dependencies: Vec::new(),
            imports: Vec::new(),
            exports: Vec::new(),
            initializers: Vec::new(),
            capability: 0,
            data_slots: Vec::new(),
            const_slots: Vec::new(),
        }
    }

    /// Override the preferred base (default 0x100000).
    pub fn preferred_base(mut self, base: u64) -> Self {
        self.preferred_base = base;
        self
    }

    /// Declare a dependency with no capability requirement.
    pub fn dep(self, identifier: &str) -> Self {
        self.dep_versioned(identifier, 0)
    }

    /// Declare a dependency requiring a capability version.
    pub fn dep_versioned(mut self, identifier: &str, required: u32) -> Self {
        self.dependencies.push(DependencyRef {
            identifier: String::from(identifier),
            required_capability: required,
        });
        self
    }

    /// Export a symbol at an offset inside the text segment.
    pub fn export(mut self, name: &str, offset: u64) -> Self {
        self.exports.push(Export {
            name: String::from(name),
            offset: TEXT_OFFSET + offset,
        });
        self
    }

    /// Set the capability version this image provides.
    pub fn capability(mut self, version: u32) -> Self {
        self.capability = version;
        self
    }

    /// Add an initializer routine.
    pub fn initializer(
        mut self,
        routine: impl Fn(&Loader) -> Result<(), &'static str> + Send + Sync + 'static,
    ) -> Self {
        self.initializers.push(Arc::new(routine));
        self
    }

    /// Add a rebase slot in the data segment pointing at an image-relative
    /// offset.
    pub fn rebase(mut self, slot_offset: u64, target_offset: u64) -> Self {
        self.data_slots.push((slot_offset, SlotKind::Rebase { target_offset }));
        self
    }

    /// Add a bind slot in the data segment importing `symbol`.
    pub fn bind(mut self, slot_offset: u64, symbol: &str, addend: i64) -> Self {
        let ordinal = self.intern_import(symbol);
        self.data_slots
            .push((slot_offset, SlotKind::Bind { ordinal, addend }));
        self
    }

    /// Add a bind slot with a raw ordinal (malformed-chain fixtures).
    pub fn bind_ordinal(mut self, slot_offset: u64, ordinal: u32, addend: i64) -> Self {
        self.data_slots
            .push((slot_offset, SlotKind::Bind { ordinal, addend }));
        self
    }

    /// Add a rebase slot in the constant-data segment.
    pub fn const_rebase(mut self, slot_offset: u64, target_offset: u64) -> Self {
        self.const_slots
            .push((slot_offset, SlotKind::Rebase { target_offset }));
        self
    }

    fn intern_import(&mut self, symbol: &str) -> u32 {
        if let Some(index) = self.imports.iter().position(|s| s == symbol) {
            return index as u32;
        }
        self.imports.push(String::from(symbol));
        (self.imports.len() - 1) as u32
    }

    fn encode_segment(
        contents: &mut [u8],
        segment_offset: u64,
        preferred_base: u64,
        slots: &mut Vec<(u64, SlotKind)>,
    ) -> Option<u64> {
        if slots.is_empty() {
            return None;
        }
        slots.sort_by_key(|(offset, _)| *offset);

        for index in 0..slots.len() {
            let (offset, kind) = &slots[index];
            let next = if index + 1 == slots.len() {
                0
            } else {
                ((slots[index + 1].0 - offset) / SLOT_SIZE) as u16
            };
            let raw = match kind {
                SlotKind::Rebase { target_offset } => {
                    encode_rebase(preferred_base + target_offset, next)
                }
                SlotKind::Bind { ordinal, addend } => encode_bind(*ordinal, *addend, next),
            };
            let at = (segment_offset + offset) as usize;
            contents[at..at + 8].copy_from_slice(&raw.to_le_bytes());
        }
        Some(slots[0].0)
    }

    /// Produce the layout.
    pub fn build(mut self) -> ImageLayout {
        let total = 3 * SEGMENT_SIZE;
        let mut contents = vec![0u8; total as usize];

        let data_chain = Self::encode_segment(
            &mut contents,
            DATA_OFFSET,
            self.preferred_base,
            &mut self.data_slots,
        );
        let const_chain = Self::encode_segment(
            &mut contents,
            CONST_OFFSET,
            self.preferred_base,
            &mut self.const_slots,
        );

        let segments = vec![
            SegmentSpec {
                offset: TEXT_OFFSET,
                size: SEGMENT_SIZE,
                prot: Protection::RX,
                chain_start: None,
                read_only_data: false,
            },
            SegmentSpec {
                offset: DATA_OFFSET,
                size: SEGMENT_SIZE,
                prot: Protection::RW,
                chain_start: data_chain,
                read_only_data: false,
            },
            SegmentSpec {
                offset: CONST_OFFSET,
                size: SEGMENT_SIZE,
                prot: Protection::READ,
                chain_start: const_chain,
                read_only_data: true,
            },
        ];

        ImageLayout {
            path: self.path,
            preferred_base: self.preferred_base,
            contents,
            segments,
            dependencies: self.dependencies,
            imports: self.imports,
            exports: self.exports,
            initializers: self.initializers,
            capability: self.capability,
        }
    }

    /// Produce the layout and add it to a store.
    pub fn build_into(self, store: &ImageStore) {
        store.insert(self.build());
    }
}

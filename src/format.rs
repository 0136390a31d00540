//! Binary-Format Capability
//!
//! The loader does not parse on-disk formats. A host supplies an
//! [`ImageFormat`] that locates an image by identifier and hands back its
//! [`ImageLayout`]: segment table, fixup-chain starts, declared
//! dependencies, symbol tables, and initializers. The in-memory store in
//! [`crate::testing`] implements this for synthetic images.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::image::{DependencyRef, SegmentSpec};
use crate::loader::Loader;

/// An initializer routine of an image.
///
/// In a live process this is a jump to `base + offset`; the capability
/// carries it as a callable so the engine can run initializers (and let
/// them re-enter [`Loader::load`]) without executing mapped bytes.
pub type InitRoutine = Arc<dyn Fn(&Loader) -> Result<(), &'static str> + Send + Sync>;

/// An exported symbol: name and image-relative offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Export {
    /// Symbol name.
    pub name: String,
    /// Offset of the definition from the image start.
    pub offset: u64,
}

/// Everything the binary-format parser knows about one image.
#[derive(Clone)]
pub struct ImageLayout {
    /// Identifying path.
    pub path: String,
    /// Base address the image was linked for.
    pub preferred_base: u64,
    /// On-disk contents, copied into the mapping at map time. Its length is
    /// the image's mapped extent.
    pub contents: Vec<u8>,
    /// Segment table, offsets relative to the image start.
    pub segments: Vec<SegmentSpec>,
    /// Declared dependencies, in declaration order.
    pub dependencies: Vec<DependencyRef>,
    /// External-symbol-name table, indexed by bind ordinal.
    pub imports: Vec<String>,
    /// Exported symbols.
    pub exports: Vec<Export>,
    /// Initializer routines, in declaration order.
    pub initializers: Vec<InitRoutine>,
    /// Capability version the image provides.
    pub capability: u32,
}

impl ImageLayout {
    /// Total mapped extent in bytes.
    pub fn total_size(&self) -> u64 {
        self.contents.len() as u64
    }
}

impl core::fmt::Debug for ImageLayout {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ImageLayout")
            .field("path", &self.path)
            .field("preferred_base", &self.preferred_base)
            .field("total_size", &self.total_size())
            .field("segments", &self.segments.len())
            .field("dependencies", &self.dependencies.len())
            .field("initializers", &self.initializers.len())
            .finish()
    }
}

/// Binary-format parser capability.
pub trait ImageFormat: Send + Sync {
    /// Locate an image by dependency identifier.
    fn locate(&self, identifier: &str) -> Option<ImageLayout>;
}

/// Decides whether a located dependency satisfies its requester.
///
/// The rule itself is host policy; the engine only consults the predicate
/// and reports `IncompatibleDependency` when it says no.
pub trait CompatPolicy: Send + Sync {
    /// Check a requester's required capability against what the located
    /// image provides.
    fn compatible(&self, required: u32, provided: u32) -> bool;
}

/// Accept every located dependency (the default policy).
pub struct AnyVersion;

impl CompatPolicy for AnyVersion {
    fn compatible(&self, _required: u32, _provided: u32) -> bool {
        true
    }
}

/// Require the provided capability version to be at least the required one.
pub struct MinimumVersion;

impl CompatPolicy for MinimumVersion {
    fn compatible(&self, required: u32, provided: u32) -> bool {
        provided >= required
    }
}

//! Transactional dynamic-image loader core.
//!
//! This crate implements the process-startup loading engine:
//! - Chained pointer-fixup decoding (rebase/bind slot chains)
//! - Self-relocation bootstrap (the loader repairing its own pointers)
//! - Dependency resolution over a graph of shared images
//! - An all-or-nothing load transaction (Collect → Map → Rebase → Bind →
//!   Initialize → Commit, with full unwind on any failure)
//! - The process-wide image registry consumed by introspection
//!
//! The OS-facing primitives (binary-format parsing, memory mapping and
//! protection, thread identity) are consumed as trait capabilities, so the
//! whole engine runs unmodified against the in-memory implementations in
//! [`testing`].

#![no_std]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod bootstrap;
pub mod fixup;
pub mod format;
pub mod image;
pub mod loader;
pub mod mapping;
pub mod registry;
pub mod resolver;
pub mod sync;
pub mod testing;
pub mod transaction;

pub use format::{AnyVersion, CompatPolicy, ImageFormat, ImageLayout, MinimumVersion};
pub use image::{ImageRecord, LoadState, Protection};
pub use loader::{LoadFlags, LoadHandle, Loader};
pub use mapping::SegmentMapper;

use alloc::string::String;

/// Failure reasons surfaced by a load transaction.
///
/// Every variant except the bootstrap-time errors in
/// [`bootstrap::BootstrapError`] is recovered locally by the unwind path:
/// the caller sees the error, the registry and address space see nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    /// Corrupt or out-of-bounds pointer-chain data in an image.
    MalformedFixupChain {
        /// Image whose chain failed to decode.
        path: String,
        /// What the decoder rejected.
        reason: fixup::ChainFault,
    },
    /// A declared dependency could not be located at all.
    DependencyNotFound {
        /// Image that declared the dependency.
        requester: String,
        /// The identifier that could not be located.
        dependency: String,
    },
    /// A dependency was located but the compatibility policy rejected it.
    IncompatibleDependency {
        /// Image that declared the dependency.
        requester: String,
        /// The identifier that was rejected.
        dependency: String,
    },
    /// The dependency graph has no topological load order.
    CyclicDependency {
        /// Image on the cycle that closed it.
        path: String,
    },
    /// A bind ordinal named a symbol no dependency exports.
    UnresolvedSymbol {
        /// Image whose slot requested the symbol.
        path: String,
        /// Ordinal into the image's external-symbol-name table.
        ordinal: u32,
        /// Offset of the requesting slot within its segment.
        slot: u64,
    },
    /// The mapping primitive refused a request (address-space exhaustion).
    MappingFailure,
    /// An initializer routine reported failure.
    InitializerFailure {
        /// Image whose initializer failed.
        path: String,
        /// Reason the initializer gave.
        reason: &'static str,
    },
}

impl core::fmt::Display for LoadError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::MalformedFixupChain { path, reason } => {
                write!(f, "malformed fixup chain in {}: {}", path, reason)
            }
            Self::DependencyNotFound {
                requester,
                dependency,
            } => {
                write!(f, "{}: dependency {} not found", requester, dependency)
            }
            Self::IncompatibleDependency {
                requester,
                dependency,
            } => {
                write!(f, "{}: dependency {} is incompatible", requester, dependency)
            }
            Self::CyclicDependency { path } => {
                write!(f, "dependency cycle through {}", path)
            }
            Self::UnresolvedSymbol {
                path,
                ordinal,
                slot,
            } => {
                write!(
                    f,
                    "{}: unresolved symbol ordinal {} (slot {:#x})",
                    path, ordinal, slot
                )
            }
            Self::MappingFailure => write!(f, "mapping failure"),
            Self::InitializerFailure { path, reason } => {
                write!(f, "{}: initializer failed: {}", path, reason)
            }
        }
    }
}

//! Self-Relocation Bootstrap
//!
//! At process start the loader's own data segment is still in its on-disk
//! form: every pointer in it is a chain slot, not a pointer. Before the
//! loader may read any of its own global data it has to walk those chains
//! and rebase itself, using only the load address handed over by the
//! process-creation mechanism.
//!
//! Sequence, in order:
//!
//! 1. Compute the slide from the known load address and the preferred base
//!    in the loader's own header (a format-capability product).
//! 2. Rebase every writable, non-executable segment. The loader has no
//!    dependencies at this point, so a bind entry cannot be satisfied —
//!    encountering one is a fatal configuration error, not a resolvable
//!    condition.
//! 3. Re-protect constant-data segments to read-only, freezing the
//!    now-valid pointers.
//! 4. Only then may the syscall layer come up and the loader's globals be
//!    read; callers hold the returned [`SelfRelocation`] receipt as proof.
//!
//! Any failure here is unrecoverable: the process cannot trust its own
//! globals and must terminate.

use log::debug;

use crate::fixup::{self, ChainFault};
use crate::format::ImageLayout;
use crate::image::Protection;
use crate::mapping::SegmentMapper;

/// Unrecoverable bootstrap failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapError {
    /// The loader's own chain data is corrupt.
    MalformedFixupChain {
        /// What the decoder rejected.
        reason: ChainFault,
    },
    /// A bind entry in the loader's own image; nothing can resolve it this
    /// early.
    BindDuringBootstrap {
        /// Offset of the offending slot within its segment.
        slot: u64,
    },
    /// A read-only-data segment could not be re-protected.
    ProtectionFailure,
}

impl core::fmt::Display for BootstrapError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::MalformedFixupChain { reason } => {
                write!(f, "malformed fixup chain in loader image: {}", reason)
            }
            Self::BindDuringBootstrap { slot } => {
                write!(f, "bind entry at slot {:#x} during bootstrap", slot)
            }
            Self::ProtectionFailure => write!(f, "could not re-protect constant data"),
        }
    }
}

/// Receipt of a completed self-relocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelfRelocation {
    /// Slide that was applied (load address minus preferred base).
    pub slide: u64,
    /// Number of slots rebased.
    pub rebases_applied: usize,
}

/// Repair the loader's own pointers in place.
///
/// `layout` describes the loader's own image (its header is the one piece
/// of it that is valid without relocation); `load_address` is where the
/// kernel actually placed it.
pub fn relocate_self(
    layout: &ImageLayout,
    load_address: u64,
    mapper: &dyn SegmentMapper,
) -> Result<SelfRelocation, BootstrapError> {
    let slide = load_address.wrapping_sub(layout.preferred_base);
    let image_end = layout.preferred_base.wrapping_add(layout.total_size());
    let mut rebases_applied = 0;

    // Rebase every segment that is writable at this point. Constant-data
    // segments are still writable; they are frozen below.
    for segment in &layout.segments {
        let writable_now = segment.prot.is_writable() || segment.read_only_data;
        if !writable_now || segment.prot.is_executable() {
            continue;
        }
        let Some(chain_start) = segment.chain_start else {
            continue;
        };
        let segment_base = load_address.wrapping_add(segment.offset);

        let fixups = fixup::decode_chain(mapper, segment_base, segment.size, chain_start)
            .map_err(|reason| BootstrapError::MalformedFixupChain { reason })?;

        if let Some(bind) = fixups.iter().find(|fixup| fixup.is_bind()) {
            return Err(BootstrapError::BindDuringBootstrap {
                slot: bind.slot_offset,
            });
        }

        fixup::validate_rebase_targets(&fixups, layout.preferred_base, image_end)
            .map_err(|reason| BootstrapError::MalformedFixupChain { reason })?;
        rebases_applied += fixup::apply_rebases(mapper, segment_base, slide, &fixups)
            .map_err(|reason| BootstrapError::MalformedFixupChain { reason })?;
    }

    // All fixups are in; freeze constant data before anything reads it.
    for segment in &layout.segments {
        if segment.read_only_data {
            mapper
                .set_protection(
                    load_address.wrapping_add(segment.offset),
                    segment.size,
                    Protection::READ,
                )
                .map_err(|_| BootstrapError::ProtectionFailure)?;
        }
    }

    debug!(
        "[dylink] self-relocation complete: {} rebase(s), slide {:#x}",
        rebases_applied, slide
    );

    Ok(SelfRelocation {
        slide,
        rebases_applied,
    })
}

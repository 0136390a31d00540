//! Load Orchestrator
//!
//! Runs one load transaction as a state machine:
//!
//! 1. **Collect** — the resolver builds the dependency graph, mapping new
//!    images as it discovers them.
//! 2. **Map** — copy each new image's contents into its fresh mapping.
//! 3. **Rebase** — decode every segment chain into a validated descriptor
//!    list, then apply rebase-kind slots with the image's slide.
//! 4. **Bind** — in topological order, apply bind-kind slots against the
//!    graph's exported-symbol tables.
//! 5. **Protect** — drop non-writable segments to their final protection.
//! 6. **Initialize** — run initializers, strictly dependency-first.
//! 7. **Commit** — publish every new image to the registry in one append.
//!
//! Every mapping and reference-count increment is pushed onto an explicit
//! undo stack as it succeeds. On any failure the stack unwinds in reverse:
//! no further initializers run, every region the transaction mapped is
//! released, every reference it took is dropped, and the registry is left
//! byte-for-byte as it was. A caller observes full commit or a clean
//! failure, nothing in between.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use log::{debug, info};

use crate::fixup::{self, BindFailure, SlotFixup};
use crate::image::{ImageRecord, LoadState};
use crate::loader::Loader;
use crate::resolver::{self, Collected};
use crate::LoadError;

/// One recorded rollback step.
pub(crate) enum UndoAction {
    /// Release a region this transaction mapped.
    Unmap {
        /// Region base.
        base: u64,
        /// Region size.
        size: u64,
    },
    /// Drop a reference this transaction took on a dependency.
    Release {
        /// The referenced image.
        image: Arc<ImageRecord>,
    },
}

/// Run a transaction for `roots` and return the root records.
///
/// Caller must hold the load lock.
pub(crate) fn execute(
    loader: &Loader,
    roots: &[&str],
) -> Result<Vec<Arc<ImageRecord>>, LoadError> {
    let mut undo: Vec<UndoAction> = Vec::new();
    let mut created: Vec<Arc<ImageRecord>> = Vec::new();

    let result = run(loader, roots, &mut undo, &mut created);

    if let Err(error) = &result {
        debug!(
            "[dylink] transaction failed ({}), unwinding {} action(s)",
            error,
            undo.len()
        );
        unwind(loader, &mut undo, &created);
    }
    for record in &created {
        loader.remove_in_flight(record);
    }
    result
}

fn chain_error(record: &ImageRecord, fault: fixup::ChainFault) -> LoadError {
    LoadError::MalformedFixupChain {
        path: String::from(record.path()),
        reason: fault,
    }
}

fn run(
    loader: &Loader,
    roots: &[&str],
    undo: &mut Vec<UndoAction>,
    created: &mut Vec<Arc<ImageRecord>>,
) -> Result<Vec<Arc<ImageRecord>>, LoadError> {
    // Collect.
    let collected = resolver::collect(loader, roots, undo, created)?;

    if collected.new_nodes.is_empty() {
        // Every root was already resident; nothing to commit.
        return Ok(collected.roots);
    }

    // Map: the resolver reserved the regions; fill them.
    for node in &collected.new_nodes {
        loader
            .mapper()
            .write(node.record.base(), &node.layout.contents)
            .map_err(|_| LoadError::MappingFailure)?;
    }

    // Rebase: decode and validate every chain before its first write.
    let decoded = rebase_all(loader, &collected)?;

    // Bind, topological order.
    bind_all(loader, &collected, &decoded)?;

    // Final protections for segments that must not stay writable.
    for node in &collected.new_nodes {
        let record = &node.record;
        for segment in record.segments() {
            if !segment.prot.is_writable() {
                loader
                    .mapper()
                    .set_protection(record.segment_base(segment), segment.size, segment.prot)
                    .map_err(|_| LoadError::MappingFailure)?;
            }
        }
    }

    // Initialize, strictly dependency-first. A failure here (including a
    // failed nested load) fails the whole transaction.
    for node in &collected.new_nodes {
        let record = &node.record;
        for routine in record.initializers() {
            routine(loader).map_err(|reason| LoadError::InitializerFailure {
                path: String::from(record.path()),
                reason,
            })?;
        }
        record.set_state(LoadState::Initialized);
        debug!("[dylink] initialized {}", record.path());
    }

    // Commit: one atomic append, dependency-first.
    let committed: Vec<Arc<ImageRecord>> = collected
        .new_nodes
        .iter()
        .map(|node| Arc::clone(&node.record))
        .collect();
    loader.registry().commit(&committed);
    info!(
        "[dylink] committed {} image(s), {} resident",
        committed.len(),
        loader.registry().count()
    );

    Ok(collected.roots)
}

/// Decode, validate, and apply rebase fixups for every new node.
///
/// Returns the validated descriptor lists, per node and segment, for the
/// bind pass.
#[allow(clippy::type_complexity)]
fn rebase_all(
    loader: &Loader,
    collected: &Collected,
) -> Result<Vec<Vec<(usize, Vec<SlotFixup>)>>, LoadError> {
    let mut decoded = Vec::new();

    for node in &collected.new_nodes {
        let record = &node.record;
        let preferred_base = record.base().wrapping_sub(record.slide());
        let mut per_segment = Vec::new();

        for (index, segment) in record.segments().iter().enumerate() {
            let Some(chain_start) = segment.chain_start else {
                continue;
            };
            let segment_base = record.segment_base(segment);

            let fixups = fixup::decode_chain(loader.mapper(), segment_base, segment.size, chain_start)
                .map_err(|fault| chain_error(record, fault))?;
            fixup::validate_rebase_targets(
                &fixups,
                preferred_base,
                preferred_base.wrapping_add(record.total_size()),
            )
            .map_err(|fault| chain_error(record, fault))?;
            fixup::validate_ordinals(&fixups, record.imports().len())
                .map_err(|fault| chain_error(record, fault))?;

            fixup::apply_rebases(loader.mapper(), segment_base, record.slide(), &fixups)
                .map_err(|fault| chain_error(record, fault))?;
            per_segment.push((index, fixups));
        }

        record.set_state(LoadState::Rebased);
        decoded.push(per_segment);
    }

    Ok(decoded)
}

/// Apply bind fixups in topological order against the graph's exports.
fn bind_all(
    loader: &Loader,
    collected: &Collected,
    decoded: &[Vec<(usize, Vec<SlotFixup>)>],
) -> Result<(), LoadError> {
    for (node, segments) in collected.new_nodes.iter().zip(decoded.iter()) {
        let record = &node.record;

        for (index, fixups) in segments {
            let segment = &record.segments()[*index];
            let segment_base = record.segment_base(segment);

            let mut resolve = |ordinal: u32| -> Option<u64> {
                let name = record.imports().get(ordinal as usize)?;
                lookup_export(&collected.graph_topo, name)
            };

            fixup::apply_binds(loader.mapper(), segment_base, fixups, &mut resolve).map_err(
                |failure| match failure {
                    BindFailure::Unresolved { ordinal, slot } => LoadError::UnresolvedSymbol {
                        path: String::from(record.path()),
                        ordinal,
                        slot,
                    },
                    BindFailure::Unwritable { .. } => LoadError::MappingFailure,
                },
            )?;
        }

        record.set_state(LoadState::Bound);
    }
    Ok(())
}

/// First definition of `name` in dependency-first graph order.
fn lookup_export(graph_topo: &[Arc<ImageRecord>], name: &str) -> Option<u64> {
    graph_topo
        .iter()
        .find_map(|image| image.export_address(name))
}

/// Roll back everything the transaction introduced, in reverse order.
fn unwind(loader: &Loader, undo: &mut Vec<UndoAction>, created: &[Arc<ImageRecord>]) {
    for record in created {
        record.set_state(LoadState::Unwound);
    }
    while let Some(action) = undo.pop() {
        match action {
            UndoAction::Unmap { base, size } => loader.mapper().unmap(base, size),
            UndoAction::Release { image } => {
                image.release();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::LoadFlags;
    use crate::mapping::SegmentMapper;
    use crate::testing::{test_loader, ArenaMapper, ImageBuilder, ImageStore, SEGMENT_SIZE};

    #[test]
    fn test_commit_resolves_rebases_and_binds() {
        let store = Arc::new(ImageStore::new());
        ImageBuilder::new("app")
            .dep("libdep.so")
            .rebase(0x10, 0x20)
            .bind(0x18, "dep_entry", 8)
            .build_into(&store);
        ImageBuilder::new("libdep.so")
            .export("dep_entry", 0x100)
            .build_into(&store);

        let mapper = Arc::new(ArenaMapper::new());
        let loader = test_loader(store, Arc::clone(&mapper));
        let handle = loader.load("app", LoadFlags::NOW).unwrap();

        let app_base = handle.base();
        let dep = loader.registry().find("libdep.so").unwrap();
        assert_eq!(dep.state(), LoadState::Registered);

        // Rebase: slot holds target + slide, i.e. the resident address.
        let data = app_base + SEGMENT_SIZE;
        assert_eq!(mapper.read_u64(data + 0x10).unwrap(), app_base + 0x20);
        // Bind: slot holds the dependency's export plus the addend.
        assert_eq!(
            mapper.read_u64(data + 0x18).unwrap(),
            dep.base() + 0x100 + 8
        );
    }

    #[test]
    fn test_unresolved_bind_unwinds_whole_graph() {
        let store = Arc::new(ImageStore::new());
        ImageBuilder::new("a.so").dep("b.so").build_into(&store);
        ImageBuilder::new("b.so")
            .dep("c.so")
            .bind(0x10, "provided", 0)
            .build_into(&store);
        // c.so never exports the symbol b.so binds against.
        ImageBuilder::new("c.so").build_into(&store);

        let mapper = Arc::new(ArenaMapper::new());
        let loader = test_loader(store, Arc::clone(&mapper));
        let err = loader.load("a.so", LoadFlags::NOW).unwrap_err();

        assert!(matches!(err, LoadError::UnresolvedSymbol { ref path, .. } if path == "b.so"));
        assert_eq!(loader.image_count(), 0);
        assert!(mapper.resident().is_empty());
    }

    #[test]
    fn test_mapping_exhaustion_unwinds() {
        let store = Arc::new(ImageStore::new());
        ImageBuilder::new("a.so").dep("b.so").build_into(&store);
        ImageBuilder::new("b.so").dep("c.so").build_into(&store);
        ImageBuilder::new("c.so").build_into(&store);

        let mapper = Arc::new(ArenaMapper::new());
        mapper.fail_after_maps(2);
        let loader = test_loader(store, Arc::clone(&mapper));

        let err = loader.load("a.so", LoadFlags::NOW).unwrap_err();
        assert_eq!(err, LoadError::MappingFailure);
        assert_eq!(loader.image_count(), 0);
        assert!(mapper.resident().is_empty());
    }

    #[test]
    fn test_malformed_chain_unwinds() {
        let store = Arc::new(ImageStore::new());
        // Ordinal 9 has no import-table entry behind it.
        ImageBuilder::new("bad.so")
            .bind_ordinal(0x10, 9, 0)
            .build_into(&store);

        let mapper = Arc::new(ArenaMapper::new());
        let loader = test_loader(store, Arc::clone(&mapper));
        let err = loader.load("bad.so", LoadFlags::NOW).unwrap_err();

        assert!(matches!(err, LoadError::MalformedFixupChain { ref path, .. } if path == "bad.so"));
        assert!(mapper.resident().is_empty());
    }

    #[test]
    fn test_failed_initializer_unwinds() {
        let store = Arc::new(ImageStore::new());
        ImageBuilder::new("a.so").dep("b.so").build_into(&store);
        ImageBuilder::new("b.so")
            .initializer(|_| Err("refused"))
            .build_into(&store);

        let mapper = Arc::new(ArenaMapper::new());
        let loader = test_loader(store, Arc::clone(&mapper));
        let err = loader.load("a.so", LoadFlags::NOW).unwrap_err();

        assert_eq!(
            err,
            LoadError::InitializerFailure {
                path: String::from("b.so"),
                reason: "refused"
            }
        );
        assert_eq!(loader.image_count(), 0);
        assert!(mapper.resident().is_empty());
    }

    #[test]
    fn test_const_segment_read_only_after_commit() {
        let store = Arc::new(ImageStore::new());
        ImageBuilder::new("app")
            .const_rebase(0x8, 0x40)
            .build_into(&store);

        let mapper = Arc::new(ArenaMapper::new());
        let loader = test_loader(store, Arc::clone(&mapper));
        let handle = loader.load("app", LoadFlags::NOW).unwrap();

        let const_base = handle.base() + 2 * SEGMENT_SIZE;
        // The fixup landed before the segment went read-only.
        assert_eq!(mapper.read_u64(const_base + 0x8).unwrap(), handle.base() + 0x40);
        assert!(!mapper.is_writable(const_base + 0x8, 8));
    }
}

//! Dependency Resolver
//!
//! Builds the dependency graph for one transaction. For each declared
//! dependency identifier the resolver first reuses an image that is already
//! registered (or in flight in an enclosing transaction); otherwise it
//! locates the image through the format capability, maps it, and recurses
//! into *its* dependencies before returning — an image's dependency list is
//! only readable once its header is resident.
//!
//! The resolver produces a topological (dependency-first) order over the
//! newly introduced images, plus the full graph in the same order as the
//! symbol search scope for binding. Every mapping and reference-count
//! increment is recorded on the transaction's undo stack as it happens, so
//! a failure at any depth rolls back exactly what was introduced.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use hashbrown::HashMap;
use log::debug;

use crate::format::ImageLayout;
use crate::image::ImageRecord;
use crate::loader::Loader;
use crate::transaction::UndoAction;
use crate::LoadError;

/// A newly introduced graph node: its record plus the layout the Map step
/// still needs (contents to copy in).
pub(crate) struct NewNode {
    pub record: Arc<ImageRecord>,
    pub layout: ImageLayout,
}

/// Result of graph construction.
pub(crate) struct Collected {
    /// Newly introduced images, dependency-first.
    pub new_nodes: Vec<NewNode>,
    /// All graph nodes (new and reused), dependency-first. Bind resolution
    /// searches exports in this order.
    pub graph_topo: Vec<Arc<ImageRecord>>,
    /// Root records, in the order requested.
    pub roots: Vec<Arc<ImageRecord>>,
}

impl core::fmt::Debug for Collected {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Collected")
            .field("new_nodes", &self.new_nodes.len())
            .field("graph_topo", &self.graph_topo.len())
            .field("roots", &self.roots.len())
            .finish()
    }
}

enum Visit {
    Visiting,
    Done(Arc<ImageRecord>),
}

/// Build the graph for `roots`, merging and deduplicating shared nodes.
///
/// Every record the resolver creates is also pushed onto `created` (in
/// discovery order) so the transaction can retire its in-flight entries
/// whether or not graph construction completes.
pub(crate) fn collect(
    loader: &Loader,
    roots: &[&str],
    undo: &mut Vec<UndoAction>,
    created: &mut Vec<Arc<ImageRecord>>,
) -> Result<Collected, LoadError> {
    let mut visited: HashMap<String, Visit> = HashMap::new();
    let mut collected = Collected {
        new_nodes: Vec::new(),
        graph_topo: Vec::new(),
        roots: Vec::new(),
    };

    for identifier in roots {
        let record = visit(
            loader,
            identifier,
            identifier,
            0,
            &mut visited,
            &mut collected,
            undo,
            created,
        )?;
        collected.roots.push(record);
    }

    Ok(collected)
}

fn check_compat(
    loader: &Loader,
    required: u32,
    provided: u32,
    requester: &str,
    dependency: &str,
) -> Result<(), LoadError> {
    if loader.compat().compatible(required, provided) {
        Ok(())
    } else {
        Err(LoadError::IncompatibleDependency {
            requester: String::from(requester),
            dependency: String::from(dependency),
        })
    }
}

#[allow(clippy::too_many_arguments)]
fn visit(
    loader: &Loader,
    identifier: &str,
    requester: &str,
    required_capability: u32,
    visited: &mut HashMap<String, Visit>,
    collected: &mut Collected,
    undo: &mut Vec<UndoAction>,
    created: &mut Vec<Arc<ImageRecord>>,
) -> Result<Arc<ImageRecord>, LoadError> {
    match visited.get(identifier) {
        Some(Visit::Visiting) => {
            return Err(LoadError::CyclicDependency {
                path: String::from(identifier),
            });
        }
        Some(Visit::Done(record)) => {
            let record = Arc::clone(record);
            check_compat(
                loader,
                required_capability,
                record.capability(),
                requester,
                identifier,
            )?;
            return Ok(record);
        }
        None => {}
    }

    // Reuse before mapping: the registry first, then images an enclosing
    // transaction has in flight.
    let existing = loader
        .registry()
        .find(identifier)
        .or_else(|| loader.find_in_flight(identifier));
    if let Some(record) = existing {
        check_compat(
            loader,
            required_capability,
            record.capability(),
            requester,
            identifier,
        )?;
        visited.insert(String::from(identifier), Visit::Done(Arc::clone(&record)));
        collected.graph_topo.push(Arc::clone(&record));
        return Ok(record);
    }

    let layout = loader.format().locate(identifier).ok_or_else(|| {
        LoadError::DependencyNotFound {
            requester: String::from(requester),
            dependency: String::from(identifier),
        }
    })?;
    check_compat(
        loader,
        required_capability,
        layout.capability,
        requester,
        identifier,
    )?;

    let total_size = layout.total_size();
    let base = loader
        .mapper()
        .map(&layout.path, total_size)
        .map_err(|_| LoadError::MappingFailure)?;
    undo.push(UndoAction::Unmap {
        base,
        size: total_size,
    });

    let slide = base.wrapping_sub(layout.preferred_base);
    let mut exports = HashMap::new();
    for export in &layout.exports {
        exports.insert(export.name.clone(), export.offset);
    }
    let record = Arc::new(ImageRecord::new(
        layout.path.clone(),
        base,
        slide,
        total_size,
        layout.segments.clone(),
        layout.dependencies.clone(),
        layout.imports.clone(),
        exports,
        layout.initializers.clone(),
        layout.capability,
    ));
    loader.push_in_flight(Arc::clone(&record));
    created.push(Arc::clone(&record));
    visited.insert(String::from(identifier), Visit::Visiting);

    debug!(
        "[dylink] mapped {} at {:#x} (slide {:#x})",
        record.path(),
        base,
        slide
    );

    let mut children = Vec::new();
    for dep in &layout.dependencies {
        let child = visit(
            loader,
            &dep.identifier,
            identifier,
            dep.required_capability,
            visited,
            collected,
            undo,
            created,
        )?;
        child.retain();
        undo.push(UndoAction::Release {
            image: Arc::clone(&child),
        });
        children.push(child);
    }
    record.set_dependencies(children);

    visited.insert(String::from(identifier), Visit::Done(Arc::clone(&record)));
    collected.new_nodes.push(NewNode {
        record: Arc::clone(&record),
        layout,
    });
    collected.graph_topo.push(Arc::clone(&record));
    Ok(record)
}

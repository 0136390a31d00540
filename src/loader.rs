//! Loader Facade
//!
//! The on-demand entry points over the transactional engine: `load` and
//! `unload`, the introspection surface, and symbol lookup on a handle.
//! All collaborator capabilities are injected here and shared by every
//! transaction the loader runs.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use bitflags::bitflags;
use log::debug;
use spin::Mutex;

use crate::format::{CompatPolicy, ImageFormat};
use crate::image::{ImageRecord, LoadState};
use crate::mapping::SegmentMapper;
use crate::registry::ImageRegistry;
use crate::sync::{ReentrantLock, ThreadIdSource};
use crate::transaction;
use crate::LoadError;

bitflags! {
    /// Options for [`Loader::load`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LoadFlags: u32 {
        /// Resolve every binding before returning. The engine always runs
        /// the full eager pipeline; the flag states the caller's contract.
        const NOW = 1;
    }
}

/// Owned reference to a loaded image.
///
/// The handle holds a reference count on the root image; pass it back to
/// [`Loader::unload`] to drop the reference. Dropping the handle without
/// unloading leaves the image resident.
pub struct LoadHandle {
    image: Arc<ImageRecord>,
}

impl core::fmt::Debug for LoadHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LoadHandle")
            .field("path", &self.path())
            .field("base", &self.base())
            .finish()
    }
}

impl LoadHandle {
    /// Identifying path of the image.
    pub fn path(&self) -> &str {
        self.image.path()
    }

    /// Load address of the image.
    pub fn base(&self) -> u64 {
        self.image.base()
    }

    pub(crate) fn record(&self) -> &Arc<ImageRecord> {
        &self.image
    }
}

/// The process's dynamic loader.
pub struct Loader {
    format: Arc<dyn ImageFormat>,
    mapper: Arc<dyn SegmentMapper>,
    threads: Arc<dyn ThreadIdSource>,
    compat: Arc<dyn CompatPolicy>,
    registry: ImageRegistry,
    load_lock: ReentrantLock,
    /// Images owned by transactions currently on the stack, visible to
    /// nested transactions for reuse.
    in_flight: Mutex<Vec<Arc<ImageRecord>>>,
}

impl Loader {
    /// Create a loader over the host's capabilities.
    pub fn new(
        format: Arc<dyn ImageFormat>,
        mapper: Arc<dyn SegmentMapper>,
        threads: Arc<dyn ThreadIdSource>,
        compat: Arc<dyn CompatPolicy>,
    ) -> Self {
        Self {
            format,
            mapper,
            threads,
            compat,
            registry: ImageRegistry::new(),
            load_lock: ReentrantLock::new(),
            in_flight: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn format(&self) -> &dyn ImageFormat {
        &*self.format
    }

    pub(crate) fn mapper(&self) -> &dyn SegmentMapper {
        &*self.mapper
    }

    pub(crate) fn compat(&self) -> &dyn CompatPolicy {
        &*self.compat
    }

    pub(crate) fn registry(&self) -> &ImageRegistry {
        &self.registry
    }

    pub(crate) fn find_in_flight(&self, path: &str) -> Option<Arc<ImageRecord>> {
        self.in_flight
            .lock()
            .iter()
            .find(|record| record.path() == path)
            .cloned()
    }

    pub(crate) fn push_in_flight(&self, record: Arc<ImageRecord>) {
        self.in_flight.lock().push(record);
    }

    pub(crate) fn remove_in_flight(&self, record: &Arc<ImageRecord>) {
        self.in_flight
            .lock()
            .retain(|entry| !Arc::ptr_eq(entry, record));
    }

    /// Load an image and everything it transitively depends on.
    ///
    /// Runs the whole Collect→Commit pipeline synchronously under the load
    /// lock. On failure nothing is registered and nothing stays mapped; the
    /// call may be re-issued. Loading an already-resident image returns a
    /// new handle against the same mapping.
    pub fn load(&self, identifier: &str, flags: LoadFlags) -> Result<LoadHandle, LoadError> {
        let token = self.threads.current_thread();
        let _guard = self.load_lock.acquire(token);
        debug!(
            "[dylink] load {} (flags {:?}, depth {})",
            identifier,
            flags,
            self.load_lock.depth()
        );

        let existing = self
            .registry
            .find(identifier)
            .or_else(|| self.find_in_flight(identifier));
        if let Some(image) = existing {
            image.retain();
            return Ok(LoadHandle { image });
        }

        let mut roots = transaction::execute(self, &[identifier])?;
        let image = match roots.pop() {
            Some(image) => image,
            None => {
                return Err(LoadError::DependencyNotFound {
                    requester: String::from(identifier),
                    dependency: String::from(identifier),
                })
            }
        };
        image.retain();
        Ok(LoadHandle { image })
    }

    /// Drop a handle's reference.
    ///
    /// An image is unmapped and leaves the registry only when its last
    /// reference (handle or dependent image) goes away; its dependencies
    /// are then released in turn.
    pub fn unload(&self, handle: LoadHandle) {
        let token = self.threads.current_thread();
        let _guard = self.load_lock.acquire(token);
        self.release_tree(handle.image);
    }

    fn release_tree(&self, image: Arc<ImageRecord>) {
        if image.release() > 0 {
            return;
        }
        debug!("[dylink] unloading {}", image.path());
        let _ = self.registry.remove(image.path());
        self.mapper.unmap(image.base(), image.total_size());
        image.set_state(LoadState::Unwound);
        for dependency in image.dependencies() {
            self.release_tree(dependency);
        }
    }

    /// Number of committed images.
    ///
    /// Reads the registry without taking the load lock; reflects only
    /// committed transactions.
    pub fn image_count(&self) -> usize {
        self.registry.count()
    }

    /// Path of the committed image at `index`.
    pub fn image_name_at(&self, index: usize) -> Option<String> {
        self.registry.name_at(index)
    }

    /// Address of a symbol exported by the handle's image.
    pub fn symbol_address(&self, handle: &LoadHandle, name: &str) -> Option<u64> {
        handle.record().export_address(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_loader, ArenaMapper, ImageBuilder, ImageStore};

    fn harness() -> (Arc<ImageStore>, Arc<ArenaMapper>, Loader) {
        let store = Arc::new(ImageStore::new());
        let mapper = Arc::new(ArenaMapper::new());
        let loader = test_loader(Arc::clone(&store), Arc::clone(&mapper));
        (store, mapper, loader)
    }

    #[test]
    fn test_repeat_load_reuses_mapping() {
        let (store, mapper, loader) = harness();
        ImageBuilder::new("libshared.so").build_into(&store);

        let first = loader.load("libshared.so", LoadFlags::NOW).unwrap();
        let second = loader.load("libshared.so", LoadFlags::NOW).unwrap();

        assert_eq!(mapper.map_calls("libshared.so"), 1);
        assert_eq!(loader.image_count(), 1);
        assert_eq!(first.record().ref_count(), 2);

        loader.unload(first);
        assert_eq!(loader.image_count(), 1);
        loader.unload(second);
        assert_eq!(loader.image_count(), 0);
        assert!(mapper.resident().is_empty());
    }

    #[test]
    fn test_dependency_reuse_and_cascaded_unload() {
        let (store, mapper, loader) = harness();
        ImageBuilder::new("libbase.so").build_into(&store);
        ImageBuilder::new("app").dep("libbase.so").build_into(&store);

        let base_handle = loader.load("libbase.so", LoadFlags::NOW).unwrap();
        let app_handle = loader.load("app", LoadFlags::NOW).unwrap();

        // The dependency was satisfied from the registry, not remapped.
        assert_eq!(mapper.map_calls("libbase.so"), 1);
        assert_eq!(loader.image_count(), 2);

        // libbase keeps the explicit handle's reference after app goes away.
        loader.unload(app_handle);
        assert_eq!(loader.image_count(), 1);
        assert_eq!(loader.image_name_at(0).as_deref(), Some("libbase.so"));

        loader.unload(base_handle);
        assert_eq!(loader.image_count(), 0);
        assert!(mapper.resident().is_empty());
    }

    #[test]
    fn test_introspection_reflects_topo_commit_order() {
        let (store, _mapper, loader) = harness();
        ImageBuilder::new("app").dep("libdep.so").build_into(&store);
        ImageBuilder::new("libdep.so").build_into(&store);

        loader.load("app", LoadFlags::NOW).unwrap();
        assert_eq!(loader.image_count(), 2);
        assert_eq!(loader.image_name_at(0).as_deref(), Some("libdep.so"));
        assert_eq!(loader.image_name_at(1).as_deref(), Some("app"));
        assert_eq!(loader.image_name_at(2), None);
    }

    #[test]
    fn test_symbol_address_resolves_export() {
        let (store, _mapper, loader) = harness();
        ImageBuilder::new("libm.so").export("square", 0x2A0).build_into(&store);

        let handle = loader.load("libm.so", LoadFlags::NOW).unwrap();
        assert_eq!(
            loader.symbol_address(&handle, "square"),
            Some(handle.base() + 0x2A0)
        );
        assert_eq!(loader.symbol_address(&handle, "cube"), None);
    }

    #[test]
    fn test_initializer_nested_load_commits_both() {
        let (store, _mapper, loader) = harness();
        ImageBuilder::new("side.so").build_into(&store);
        ImageBuilder::new("app")
            .initializer(|loader| {
                loader
                    .load("side.so", LoadFlags::NOW)
                    .map(|_| ())
                    .map_err(|_| "nested load failed")
            })
            .build_into(&store);

        loader.load("app", LoadFlags::NOW).unwrap();
        assert_eq!(loader.image_count(), 2);
        assert_eq!(loader.image_name_at(0).as_deref(), Some("side.so"));
        assert_eq!(loader.image_name_at(1).as_deref(), Some("app"));
    }

    #[test]
    fn test_reissue_after_collect_failure_maps_fresh() {
        let (store, mapper, loader) = harness();
        ImageBuilder::new("app").dep("late.so").build_into(&store);

        // First attempt fails while the graph is still being collected;
        // nothing may linger that a retry could pick up.
        let err = loader.load("app", LoadFlags::NOW).unwrap_err();
        assert!(matches!(err, LoadError::DependencyNotFound { .. }));
        assert!(mapper.resident().is_empty());

        ImageBuilder::new("late.so").build_into(&store);
        let handle = loader.load("app", LoadFlags::NOW).unwrap();
        assert_eq!(handle.path(), "app");
        assert_eq!(loader.image_count(), 2);
    }

    #[test]
    fn test_failed_nested_load_unwinds_outer() {
        let (store, mapper, loader) = harness();
        ImageBuilder::new("app")
            .initializer(|loader| {
                loader
                    .load("missing.so", LoadFlags::NOW)
                    .map(|_| ())
                    .map_err(|_| "nested load failed")
            })
            .build_into(&store);

        let err = loader.load("app", LoadFlags::NOW).unwrap_err();
        assert_eq!(
            err,
            LoadError::InitializerFailure {
                path: String::from("app"),
                reason: "nested load failed"
            }
        );
        assert_eq!(loader.image_count(), 0);
        assert!(mapper.resident().is_empty());
    }
}

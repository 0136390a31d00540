//! Process Image Registry
//!
//! The single, process-wide list of currently loaded images, consumed by
//! the introspection surface. The registry is appended to only by committed
//! transactions: a commit takes the write lock once and publishes every new
//! image of the transaction in topological order, so a concurrent reader
//! observes either the pre-commit or the post-commit list, never a partial
//! one. Readers never take the load lock.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::RwLock;

use crate::image::{ImageRecord, LoadState};

/// Registry of committed images.
pub struct ImageRegistry {
    images: RwLock<Vec<Arc<ImageRecord>>>,
}

impl ImageRegistry {
    /// Create an empty registry.
    pub const fn new() -> Self {
        Self {
            images: RwLock::new(Vec::new()),
        }
    }

    /// Number of committed images.
    pub fn count(&self) -> usize {
        self.images.read().len()
    }

    /// Path of the image at `index`, if any.
    pub fn name_at(&self, index: usize) -> Option<String> {
        self.images
            .read()
            .get(index)
            .map(|image| String::from(image.path()))
    }

    /// A committed image by identifying path.
    pub fn find(&self, path: &str) -> Option<Arc<ImageRecord>> {
        self.images
            .read()
            .iter()
            .find(|image| image.path() == path)
            .cloned()
    }

    /// Snapshot of the committed list.
    ///
    /// The clone is of `Arc`s; callers iterate without holding the lock.
    pub fn snapshot(&self) -> Vec<Arc<ImageRecord>> {
        self.images.read().clone()
    }

    /// Publish a committed transaction's images, in the order given.
    ///
    /// Performed under a single write guard: atomic with respect to the
    /// introspection surface.
    pub fn commit(&self, new_images: &[Arc<ImageRecord>]) {
        let mut guard = self.images.write();
        for image in new_images {
            image.set_state(LoadState::Registered);
            guard.push(Arc::clone(image));
        }
    }

    /// Remove an image whose reference count reached zero.
    pub fn remove(&self, path: &str) -> Option<Arc<ImageRecord>> {
        let mut guard = self.images.write();
        let index = guard.iter().position(|image| image.path() == path)?;
        Some(guard.remove(index))
    }
}

impl Default for ImageRegistry {
    fn default() -> Self {
        Self::new()
    }
}

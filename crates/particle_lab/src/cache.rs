//! Extent-keyed resource cache
//!
//! Holds one resource sized to the last requested extent. A request with a
//! different extent drops the old resource and builds a new one; a request
//! with the same extent returns the cached one. The allocation counter makes
//! the reallocation policy observable in tests.

use crate::target::Extent;

pub struct TextureCache<T> {
    entry: Option<(Extent, T)>,
    allocations: u32,
}

impl<T> Default for TextureCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TextureCache<T> {
    pub fn new() -> Self {
        Self {
            entry: None,
            allocations: 0,
        }
    }

    /// Get the resource for `extent`, building it with `create` on a miss
    pub fn get_or_create<F>(&mut self, extent: Extent, create: F) -> &T
    where
        F: FnOnce(Extent) -> T,
    {
        let stale = !matches!(&self.entry, Some((cached, _)) if *cached == extent);
        if stale {
            if let Some((old, _)) = &self.entry {
                tracing::debug!(
                    "Extent changed {}x{} -> {}x{}, reallocating",
                    old.width,
                    old.height,
                    extent.width,
                    extent.height
                );
            }
            self.entry = None;
        }
        let allocations = &mut self.allocations;
        let (_, resource) = self.entry.get_or_insert_with(|| {
            *allocations += 1;
            (extent, create(extent))
        });
        resource
    }

    /// The cached resource, if any
    pub fn get(&self) -> Option<&T> {
        self.entry.as_ref().map(|(_, resource)| resource)
    }

    pub fn extent(&self) -> Option<Extent> {
        self.entry.as_ref().map(|(extent, _)| *extent)
    }

    /// Number of times a resource was built
    pub fn allocations(&self) -> u32 {
        self.allocations
    }

    /// Drop the cached resource; the next request always allocates
    pub fn invalidate(&mut self) {
        self.entry = None;
    }
}

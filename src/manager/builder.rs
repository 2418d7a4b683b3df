//! # Store Builder
//!
//! `StoreBuilder` assembles a [`DataManager`]: it sizes the chunk space,
//! attaches the content delivery driver for eviction write-back, and picks the
//! pin manager.
//!
//! ## Configuration Options
//!
//! | Option       | Default                | Description                              |
//! |--------------|------------------------|------------------------------------------|
//! | driver       | `MemoryDriver`         | Backing store for payloads and counters  |
//! | cache_size   | `DEFAULT_CACHE_SIZE`   | Number of chunk slots                    |
//! | pinning      | true                   | Counting manager, or no-op when false    |
//!
//! ## Usage
//!
//! ```ignore
//! let manager = StoreBuilder::new()
//!     .driver(driver)
//!     .cache_size(10_000)
//!     .build()?;
//! manager.connect(Box::new(|result| result.expect("connect")));
//! ```

use std::sync::Arc;

use eyre::{Result, WrapErr};
use tracing::debug;

use super::DataManager;
use crate::config::DEFAULT_CACHE_SIZE;
use crate::driver::{ContentDeliveryDriver, MemoryDriver};
use crate::space::{ChunkSpace, ChunkSpaceManager, CountingSpaceManager, NoopSpaceManager};

/// Builder for a [`DataManager`] and its chunk space.
pub struct StoreBuilder {
    driver: Option<Arc<dyn ContentDeliveryDriver>>,
    cache_size: Option<usize>,
    pinning: Option<bool>,
}

impl Default for StoreBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreBuilder {
    pub fn new() -> Self {
        Self {
            driver: None,
            cache_size: None,
            pinning: None,
        }
    }

    /// Sets the content delivery driver. Defaults to an in-memory driver.
    pub fn driver(mut self, driver: Arc<dyn ContentDeliveryDriver>) -> Self {
        self.driver = Some(driver);
        self
    }

    /// Sets the number of chunk slots in the cache.
    pub fn cache_size(mut self, slots: usize) -> Self {
        self.cache_size = Some(slots);
        self
    }

    /// Enables or disables pin counting.
    ///
    /// Without pinning, chunks leave the cache only through eviction and
    /// `save` no longer releases the chunks it wrote.
    pub fn pinning(mut self, enabled: bool) -> Self {
        self.pinning = Some(enabled);
        self
    }

    pub fn build(self) -> Result<Arc<DataManager>> {
        let cache_size = self.cache_size.unwrap_or(DEFAULT_CACHE_SIZE);
        let pinning = self.pinning.unwrap_or(true);
        let driver: Arc<dyn ContentDeliveryDriver> = match self.driver {
            Some(driver) => driver,
            None => Arc::new(MemoryDriver::new()),
        };

        let space = ChunkSpace::new(cache_size)
            .wrap_err_with(|| format!("failed to create chunk space of {} slots", cache_size))?;
        space.set_driver(Arc::clone(&driver));

        let space_manager: Arc<dyn ChunkSpaceManager> = if pinning {
            Arc::new(CountingSpaceManager::new(space))
        } else {
            Arc::new(NoopSpaceManager::new(space))
        };
        debug!(cache_size, pinning, "building data manager");
        Ok(DataManager::new(space_manager, driver))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_memory_driver_and_default_size() {
        let manager = StoreBuilder::new().build().unwrap();
        assert_eq!(manager.space().capacity(), DEFAULT_CACHE_SIZE);
        assert_eq!(manager.space_size(), 0);
    }

    #[test]
    fn zero_slots_is_rejected() {
        assert!(StoreBuilder::new().cache_size(0).build().is_err());
    }

    #[test]
    fn pinning_selects_the_manager() {
        use crate::chunk::{ChunkKind, Coord};

        let pinned = StoreBuilder::new().cache_size(4).build().unwrap();
        let chunk = pinned
            .space_manager()
            .create_and_mark(Coord::new(0, 0, 1), ChunkKind::LongTree)
            .unwrap();
        assert_eq!(chunk.counter(), 1);

        let unpinned = StoreBuilder::new().cache_size(4).pinning(false).build().unwrap();
        let chunk = unpinned
            .space_manager()
            .create_and_mark(Coord::new(0, 0, 1), ChunkKind::LongTree)
            .unwrap();
        assert_eq!(chunk.counter(), 0);
    }
}

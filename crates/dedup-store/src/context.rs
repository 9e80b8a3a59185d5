use dedup_index::IndexStore;
use tracing::debug;

use crate::config::StoreConfig;
use crate::error::StoreResult;
use crate::pool::DescriptorPool;

/// Everything a store operation shares: configuration, the descriptor pool,
/// and the index store connection.
///
/// There is one context per process. Components borrow it per call instead of
/// holding on to any of its parts.
#[derive(Debug)]
pub struct Context<I: IndexStore> {
    pub config: StoreConfig,
    pub pool: DescriptorPool,
    pub index: I,
}

impl<I: IndexStore> Context<I> {
    pub fn new(config: StoreConfig, pool: DescriptorPool, index: I) -> Self {
        Self {
            config,
            pool,
            index,
        }
    }

    /// Build a context whose pool bound comes from the configuration, or from
    /// the OS handle limit when no fixed bound is configured.
    pub fn open(config: StoreConfig, index: I) -> StoreResult<Self> {
        config.validate()?;
        let pool = DescriptorPool::for_config(&config)?;
        Ok(Self::new(config, pool, index))
    }

    /// Release every pooled handle and close the index store.
    ///
    /// Handles are released even when closing the index fails.
    pub fn shutdown(&mut self) -> StoreResult<()> {
        let released = self.pool.release_all();
        debug!(released, "descriptor pool drained");
        self.index.close()?;
        Ok(())
    }
}

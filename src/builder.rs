//! Cache construction.
//!
//! [`CacheBuilder`] picks the budget regime, the purge bus and the block
//! allocator, and validates the combination before building a
//! [`ResourceCache`].
//!
//! ## Example
//!
//! ```rust
//! use rescache::builder::CacheBuilder;
//! use rescache::discardable::DiscardableMemoryPool;
//!
//! // heap-backed, bounded by bytes
//! let heap = CacheBuilder::new().total_byte_limit(4 << 20).build();
//! assert_eq!(heap.total_byte_limit(), 4 << 20);
//!
//! // discardable-backed, bounded by entry count
//! let pool = DiscardableMemoryPool::new(16 << 20);
//! let discardable = CacheBuilder::new()
//!     .discardable(pool.factory())
//!     .count_limit(256)
//!     .build();
//! assert_eq!(discardable.count_limit(), Some(256));
//! ```

use std::fmt;
use std::sync::Arc;

use crate::bus::MessageBus;
use crate::cache::{
    CacheSettings, PurgeSharedIdMessage, ResourceCache, DEFAULT_DISCARDABLE_COUNT_LIMIT,
    DEFAULT_TOTAL_BYTE_LIMIT,
};
use crate::discardable::DiscardableFactory;
use crate::error::ConfigError;

/// Plain cache limits, loadable from configuration files with the `serde`
/// feature.
///
/// Unset limits resolve at build time: the byte limit to
/// [`DEFAULT_TOTAL_BYTE_LIMIT`] for heap-backed caches, the count limit to
/// [`DEFAULT_DISCARDABLE_COUNT_LIMIT`] for discardable-backed ones.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(default)
)]
pub struct CacheConfig {
    pub total_byte_limit: Option<usize>,
    pub count_limit: Option<usize>,
    /// Advisory per-allocation cap; 0 means none.
    pub single_allocation_byte_limit: usize,
}

/// Builder for [`ResourceCache`].
#[derive(Default)]
pub struct CacheBuilder {
    config: CacheConfig,
    discardable: Option<DiscardableFactory>,
    bus: Option<Arc<MessageBus<PurgeSharedIdMessage>>>,
}

impl CacheBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self {
            config: config.clone(),
            ..Self::default()
        }
    }

    pub fn total_byte_limit(mut self, limit: usize) -> Self {
        self.config.total_byte_limit = Some(limit);
        self
    }

    pub fn count_limit(mut self, limit: usize) -> Self {
        self.config.count_limit = Some(limit);
        self
    }

    pub fn single_allocation_byte_limit(mut self, limit: usize) -> Self {
        self.config.single_allocation_byte_limit = limit;
        self
    }

    /// Backs payload blocks with discardable memory and switches the cache to
    /// a count budget.
    pub fn discardable(mut self, factory: DiscardableFactory) -> Self {
        self.discardable = Some(factory);
        self
    }

    /// Listens on `bus` instead of the global purge bus.
    pub fn bus(mut self, bus: Arc<MessageBus<PurgeSharedIdMessage>>) -> Self {
        self.bus = Some(bus);
        self
    }

    fn settings(&self) -> Result<CacheSettings, ConfigError> {
        let config = &self.config;
        if config.count_limit == Some(0) {
            return Err(ConfigError::new("count limit must be greater than zero"));
        }

        if self.discardable.is_some() {
            if config.total_byte_limit.is_some() {
                return Err(ConfigError::new(
                    "discardable-backed caches are bounded by count, not bytes",
                ));
            }
            return Ok(CacheSettings {
                total_byte_limit: usize::MAX,
                count_limit: Some(config.count_limit.unwrap_or(DEFAULT_DISCARDABLE_COUNT_LIMIT)),
                single_allocation_byte_limit: config.single_allocation_byte_limit,
            });
        }

        if config.count_limit.is_some() {
            return Err(ConfigError::new(
                "count limit applies only to discardable-backed caches",
            ));
        }
        let total_byte_limit = config.total_byte_limit.unwrap_or(DEFAULT_TOTAL_BYTE_LIMIT);
        if config.single_allocation_byte_limit > total_byte_limit {
            return Err(ConfigError::new(format!(
                "single allocation limit {} exceeds total byte limit {total_byte_limit}",
                config.single_allocation_byte_limit
            )));
        }
        Ok(CacheSettings {
            total_byte_limit,
            count_limit: None,
            single_allocation_byte_limit: config.single_allocation_byte_limit,
        })
    }

    pub fn try_build(self) -> Result<ResourceCache, ConfigError> {
        let settings = self.settings()?;
        let bus = self.bus.unwrap_or_else(MessageBus::<PurgeSharedIdMessage>::global);
        Ok(ResourceCache::from_parts(settings, self.discardable, bus))
    }

    /// # Panics
    ///
    /// Panics if the configuration is invalid; see [`try_build`](Self::try_build).
    pub fn build(self) -> ResourceCache {
        match self.try_build() {
            Ok(cache) => cache,
            Err(err) => panic!("invalid cache configuration: {err}"),
        }
    }
}

impl fmt::Debug for CacheBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheBuilder")
            .field("config", &self.config)
            .field("discardable", &self.discardable.is_some())
            .field("custom_bus", &self.bus.is_some())
            .finish()
    }
}

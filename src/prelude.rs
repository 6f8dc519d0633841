pub use crate::block::{BackingKind, BlockHandle, CacheHold, CachedBlock, LockState};
pub use crate::builder::{CacheBuilder, CacheConfig};
pub use crate::bus::{BusMessage, Mailbox, MailboxId, MessageBus};
pub use crate::cache::{
    BudgetMode, CacheSummary, PurgeSharedIdMessage, ResourceCache, DEFAULT_DISCARDABLE_COUNT_LIMIT,
    DEFAULT_TOTAL_BYTE_LIMIT,
};
pub use crate::discardable::{
    DiscardableFactory, DiscardableMemory, DiscardableMemoryPool, PoolMemory, PoolStats,
};
pub use crate::error::{ConfigError, InvariantError, KeyError};
pub use crate::key::{CacheKey, Namespace};
pub use crate::memory_dump::{CollectingDump, LevelOfDetail, MemoryDump};
#[cfg(feature = "metrics")]
pub use crate::metrics::ResourceCacheMetricsSnapshot;
pub use crate::rec::Rec;

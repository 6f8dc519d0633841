//! Process-wide default cache.
//!
//! Subsystems should take a `&ResourceCache` (or `Arc<ResourceCache>`) from
//! their owner. This module is for the application boundary only: it holds
//! one lazily created cache and forwards to it.
//!
//! ```
//! use rescache::global;
//!
//! let previous = global::set_total_byte_limit(8 << 20);
//! assert_eq!(global::total_byte_limit(), 8 << 20);
//! global::set_total_byte_limit(previous);
//! ```

use std::any::Any;
use std::sync::OnceLock;

use crate::block::CachedBlock;
use crate::cache::{ResourceCache, DEFAULT_TOTAL_BYTE_LIMIT};
use crate::key::CacheKey;
use crate::rec::Rec;

static GLOBAL_CACHE: OnceLock<ResourceCache> = OnceLock::new();

/// Makes `cache` the process-wide cache. Fails, handing `cache` back, once a
/// global cache exists (installed earlier or created by [`cache`]).
pub fn install(cache: ResourceCache) -> Result<&'static ResourceCache, ResourceCache> {
    GLOBAL_CACHE.set(cache)?;
    Ok(self::cache())
}

/// The process-wide cache; a heap cache with the default budget unless one
/// was installed first.
pub fn cache() -> &'static ResourceCache {
    GLOBAL_CACHE.get_or_init(|| ResourceCache::new(DEFAULT_TOTAL_BYTE_LIMIT))
}

pub fn find<F>(key: &CacheKey, visitor: F) -> bool
where
    F: FnOnce(&dyn Rec) -> bool,
{
    cache().find(key, visitor)
}

pub fn add(rec: Box<dyn Rec>) -> bool {
    cache().add(rec)
}

pub fn add_with_payload(rec: Box<dyn Rec>, payload: &mut dyn Any) -> bool {
    cache().add_with_payload(rec, payload)
}

pub fn new_cached_block(size: usize) -> Option<CachedBlock> {
    cache().new_cached_block(size)
}

/// Posts to the global purge bus; does not create the global cache.
pub fn post_purge_shared_id(shared_id: u64) -> usize {
    ResourceCache::post_purge_shared_id(shared_id)
}

pub fn purge_all() -> usize {
    cache().purge_all()
}

pub fn total_bytes_used() -> usize {
    cache().total_bytes_used()
}

pub fn total_byte_limit() -> usize {
    cache().total_byte_limit()
}

pub fn set_total_byte_limit(limit: usize) -> usize {
    cache().set_total_byte_limit(limit)
}

pub fn effective_single_allocation_byte_limit() -> usize {
    cache().effective_single_allocation_byte_limit()
}

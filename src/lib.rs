//! rescache: a budget-bounded, thread-safe LRU cache for expensive derived
//! resources, with asynchronous invalidation and lockable payload blocks.
//!
//! - [`cache::ResourceCache`]: the LRU monitor. Clients look records up with
//!   a visitor, install new ones with `add`, and allocate payload blocks.
//! - [`bus::MessageBus`]: typed broadcast used to post shared-id purges from
//!   any thread; each cache drains its mailbox on its next operation.
//! - [`block::CachedBlock`]: ref-counted payload memory that unlocks itself
//!   while only the cache holds it, on the heap or in
//!   [`discardable`] memory.
//!
//! ```
//! use std::sync::Arc;
//! use rescache::prelude::*;
//!
//! struct Thumbnails;
//!
//! struct Thumb {
//!     key: CacheKey,
//!     hold: CacheHold,
//! }
//!
//! impl Rec for Thumb {
//!     fn key(&self) -> &CacheKey { &self.key }
//!     fn bytes_used(&self) -> usize { self.hold.size() }
//!     fn category(&self) -> &'static str { "thumb" }
//! }
//!
//! let cache = CacheBuilder::new()
//!     .total_byte_limit(1 << 20)
//!     .bus(Arc::new(MessageBus::new()))
//!     .build();
//! let key = CacheKey::from_words(Namespace::of::<Thumbnails>(), 7, &[64, 64]);
//!
//! let block = cache.new_cached_block(64 * 64).unwrap();
//! cache.add(Box::new(Thumb { key: key.clone(), hold: block.attach_to_cache() }));
//!
//! let mut pixels = None;
//! cache.find(&key, |rec| {
//!     pixels = rec.downcast_ref::<Thumb>().map(|t| t.hold.to_block());
//!     true
//! });
//! assert_eq!(pixels.unwrap().size(), 64 * 64);
//!
//! cache.purge_bus().post(PurgeSharedIdMessage::new(7));
//! assert!(!cache.find(&key, |_| true));
//! ```

pub mod block;
pub mod builder;
pub mod bus;
pub mod cache;
pub mod discardable;
pub mod ds;
pub mod error;
pub mod global;
pub mod key;
pub mod memory_dump;
pub mod rec;

#[cfg(feature = "metrics")]
pub mod metrics;

pub mod prelude;

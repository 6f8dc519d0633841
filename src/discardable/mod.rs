//! OS-reclaimable ("discardable") memory.
//!
//! Discardable memory may be thrown away by its allocator whenever it is
//! unlocked. Every use must therefore be bracketed by [`lock`] and [`unlock`],
//! and `lock` can fail: a failed lock means the contents are gone for good.
//!
//! A discardable-backed [`ResourceCache`] is handed a [`DiscardableFactory`]
//! and lets the allocator handle byte pressure, capping only its entry count.
//! [`DiscardableMemoryPool`] is an in-process allocator with that contract.
//!
//! [`lock`]: DiscardableMemory::lock
//! [`unlock`]: DiscardableMemory::unlock
//! [`ResourceCache`]: crate::cache::ResourceCache

pub mod pool;

use std::sync::Arc;

pub use pool::{DiscardableMemoryPool, PoolMemory, PoolStats};

/// A block of memory its allocator may reclaim while unlocked.
///
/// Freshly created memory starts out locked.
pub trait DiscardableMemory: Send {
    /// Pins the contents. Returns `false` if they were reclaimed, in which case
    /// the memory stays unusable.
    fn lock(&mut self) -> bool;

    /// The contents, or `None` while unlocked.
    fn data(&mut self) -> Option<&mut [u8]>;

    /// Allows the allocator to reclaim the contents.
    fn unlock(&mut self);

    /// Size in bytes requested at creation.
    fn size(&self) -> usize;
}

/// Allocates discardable memory of the given size; `None` when exhausted.
pub type DiscardableFactory =
    Arc<dyn Fn(usize) -> Option<Box<dyn DiscardableMemory>> + Send + Sync>;

//! Cache records.
//!
//! A [`Rec`] is a client-defined cache entry: it carries its own [`CacheKey`],
//! reports its size, and says whether it may be evicted right now. Ownership
//! moves to the cache on [`ResourceCache::add`]; the cache drops the record
//! exactly once, on eviction or when the cache itself is dropped.
//!
//! Records usually keep their bytes in a [`CacheHold`] so the payload can be
//! unlocked while nobody outside the cache is reading it.
//!
//! ```
//! use rescache::block::{CacheHold, CachedBlock};
//! use rescache::key::{CacheKey, Namespace};
//! use rescache::rec::Rec;
//!
//! struct MaskRec {
//!     key: CacheKey,
//!     hold: CacheHold,
//! }
//!
//! impl Rec for MaskRec {
//!     fn key(&self) -> &CacheKey { &self.key }
//!     fn bytes_used(&self) -> usize { std::mem::size_of::<Self>() + self.hold.size() }
//!     fn category(&self) -> &'static str { "mask" }
//! }
//!
//! struct Masks;
//! let block = CachedBlock::from_vec(vec![0; 64]);
//! let rec = MaskRec {
//!     key: CacheKey::new(Namespace::of::<Masks>(), 1, &[]),
//!     hold: block.attach_to_cache(),
//! };
//! assert_eq!(rec.category(), "mask");
//! ```
//!
//! [`ResourceCache::add`]: crate::cache::ResourceCache::add
//! [`CacheHold`]: crate::block::CacheHold

use std::any::Any;

use crate::block::BlockHandle;
use crate::key::CacheKey;

/// Upcast helper so `dyn Rec` can be downcast to the concrete record.
/// Implemented for every `'static` type.
pub trait AsAny: Any {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// A cache entry.
pub trait Rec: AsAny + Send + 'static {
    fn key(&self) -> &CacheKey;

    /// Bytes charged against the cache budget. Must not change while cached.
    fn bytes_used(&self) -> usize;

    /// `false` while something outside the cache may still read this record's
    /// payload; such records are never evicted.
    fn can_be_purged(&self) -> bool {
        true
    }

    /// Called once the record is installed, with the payload passed to
    /// [`add_with_payload`](crate::cache::ResourceCache::add_with_payload).
    /// Also called on an existing un-purgeable record when a duplicate add is
    /// rejected in its favour.
    fn post_add_install(&mut self, payload: &mut dyn Any) {
        let _ = payload;
    }

    /// Short label used in diagnostics and memory dumps.
    fn category(&self) -> &'static str;

    /// Backing discardable block, for memory accounting only.
    fn discardable_handle(&self) -> Option<BlockHandle> {
        None
    }
}

impl dyn Rec {
    pub fn is<T: Rec>(&self) -> bool {
        AsAny::as_any(self).is::<T>()
    }

    pub fn downcast_ref<T: Rec>(&self) -> Option<&T> {
        AsAny::as_any(self).downcast_ref::<T>()
    }

    pub fn downcast_mut<T: Rec>(&mut self) -> Option<&mut T> {
        AsAny::as_any_mut(self).downcast_mut::<T>()
    }
}

//! Reference-counted, lockable memory blocks.
//!
//! A block's bytes live either on the heap or in [`DiscardableMemory`]. Who
//! holds the block decides whether it is locked:
//!
//! ```text
//!   holders                       state
//!   ─────────────────────────────────────────────────────────────
//!   client(s) only                Locked      data readable
//!   cache + client(s)             Locked      data readable
//!   cache only                    Unlocked    allocator may reclaim
//!   nobody                        destroyed
//! ```
//!
//! The last client leaving a cached block unlocks it right away, without
//! waiting for the cache to evict it. The next client to arrive re-locks it;
//! for discardable backing that lock can fail, which leaves the block
//! [`Reclaimed`](LockState::Reclaimed): it is paired like a locked block but
//! exposes no bytes. Readers treat that as a miss.
//!
//! Holding is expressed with two handle types so every ref is paired with
//! exactly one unref on every exit path:
//!
//! - [`CachedBlock`]: a client's strong reference (`Clone` refs, `Drop` unrefs).
//! - [`CacheHold`]: the cache's own reference, at most one per block.
//!
//! State and count sit behind one private mutex, independent of any cache
//! lock, because clients drop their references on arbitrary threads.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::discardable::DiscardableMemory;

static NEXT_BLOCK_ID: AtomicU64 = AtomicU64::new(1);

/// Where a block's bytes live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackingKind {
    Heap,
    Discardable,
}

/// Lock state of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    /// Only the cache holds the block; the bytes are not reachable.
    Unlocked,
    /// The bytes are valid.
    Locked,
    /// A lock was attempted but the allocator had reclaimed the bytes.
    Reclaimed,
}

impl LockState {
    /// `true` for the states that must be paired with an unlock.
    pub fn is_locked(self) -> bool {
        !matches!(self, LockState::Unlocked)
    }
}

/// Identity of a block for diagnostics and memory accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockHandle {
    pub id: u64,
    pub size: usize,
    pub kind: BackingKind,
}

enum Backing {
    Heap(Box<[u8]>),
    Discardable(Box<dyn DiscardableMemory>),
}

struct BlockCore {
    backing: Backing,
    state: LockState,
    ref_count: usize,
    in_cache: bool,
}

impl BlockCore {
    fn add_ref(&mut self, from_cache: bool) {
        if self.ref_count == 1 && self.in_cache {
            self.lock();
        }
        self.ref_count += 1;
        if from_cache {
            debug_assert!(!self.in_cache, "block attached to the cache twice");
            self.in_cache = true;
        }
    }

    fn release_ref(&mut self, from_cache: bool) {
        debug_assert!(self.ref_count > 0);
        self.ref_count -= 1;
        match self.ref_count {
            0 => {
                if self.state.is_locked() {
                    self.unlock();
                }
            },
            // the cache is the last holder and never reads the bytes
            1 if self.in_cache && !from_cache => {
                if self.state.is_locked() {
                    self.unlock();
                }
            },
            _ => {},
        }
        if from_cache {
            debug_assert!(self.in_cache, "detaching a block the cache does not hold");
            self.in_cache = false;
        }
    }

    fn lock(&mut self) {
        debug_assert_eq!(self.state, LockState::Unlocked);
        self.state = match &mut self.backing {
            Backing::Heap(_) => LockState::Locked,
            Backing::Discardable(memory) => {
                if memory.lock() {
                    LockState::Locked
                } else {
                    trace!("discardable block was reclaimed");
                    LockState::Reclaimed
                }
            },
        };
    }

    fn unlock(&mut self) {
        if let (Backing::Discardable(memory), LockState::Locked) = (&mut self.backing, self.state) {
            memory.unlock();
        }
        self.state = LockState::Unlocked;
    }

    fn bytes(&mut self) -> Option<&mut [u8]> {
        if self.state != LockState::Locked {
            return None;
        }
        match &mut self.backing {
            Backing::Heap(bytes) => Some(&mut bytes[..]),
            Backing::Discardable(memory) => memory.data(),
        }
    }
}

struct BlockShared {
    id: u64,
    size: usize,
    kind: BackingKind,
    core: Mutex<BlockCore>,
}

impl BlockShared {
    fn new(size: usize, backing: Backing) -> Arc<Self> {
        let kind = match backing {
            Backing::Heap(_) => BackingKind::Heap,
            Backing::Discardable(_) => BackingKind::Discardable,
        };
        Arc::new(Self {
            id: NEXT_BLOCK_ID.fetch_add(1, Ordering::Relaxed),
            size,
            kind,
            core: Mutex::new(BlockCore {
                backing,
                state: LockState::Locked,
                ref_count: 1,
                in_cache: false,
            }),
        })
    }

    fn handle(&self) -> BlockHandle {
        BlockHandle {
            id: self.id,
            size: self.size,
            kind: self.kind,
        }
    }
}

/// A client's strong reference to a block.
pub struct CachedBlock {
    shared: Arc<BlockShared>,
}

impl CachedBlock {
    /// Allocates `size` zeroed heap bytes. `None` if the allocation fails.
    pub fn new_heap(size: usize) -> Option<Self> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(size).ok()?;
        buf.resize(size, 0u8);
        Some(Self::from_vec(buf))
    }

    /// Wraps bytes the caller already produced.
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        let size = bytes.len();
        Self {
            shared: BlockShared::new(size, Backing::Heap(bytes.into_boxed_slice())),
        }
    }

    /// Wraps freshly created (therefore locked) discardable memory.
    pub fn from_discardable(memory: Box<dyn DiscardableMemory>) -> Self {
        let size = memory.size();
        Self {
            shared: BlockShared::new(size, Backing::Discardable(memory)),
        }
    }

    pub fn size(&self) -> usize {
        self.shared.size
    }

    pub fn backing_kind(&self) -> BackingKind {
        self.shared.kind
    }

    pub fn handle(&self) -> BlockHandle {
        self.shared.handle()
    }

    /// Runs `f` over the bytes, or returns `None` if they were reclaimed.
    ///
    /// The block's mutex is held while `f` runs; `f` must not touch this block
    /// through another handle.
    pub fn with_data<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Option<R> {
        let mut core = self.shared.core.lock();
        core.bytes().map(|bytes| f(&*bytes))
    }

    /// Mutable form of [`with_data`](Self::with_data), for producers filling
    /// a block before handing it to the cache.
    pub fn with_data_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> Option<R> {
        let mut core = self.shared.core.lock();
        core.bytes().map(f)
    }

    /// `true` if the bytes are currently readable.
    pub fn has_data(&self) -> bool {
        self.lock_state() == LockState::Locked
    }

    pub fn lock_state(&self) -> LockState {
        self.shared.core.lock().state
    }

    pub fn ref_count(&self) -> usize {
        self.shared.core.lock().ref_count
    }

    pub fn is_in_cache(&self) -> bool {
        self.shared.core.lock().in_cache
    }

    /// Hands a reference to the cache. A block has at most one cache hold.
    pub fn attach_to_cache(&self) -> CacheHold {
        self.shared.core.lock().add_ref(true);
        CacheHold {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Clone for CachedBlock {
    fn clone(&self) -> Self {
        self.shared.core.lock().add_ref(false);
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Drop for CachedBlock {
    fn drop(&mut self) {
        self.shared.core.lock().release_ref(false);
    }
}

impl fmt::Debug for CachedBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.shared.core.lock();
        f.debug_struct("CachedBlock")
            .field("id", &self.shared.id)
            .field("size", &self.shared.size)
            .field("kind", &self.shared.kind)
            .field("state", &core.state)
            .field("ref_count", &core.ref_count)
            .field("in_cache", &core.in_cache)
            .finish()
    }
}

/// The cache's reference to a block, embedded in a cache record.
///
/// While this is the only reference the block stays unlocked.
pub struct CacheHold {
    shared: Arc<BlockShared>,
}

impl CacheHold {
    /// A fresh client reference, re-locking the block if needed. Check
    /// [`CachedBlock::has_data`] before use: discardable bytes may be gone.
    pub fn to_block(&self) -> CachedBlock {
        self.shared.core.lock().add_ref(false);
        CachedBlock {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn size(&self) -> usize {
        self.shared.size
    }

    pub fn handle(&self) -> BlockHandle {
        self.shared.handle()
    }

    /// Handle of the discardable backing, if there is one.
    pub fn discardable_handle(&self) -> Option<BlockHandle> {
        (self.shared.kind == BackingKind::Discardable).then(|| self.shared.handle())
    }

    pub fn lock_state(&self) -> LockState {
        self.shared.core.lock().state
    }

    pub fn ref_count(&self) -> usize {
        self.shared.core.lock().ref_count
    }
}

impl Drop for CacheHold {
    fn drop(&mut self) {
        self.shared.core.lock().release_ref(true);
    }
}

impl fmt::Debug for CacheHold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheHold")
            .field("id", &self.shared.id)
            .field("size", &self.shared.size)
            .finish()
    }
}

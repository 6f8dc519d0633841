//! # Resource Cache
//!
//! Budget-bounded LRU index of client records ([`Rec`]), shared by every
//! thread of the renderer.
//!
//! ## Architecture
//!
//! ```text
//!   ┌─────────────────────────────────────────────────────────────────────┐
//!   │                          ResourceCache                              │
//!   │                                                                     │
//!   │   inbox: Mailbox<PurgeSharedIdMessage>  ◄── MessageBus::post(..)    │
//!   │   discardable: Option<DiscardableFactory>                           │
//!   │                                                                     │
//!   │   ┌───────────────────────── Mutex<CacheCore> ────────────────────┐ │
//!   │   │  index: FxHashMap<CacheKey, SlotId>                           │ │
//!   │   │  lru:   IntrusiveList<Entry { bytes, rec: Box<dyn Rec> }>     │ │
//!   │   │                                                               │ │
//!   │   │    head ──► [rec] ◄──► [rec] ◄──► [rec] ◄── tail              │ │
//!   │   │    (MRU)                              (LRU, evicted first)    │ │
//!   │   │                                                               │ │
//!   │   │  total_bytes / total_byte_limit / count_limit                 │ │
//!   │   └───────────────────────────────────────────────────────────────┘ │
//!   └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The whole core sits behind one mutex: a hit promotes the record in the
//! list and must be atomic with respect to concurrent evictions.
//!
//! ## Budgets
//!
//! | Backing      | Bounded by          | Byte pressure handled by       |
//! |--------------|---------------------|--------------------------------|
//! | heap         | `total_byte_limit`  | this cache                     |
//! | discardable  | `count_limit`       | the discardable allocator      |
//!
//! The regime is fixed at construction. A cache is over budget when its total
//! is strictly greater than the limit.
//!
//! ## Eviction
//!
//! [`purge_as_needed`](ResourceCache::purge_as_needed) walks from the tail and
//! removes purgeable records while over budget. It stops at the first record
//! that cannot be purged: that record and everything hotter stay, even if the
//! cache remains over budget.
//!
//! ## Invalidation
//!
//! [`ResourceCache::post_purge_shared_id`] posts to the purge bus from any
//! thread without touching any cache. Each cache drains its mailbox at the
//! start of `find`, `add` and `new_cached_block` and removes every purgeable
//! record carrying that shared id.
//!
//! ## Record lifetime
//!
//! Records removed by an operation are dropped after the monitor is
//! released, so record `Drop` code never runs under the cache lock. Visitors
//! passed to [`find`](ResourceCache::find) and
//! [`visit_all`](ResourceCache::visit_all) run *under* the lock and must not
//! call back into the cache.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{debug, info, trace};

use crate::block::CachedBlock;
use crate::bus::{BusMessage, Mailbox, MessageBus};
use crate::discardable::DiscardableFactory;
use crate::ds::{IntrusiveList, SlotId};
use crate::error::InvariantError;
use crate::key::CacheKey;
use crate::memory_dump::{LevelOfDetail, MemoryDump};
#[cfg(feature = "metrics")]
use crate::metrics::{
    MetricsSnapshotProvider, ResourceCacheMetrics, ResourceCacheMetricsRecorder,
    ResourceCacheMetricsSnapshot,
};
use crate::rec::Rec;

/// Byte budget of a heap-backed cache built without an explicit limit.
pub const DEFAULT_TOTAL_BYTE_LIMIT: usize = 32 * 1024 * 1024;

/// Entry cap of a discardable-backed cache built without an explicit limit.
pub const DEFAULT_DISCARDABLE_COUNT_LIMIT: usize = 1024;

/// Asks every cache to drop the records derived from one source asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PurgeSharedIdMessage {
    shared_id: u64,
}

impl PurgeSharedIdMessage {
    pub fn new(shared_id: u64) -> Self {
        Self { shared_id }
    }

    pub fn shared_id(&self) -> u64 {
        self.shared_id
    }
}

impl BusMessage for PurgeSharedIdMessage {}

/// Which limit bounds a cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetMode {
    Bytes,
    Count,
}

/// Totals and limits reported by [`ResourceCache::dump`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheSummary {
    pub count: usize,
    pub total_bytes: usize,
    pub total_byte_limit: usize,
    pub count_limit: Option<usize>,
    pub discardable: bool,
}

/// Resolved limits handed over by the builder.
#[derive(Debug, Clone, Copy)]
pub(crate) struct CacheSettings {
    pub(crate) total_byte_limit: usize,
    pub(crate) count_limit: Option<usize>,
    pub(crate) single_allocation_byte_limit: usize,
}

struct Entry {
    bytes: usize,
    rec: Box<dyn Rec>,
}

/// Records removed during one operation, dropped once the monitor is released.
type Graveyard = Vec<Box<dyn Rec>>;

struct CacheCore {
    index: FxHashMap<CacheKey, SlotId>,
    lru: IntrusiveList<Entry>,
    total_bytes: usize,
    total_byte_limit: usize,
    count_limit: Option<usize>,
    single_allocation_byte_limit: usize,
    #[cfg(feature = "metrics")]
    metrics: ResourceCacheMetrics,
}

impl CacheCore {
    fn new(settings: CacheSettings) -> Self {
        Self {
            index: FxHashMap::default(),
            lru: IntrusiveList::new(),
            total_bytes: 0,
            total_byte_limit: settings.total_byte_limit,
            count_limit: settings.count_limit,
            single_allocation_byte_limit: settings.single_allocation_byte_limit,
            #[cfg(feature = "metrics")]
            metrics: ResourceCacheMetrics::default(),
        }
    }

    fn over_budget(&self) -> bool {
        match self.count_limit {
            Some(limit) => self.lru.len() > limit,
            None => self.total_bytes > self.total_byte_limit,
        }
    }

    fn remove(&mut self, id: SlotId, graveyard: &mut Graveyard) {
        if let Some(entry) = self.lru.remove(id) {
            self.index.remove(entry.rec.key());
            self.total_bytes -= entry.bytes;
            graveyard.push(entry.rec);
        }
    }

    fn find<F>(&mut self, key: &CacheKey, visitor: F, graveyard: &mut Graveyard) -> bool
    where
        F: FnOnce(&dyn Rec) -> bool,
    {
        #[cfg(feature = "metrics")]
        self.metrics.record_find_call();

        let Some(&id) = self.index.get(key) else {
            #[cfg(feature = "metrics")]
            self.metrics.record_find_miss();
            trace!(shared_id = key.shared_id(), "cache miss");
            return false;
        };
        let Some(entry) = self.lru.get(id) else {
            return false;
        };

        if visitor(entry.rec.as_ref()) {
            self.lru.move_to_front(id);
            #[cfg(feature = "metrics")]
            self.metrics.record_find_hit();
            trace!(shared_id = key.shared_id(), "cache hit");
            true
        } else {
            self.remove(id, graveyard);
            #[cfg(feature = "metrics")]
            self.metrics.record_find_stale();
            trace!(shared_id = key.shared_id(), "stale record dropped");
            false
        }
    }

    fn add(&mut self, rec: Box<dyn Rec>, payload: &mut dyn Any, graveyard: &mut Graveyard) -> bool {
        #[cfg(feature = "metrics")]
        self.metrics.record_add_call();

        if let Some(&existing) = self.index.get(rec.key()) {
            let purgeable = self
                .lru
                .get(existing)
                .map_or(true, |entry| entry.rec.can_be_purged());
            if purgeable {
                self.remove(existing, graveyard);
                #[cfg(feature = "metrics")]
                self.metrics.record_add_replaced();
            } else {
                // the live record keeps its slot; the newcomer is discarded
                if let Some(entry) = self.lru.get_mut(existing) {
                    entry.rec.post_add_install(payload);
                }
                graveyard.push(rec);
                #[cfg(feature = "metrics")]
                self.metrics.record_add_rejected();
                trace!("duplicate add rejected in favour of a live record");
                return false;
            }
        }

        let key = rec.key().clone();
        let bytes = rec.bytes_used();
        let id = self.lru.push_front(Entry { bytes, rec });
        self.index.insert(key, id);
        self.total_bytes += bytes;
        if let Some(entry) = self.lru.get_mut(id) {
            entry.rec.post_add_install(payload);
        }

        self.purge_as_needed(false, graveyard);
        true
    }

    fn purge_as_needed(&mut self, force: bool, graveyard: &mut Graveyard) -> usize {
        let mut removed = 0;
        let mut current = self.lru.back_id();
        while let Some(id) = current {
            if !force && !self.over_budget() {
                break;
            }
            let purgeable = self
                .lru
                .get(id)
                .is_some_and(|entry| entry.rec.can_be_purged());
            if !purgeable {
                trace!("eviction stopped at a record still in use");
                break;
            }
            current = self.lru.prev_id(id);
            self.remove(id, graveyard);
            removed += 1;
            #[cfg(feature = "metrics")]
            self.metrics.record_evicted_entry();
        }
        if removed > 0 {
            trace!(removed, total_bytes = self.total_bytes, "evicted records");
        }
        removed
    }

    fn purge_shared_id(&mut self, shared_id: u64, graveyard: &mut Graveyard) -> usize {
        if shared_id == 0 {
            return 0;
        }
        let mut removed = 0;
        let mut current = self.lru.back_id();
        while let Some(id) = current {
            current = self.lru.prev_id(id);
            let matches = self.lru.get(id).is_some_and(|entry| {
                entry.rec.key().shared_id() == shared_id && entry.rec.can_be_purged()
            });
            if matches {
                self.remove(id, graveyard);
                removed += 1;
            }
        }
        #[cfg(feature = "metrics")]
        self.metrics.record_shared_id_purge(removed);
        debug!(shared_id, removed, "purged shared id");
        removed
    }

    fn note_block_alloc(&mut self, size: usize, allocated: bool) {
        #[cfg(feature = "metrics")]
        {
            if allocated {
                self.metrics.record_block_alloc();
            } else {
                self.metrics.record_block_alloc_failure();
            }
        }
        if !allocated {
            debug!(size, "cached block allocation failed");
        }
    }

    fn apply_messages(&mut self, messages: &[PurgeSharedIdMessage], graveyard: &mut Graveyard) {
        #[cfg(feature = "metrics")]
        self.metrics.record_messages_drained(messages.len());
        debug!(count = messages.len(), "draining purge messages");
        for message in messages {
            self.purge_shared_id(message.shared_id(), graveyard);
        }
    }

    fn check_invariants(&self) -> Result<(), InvariantError> {
        self.lru.check_links()?;

        let mut bytes = 0usize;
        for (id, entry) in self.lru.iter_entries() {
            bytes += entry.bytes;
            if self.index.get(entry.rec.key()) != Some(&id) {
                return Err(InvariantError::new(format!(
                    "record in slot {} is missing from the index",
                    id.index()
                )));
            }
        }
        if bytes != self.total_bytes {
            return Err(InvariantError::new(format!(
                "records hold {bytes} bytes but the cache accounts {}",
                self.total_bytes
            )));
        }
        if self.index.len() != self.lru.len() {
            return Err(InvariantError::new(format!(
                "index has {} keys, list has {} records",
                self.index.len(),
                self.lru.len()
            )));
        }
        Ok(())
    }
}

/// Process-shareable LRU cache of [`Rec`]s.
pub struct ResourceCache {
    core: Mutex<CacheCore>,
    discardable: Option<DiscardableFactory>,
    inbox: Mailbox<PurgeSharedIdMessage>,
}

impl ResourceCache {
    /// Heap-backed cache bounded by `total_byte_limit` bytes, listening on the
    /// global purge bus.
    pub fn new(total_byte_limit: usize) -> Self {
        Self::from_parts(
            CacheSettings {
                total_byte_limit,
                count_limit: None,
                single_allocation_byte_limit: 0,
            },
            None,
            MessageBus::global(),
        )
    }

    /// Discardable-backed cache capped at [`DEFAULT_DISCARDABLE_COUNT_LIMIT`]
    /// records, listening on the global purge bus.
    pub fn with_discardable(factory: DiscardableFactory) -> Self {
        Self::from_parts(
            CacheSettings {
                total_byte_limit: usize::MAX,
                count_limit: Some(DEFAULT_DISCARDABLE_COUNT_LIMIT),
                single_allocation_byte_limit: 0,
            },
            Some(factory),
            MessageBus::global(),
        )
    }

    pub(crate) fn from_parts(
        settings: CacheSettings,
        discardable: Option<DiscardableFactory>,
        bus: Arc<MessageBus<PurgeSharedIdMessage>>,
    ) -> Self {
        debug!(
            total_byte_limit = settings.total_byte_limit,
            count_limit = ?settings.count_limit,
            discardable = discardable.is_some(),
            "resource cache created"
        );
        Self {
            core: Mutex::new(CacheCore::new(settings)),
            discardable,
            inbox: bus.mailbox(),
        }
    }

    /// Posts a shared-id purge to every cache on the global bus. Applied by
    /// each cache on its next operation.
    pub fn post_purge_shared_id(shared_id: u64) -> usize {
        MessageBus::<PurgeSharedIdMessage>::global().post(PurgeSharedIdMessage::new(shared_id))
    }

    /// The bus this cache listens on.
    pub fn purge_bus(&self) -> &Arc<MessageBus<PurgeSharedIdMessage>> {
        self.inbox.bus()
    }

    /// Runs `op` under the monitor, after replaying pending purge messages if
    /// `drain` is set. Removed records are dropped after the lock is released.
    fn operate<R>(&self, drain: bool, op: impl FnOnce(&mut CacheCore, &mut Graveyard) -> R) -> R {
        let messages = if drain { self.inbox.drain() } else { Vec::new() };
        let mut graveyard = Graveyard::new();
        let result = {
            let mut core = self.core.lock();
            if !messages.is_empty() {
                core.apply_messages(&messages, &mut graveyard);
            }
            op(&mut *core, &mut graveyard)
        };
        drop(graveyard);
        result
    }

    /// Looks up `key`. On a hit `visitor` decides whether the record is still
    /// usable: `true` promotes it to most recently used and returns `true`,
    /// `false` drops the record as stale and returns `false`.
    pub fn find<F>(&self, key: &CacheKey, visitor: F) -> bool
    where
        F: FnOnce(&dyn Rec) -> bool,
    {
        self.operate(true, |core, graveyard| core.find(key, visitor, graveyard))
    }

    /// Installs `rec` with an empty payload. See [`add_with_payload`](Self::add_with_payload).
    pub fn add(&self, rec: Box<dyn Rec>) -> bool {
        self.add_with_payload(rec, &mut ())
    }

    /// Installs `rec` at the head and evicts as needed.
    ///
    /// If a record with the same key exists and can be purged, it is replaced.
    /// If it cannot be purged, `rec` is dropped and the existing record's
    /// [`post_add_install`](Rec::post_add_install) receives `payload` instead.
    /// Returns whether `rec` was installed.
    pub fn add_with_payload(&self, rec: Box<dyn Rec>, payload: &mut dyn Any) -> bool {
        self.operate(true, |core, graveyard| core.add(rec, payload, graveyard))
    }

    /// `true` if `key` is cached. Does not promote.
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.operate(true, |core, _| core.index.contains_key(key))
    }

    /// Allocates a block for a record's payload, from the discardable factory
    /// when there is one. `None` when the allocation fails; callers should
    /// then skip caching.
    pub fn new_cached_block(&self, size: usize) -> Option<CachedBlock> {
        let block = match &self.discardable {
            Some(factory) => factory(size).map(CachedBlock::from_discardable),
            None => CachedBlock::new_heap(size),
        };
        self.operate(true, |core, _| core.note_block_alloc(size, block.is_some()));
        block
    }

    /// Evicts cold records until back under budget (see module docs).
    pub fn purge_as_needed(&self) -> usize {
        self.operate(false, |core, graveyard| core.purge_as_needed(false, graveyard))
    }

    /// Evicts from the cold end until reaching a record still in use.
    pub fn purge_all(&self) -> usize {
        let removed = self.operate(false, |core, graveyard| core.purge_as_needed(true, graveyard));
        debug!(removed, "purge all");
        removed
    }

    /// Removes every purgeable record whose key carries `shared_id`. Shared id
    /// 0 means "none" and is ignored.
    pub fn purge_shared_id(&self, shared_id: u64) -> usize {
        self.operate(false, |core, graveyard| core.purge_shared_id(shared_id, graveyard))
    }

    /// Sets the byte budget and returns the previous one; shrinking evicts.
    pub fn set_total_byte_limit(&self, limit: usize) -> usize {
        let previous = self.operate(false, |core, graveyard| {
            let previous = core.total_byte_limit;
            core.total_byte_limit = limit;
            if limit < previous {
                core.purge_as_needed(false, graveyard);
            }
            previous
        });
        debug!(previous, limit, "total byte limit changed");
        previous
    }

    pub fn total_byte_limit(&self) -> usize {
        self.core.lock().total_byte_limit
    }

    pub fn total_bytes_used(&self) -> usize {
        self.core.lock().total_bytes
    }

    /// Entry cap; `None` for heap-backed caches.
    pub fn count_limit(&self) -> Option<usize> {
        self.core.lock().count_limit
    }

    pub fn len(&self) -> usize {
        self.core.lock().lru.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn budget_mode(&self) -> BudgetMode {
        if self.discardable.is_some() {
            BudgetMode::Count
        } else {
            BudgetMode::Bytes
        }
    }

    pub fn is_discardable(&self) -> bool {
        self.discardable.is_some()
    }

    pub fn discardable_factory(&self) -> Option<DiscardableFactory> {
        self.discardable.clone()
    }

    /// Sets the advisory single-allocation limit (0 = none) and returns the
    /// previous one.
    pub fn set_single_allocation_byte_limit(&self, limit: usize) -> usize {
        let mut core = self.core.lock();
        std::mem::replace(&mut core.single_allocation_byte_limit, limit)
    }

    pub fn single_allocation_byte_limit(&self) -> usize {
        self.core.lock().single_allocation_byte_limit
    }

    /// The single-allocation limit clients should honour. For heap-backed
    /// caches it never exceeds the total budget; 0 there means "the total
    /// budget".
    pub fn effective_single_allocation_byte_limit(&self) -> usize {
        let core = self.core.lock();
        let limit = core.single_allocation_byte_limit;
        if self.discardable.is_some() {
            return limit;
        }
        if limit == 0 {
            core.total_byte_limit
        } else {
            limit.min(core.total_byte_limit)
        }
    }

    /// Visits every record from most to least recently used, without
    /// reordering.
    pub fn visit_all(&self, mut visitor: impl FnMut(&dyn Rec)) {
        let core = self.core.lock();
        for entry in core.lru.iter() {
            visitor(entry.rec.as_ref());
        }
    }

    /// Logs and returns the cache totals.
    pub fn dump(&self) -> CacheSummary {
        let summary = {
            let core = self.core.lock();
            CacheSummary {
                count: core.lru.len(),
                total_bytes: core.total_bytes,
                total_byte_limit: core.total_byte_limit,
                count_limit: core.count_limit,
                discardable: self.discardable.is_some(),
            }
        };
        info!(
            count = summary.count,
            bytes = summary.total_bytes,
            byte_limit = summary.total_byte_limit,
            count_limit = ?summary.count_limit,
            backing = if summary.discardable { "discardable" } else { "malloc" },
            "resource cache"
        );
        summary
    }

    /// Reports memory use to `dump`: one aggregate value at
    /// [`LevelOfDetail::Light`], one dump per record otherwise.
    pub fn dump_memory_statistics(&self, dump: &mut dyn MemoryDump) {
        let core = self.core.lock();
        if dump.level_of_detail() == LevelOfDetail::Light {
            dump.dump_numeric_value("rescache", "size", "bytes", core.total_bytes as u64);
            return;
        }
        for (id, entry) in core.lru.iter_entries() {
            let name = format!("rescache/{}_{}", entry.rec.category(), id.index());
            match entry.rec.discardable_handle() {
                Some(block) => {
                    dump.set_discardable_memory_backing(&name, block);
                    dump.dump_numeric_value(&name, "discardable_size", "bytes", entry.bytes as u64);
                },
                None => {
                    dump.dump_numeric_value(&name, "size", "bytes", entry.bytes as u64);
                    dump.set_memory_backing(&name, "malloc");
                },
            }
        }
    }

    /// Verifies list links, index agreement and byte accounting.
    pub fn check_invariants(&self) -> Result<(), InvariantError> {
        self.core.lock().check_invariants()
    }

    #[cfg(feature = "metrics")]
    pub fn metrics_snapshot(&self) -> ResourceCacheMetricsSnapshot {
        let core = self.core.lock();
        let m = &core.metrics;
        ResourceCacheMetricsSnapshot {
            find_calls: m.find_calls,
            find_hits: m.find_hits,
            find_misses: m.find_misses,
            find_stale: m.find_stale,
            add_calls: m.add_calls,
            add_replaced: m.add_replaced,
            add_rejected: m.add_rejected,
            evicted_entries: m.evicted_entries,
            shared_id_purges: m.shared_id_purges,
            shared_id_purged_entries: m.shared_id_purged_entries,
            messages_drained: m.messages_drained,
            block_allocs: m.block_allocs,
            block_alloc_failures: m.block_alloc_failures,
            entry_count: core.lru.len(),
            total_bytes: core.total_bytes,
            total_byte_limit: core.total_byte_limit,
        }
    }
}

#[cfg(feature = "metrics")]
impl MetricsSnapshotProvider<ResourceCacheMetricsSnapshot> for ResourceCache {
    fn snapshot(&self) -> ResourceCacheMetricsSnapshot {
        self.metrics_snapshot()
    }
}

impl fmt::Debug for ResourceCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.core.lock();
        f.debug_struct("ResourceCache")
            .field("count", &core.lru.len())
            .field("total_bytes", &core.total_bytes)
            .field("total_byte_limit", &core.total_byte_limit)
            .field("count_limit", &core.count_limit)
            .field("discardable", &self.discardable.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;
    use crate::block::{BlockHandle, CacheHold};
    use crate::builder::CacheBuilder;
    use crate::discardable::{DiscardableMemory, DiscardableMemoryPool};
    use crate::key::Namespace;
    use crate::memory_dump::CollectingDump;

    struct TestNs;

    struct TestRec {
        key: CacheKey,
        bytes: usize,
        tag: u32,
        purgeable: Arc<AtomicBool>,
        installs: Arc<AtomicUsize>,
    }

    impl Rec for TestRec {
        fn key(&self) -> &CacheKey {
            &self.key
        }

        fn bytes_used(&self) -> usize {
            self.bytes
        }

        fn can_be_purged(&self) -> bool {
            self.purgeable.load(Ordering::SeqCst)
        }

        fn post_add_install(&mut self, payload: &mut dyn Any) {
            self.installs.fetch_add(1, Ordering::SeqCst);
            if let Some(out) = payload.downcast_mut::<Vec<u32>>() {
                out.push(self.tag);
            }
        }

        fn category(&self) -> &'static str {
            "test"
        }
    }

    fn key(shared_id: u64, word: u32) -> CacheKey {
        CacheKey::from_words(Namespace::of::<TestNs>(), shared_id, &[word])
    }

    fn rec(shared_id: u64, word: u32, bytes: usize) -> Box<TestRec> {
        Box::new(TestRec {
            key: key(shared_id, word),
            bytes,
            tag: word,
            purgeable: Arc::new(AtomicBool::new(true)),
            installs: Arc::new(AtomicUsize::new(0)),
        })
    }

    fn heap_cache(limit: usize) -> ResourceCache {
        CacheBuilder::new()
            .total_byte_limit(limit)
            .bus(Arc::new(MessageBus::new()))
            .build()
    }

    fn tag_of(cache: &ResourceCache, key: &CacheKey) -> Option<u32> {
        let mut tag = None;
        cache.find(key, |r| {
            tag = r.downcast_ref::<TestRec>().map(|t| t.tag);
            true
        });
        tag
    }

    fn order(cache: &ResourceCache) -> Vec<u32> {
        let mut tags = Vec::new();
        cache.visit_all(|r| tags.extend(r.downcast_ref::<TestRec>().map(|t| t.tag)));
        tags
    }

    #[test]
    fn find_returns_record_and_promotes() {
        let cache = heap_cache(1000);
        let k = CacheKey::new(Namespace::of::<TestNs>(), 42, &[1, 2, 3, 4]);
        let mut first = rec(42, 0, 100);
        first.key = k.clone();
        first.tag = 1;
        assert!(cache.add(first));
        assert!(cache.add(rec(1, 2, 100)));
        assert_eq!(order(&cache), vec![2, 1]);

        assert_eq!(tag_of(&cache, &k), Some(1));
        assert_eq!(order(&cache), vec![1, 2]);
        cache.check_invariants().unwrap();
    }

    #[test]
    fn budget_met_exactly_then_overflow_evicts_coldest() {
        let cache = heap_cache(1000);
        let k1 = key(42, 1);
        cache.add(rec(42, 1, 100));
        cache.add(rec(42, 2, 100));
        assert_eq!(tag_of(&cache, &k1), Some(1));
        for word in 3..=10 {
            cache.add(rec(42, word, 100));
        }
        assert_eq!(cache.total_bytes_used(), 1000);
        assert_eq!(cache.len(), 10);

        cache.add(rec(7, 11, 50));
        assert!(cache.total_bytes_used() <= 1000);
        assert_eq!(cache.total_bytes_used(), 950);
        assert!(!cache.contains(&key(42, 2)));
        assert!(cache.contains(&k1));
        cache.check_invariants().unwrap();
    }

    #[test]
    fn miss_returns_false_without_calling_visitor() {
        let cache = heap_cache(1000);
        let mut called = false;
        assert!(!cache.find(&key(1, 1), |_| {
            called = true;
            true
        }));
        assert!(!called);
    }

    #[test]
    fn stale_visit_removes_record() {
        let cache = heap_cache(1000);
        cache.add(rec(1, 1, 10));
        assert!(!cache.find(&key(1, 1), |_| false));
        assert!(cache.is_empty());
        assert_eq!(cache.total_bytes_used(), 0);
        cache.check_invariants().unwrap();
    }

    #[test]
    fn duplicate_purgeable_record_is_replaced() {
        let cache = heap_cache(1000);
        let old = rec(1, 1, 10);
        let old_installs = Arc::clone(&old.installs);
        cache.add(old);

        let mut new = rec(1, 1, 30);
        new.tag = 99;
        let new_installs = Arc::clone(&new.installs);
        assert!(cache.add(new));

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.total_bytes_used(), 30);
        assert_eq!(tag_of(&cache, &key(1, 1)), Some(99));
        assert_eq!(old_installs.load(Ordering::SeqCst), 1);
        assert_eq!(new_installs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn duplicate_of_live_record_is_rejected() {
        let cache = heap_cache(1000);
        let live = rec(1, 1, 10);
        live.purgeable.store(false, Ordering::SeqCst);
        let live_installs = Arc::clone(&live.installs);
        cache.add(live);

        let mut late = rec(1, 1, 30);
        late.tag = 2;
        let late_installs = Arc::clone(&late.installs);
        let mut payload: Vec<u32> = Vec::new();
        assert!(!cache.add_with_payload(late, &mut payload));

        assert_eq!(payload, vec![1]);
        assert_eq!(late_installs.load(Ordering::SeqCst), 0);
        assert_eq!(live_installs.load(Ordering::SeqCst), 2);
        assert_eq!(cache.total_bytes_used(), 10);
        assert_eq!(tag_of(&cache, &key(1, 1)), Some(1));
    }

    #[test]
    fn eviction_stops_at_first_unpurgeable_record() {
        let cache = heap_cache(300);
        let pinned = rec(1, 1, 100);
        let pin = Arc::clone(&pinned.purgeable);
        cache.add(pinned);
        cache.add(rec(1, 2, 100));
        cache.add(rec(1, 3, 100));
        pin.store(false, Ordering::SeqCst);

        cache.add(rec(1, 4, 100));
        assert_eq!(cache.len(), 4);
        assert_eq!(cache.total_bytes_used(), 400);

        pin.store(true, Ordering::SeqCst);
        assert_eq!(cache.purge_as_needed(), 1);
        assert_eq!(order(&cache), vec![4, 3, 2]);
    }

    #[test]
    fn discardable_cache_is_bounded_by_count() {
        let pool = DiscardableMemoryPool::new(1 << 20);
        let cache = CacheBuilder::new()
            .discardable(pool.factory())
            .count_limit(3)
            .bus(Arc::new(MessageBus::new()))
            .build();
        assert_eq!(cache.budget_mode(), BudgetMode::Count);
        for word in 0..5 {
            cache.add(rec(1, word, 1 << 20));
        }
        assert_eq!(cache.len(), 3);
        assert_eq!(order(&cache), vec![4, 3, 2]);
        assert_eq!(cache.total_bytes_used(), 3 << 20);
    }

    #[test]
    fn purge_shared_id_scans_whole_list() {
        let cache = heap_cache(10_000);
        cache.add(rec(5, 1, 10));
        cache.add(rec(6, 2, 10));
        let keep = rec(5, 3, 10);
        keep.purgeable.store(false, Ordering::SeqCst);
        cache.add(keep);
        cache.add(rec(5, 4, 10));
        cache.add(rec(6, 5, 10));

        assert_eq!(cache.purge_shared_id(5), 2);
        assert_eq!(order(&cache), vec![5, 3, 2]);
        assert_eq!(cache.purge_shared_id(0), 0);
        cache.check_invariants().unwrap();
    }

    #[test]
    fn posted_purge_applies_on_next_operation() {
        let cache = heap_cache(10_000);
        cache.add(rec(9, 1, 10));
        cache.add(rec(8, 2, 10));

        cache.purge_bus().post(PurgeSharedIdMessage::new(9));
        assert_eq!(order(&cache), vec![2, 1]);

        assert!(!cache.find(&key(9, 1), |_| true));
        assert_eq!(order(&cache), vec![2]);
    }

    #[test]
    fn shrinking_byte_limit_evicts_and_returns_previous() {
        let cache = heap_cache(1000);
        for word in 0..5 {
            cache.add(rec(1, word, 100));
        }
        assert_eq!(cache.set_total_byte_limit(250), 1000);
        assert_eq!(cache.total_byte_limit(), 250);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.set_total_byte_limit(4000), 250);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn effective_single_allocation_limit_is_clamped_for_heap() {
        let cache = heap_cache(1000);
        assert_eq!(cache.effective_single_allocation_byte_limit(), 1000);
        assert_eq!(cache.set_single_allocation_byte_limit(200), 0);
        assert_eq!(cache.effective_single_allocation_byte_limit(), 200);
        cache.set_single_allocation_byte_limit(5000);
        assert_eq!(cache.single_allocation_byte_limit(), 5000);
        assert_eq!(cache.effective_single_allocation_byte_limit(), 1000);

        let pool = DiscardableMemoryPool::new(1 << 20);
        let discardable = CacheBuilder::new()
            .discardable(pool.factory())
            .bus(Arc::new(MessageBus::new()))
            .build();
        assert_eq!(discardable.effective_single_allocation_byte_limit(), 0);
        discardable.set_single_allocation_byte_limit(5000);
        assert_eq!(discardable.effective_single_allocation_byte_limit(), 5000);
    }

    #[test]
    fn purge_all_empties_purgeable_cache() {
        let cache = heap_cache(1000);
        for word in 0..4 {
            cache.add(rec(1, word, 10));
        }
        assert_eq!(cache.purge_all(), 4);
        assert!(cache.is_empty());
        assert_eq!(cache.total_bytes_used(), 0);
    }

    struct ReentrantRec {
        key: CacheKey,
        cache: Arc<ResourceCache>,
        observed_len: Arc<AtomicUsize>,
    }

    impl Rec for ReentrantRec {
        fn key(&self) -> &CacheKey {
            &self.key
        }

        fn bytes_used(&self) -> usize {
            1
        }

        fn category(&self) -> &'static str {
            "reentrant"
        }
    }

    impl Drop for ReentrantRec {
        fn drop(&mut self) {
            self.observed_len.store(self.cache.len(), Ordering::SeqCst);
        }
    }

    #[test]
    fn evicted_records_drop_outside_the_monitor() {
        let cache = Arc::new(heap_cache(1000));
        let observed = Arc::new(AtomicUsize::new(usize::MAX));
        cache.add(Box::new(ReentrantRec {
            key: key(1, 1),
            cache: Arc::clone(&cache),
            observed_len: Arc::clone(&observed),
        }));
        cache.purge_all();
        assert_eq!(observed.load(Ordering::SeqCst), 0);
    }

    struct BlockRec {
        key: CacheKey,
        hold: CacheHold,
    }

    impl Rec for BlockRec {
        fn key(&self) -> &CacheKey {
            &self.key
        }

        fn bytes_used(&self) -> usize {
            self.hold.size()
        }

        fn category(&self) -> &'static str {
            "block"
        }

        fn discardable_handle(&self) -> Option<BlockHandle> {
            self.hold.discardable_handle()
        }
    }

    #[test]
    fn heap_blocks_round_trip_through_cache() {
        let cache = heap_cache(1 << 20);
        let block = cache.new_cached_block(16).unwrap();
        block.with_data_mut(|b| b.fill(3));
        cache.add(Box::new(BlockRec {
            key: key(2, 2),
            hold: block.attach_to_cache(),
        }));
        drop(block);

        let mut found = None;
        cache.find(&key(2, 2), |r| {
            found = r.downcast_ref::<BlockRec>().map(|b| b.hold.to_block());
            true
        });
        let found = found.unwrap();
        assert_eq!(found.with_data(|b| b.iter().map(|&x| x as u32).sum::<u32>()), Some(48));
    }

    #[test]
    fn discardable_blocks_come_from_the_factory() {
        let pool = DiscardableMemoryPool::new(1 << 20);
        let cache = CacheBuilder::new()
            .discardable(pool.factory())
            .bus(Arc::new(MessageBus::new()))
            .build();
        let block = cache.new_cached_block(64).unwrap();
        assert_eq!(pool.ram_used(), 64);
        cache.add(Box::new(BlockRec {
            key: key(3, 3),
            hold: block.attach_to_cache(),
        }));
        drop(block);

        let mut dump = CollectingDump::default();
        cache.dump_memory_statistics(&mut dump);
        assert_eq!(dump.total("discardable_size"), 64);
        assert_eq!(dump.discardable_backed.len(), 1);
        assert!(dump.values[0].dump_name.starts_with("rescache/block_"));

        cache.purge_all();
        assert_eq!(pool.ram_used(), 0);
    }

    #[test]
    fn failed_block_allocation_returns_none() {
        let exhausted: DiscardableFactory =
            Arc::new(|_: usize| -> Option<Box<dyn DiscardableMemory>> { None });
        let cache = CacheBuilder::new()
            .discardable(exhausted)
            .bus(Arc::new(MessageBus::new()))
            .build();
        cache.add(rec(4, 1, 10));
        cache.purge_bus().post(PurgeSharedIdMessage::new(4));

        assert!(cache.new_cached_block(16).is_none());
        // the allocation path still drains pending purges
        assert_eq!(cache.len(), 0);

        #[cfg(feature = "metrics")]
        {
            let snapshot = cache.metrics_snapshot();
            assert_eq!(snapshot.block_alloc_failures, 1);
            assert_eq!(snapshot.block_allocs, 0);
        }
    }

    #[test]
    fn memory_statistics_report_heap_records() {
        let cache = heap_cache(1000);
        cache.add(rec(1, 1, 10));
        cache.add(rec(1, 2, 20));

        let mut detailed = CollectingDump::default();
        cache.dump_memory_statistics(&mut detailed);
        assert_eq!(detailed.total("size"), 30);
        assert_eq!(detailed.heap_backed.len(), 2);

        let mut light = CollectingDump::new(LevelOfDetail::Light);
        cache.dump_memory_statistics(&mut light);
        assert_eq!(light.values.len(), 1);
        assert_eq!(light.total("size"), 30);
    }

    #[test]
    fn dump_reports_totals() {
        let cache = heap_cache(500);
        cache.add(rec(1, 1, 40));
        let summary = cache.dump();
        assert_eq!(summary.count, 1);
        assert_eq!(summary.total_bytes, 40);
        assert_eq!(summary.total_byte_limit, 500);
        assert!(!summary.discardable);
        assert_eq!(summary.count_limit, None);
    }

    #[test]
    fn debug_lists_totals() {
        let cache = heap_cache(500);
        let text = format!("{cache:?}");
        assert!(text.contains("total_byte_limit: 500"));
    }

    mod property_tests {
        use proptest::prelude::*;

        use super::*;

        #[derive(Debug, Clone)]
        enum Op {
            Add { word: u32, bytes: usize, shared: u64 },
            Find(u32),
            Stale(u32),
            PurgeShared(u64),
        }

        fn op_strategy() -> impl Strategy<Value = Op> {
            prop_oneof![
                (0u32..20, 1usize..200, 1u64..4)
                    .prop_map(|(word, bytes, shared)| Op::Add { word, bytes, shared }),
                (0u32..20).prop_map(Op::Find),
                (0u32..20).prop_map(Op::Stale),
                (1u64..4).prop_map(Op::PurgeShared),
            ]
        }

        fn key_any(cache: &ResourceCache, word: u32) -> Option<CacheKey> {
            let mut found = None;
            cache.visit_all(|r| {
                if r.downcast_ref::<TestRec>().is_some_and(|t| t.tag == word) {
                    found = Some(r.key().clone());
                }
            });
            found
        }

        proptest! {
            #[cfg_attr(miri, ignore)]
            #[test]
            fn prop_invariants_and_budget_hold(
                limit in 100usize..2000,
                ops in prop::collection::vec(op_strategy(), 0..120)
            ) {
                let cache = heap_cache(limit);
                for op in ops {
                    match op {
                        Op::Add { word, bytes, shared } => {
                            cache.add(rec(shared, word, bytes));
                        },
                        Op::Find(word) => {
                            if let Some(k) = key_any(&cache, word) {
                                prop_assert!(cache.find(&k, |_| true));
                            }
                        },
                        Op::Stale(word) => {
                            if let Some(k) = key_any(&cache, word) {
                                prop_assert!(!cache.find(&k, |_| false));
                            }
                        },
                        Op::PurgeShared(shared) => {
                            cache.purge_shared_id(shared);
                        },
                    }
                    prop_assert!(cache.check_invariants().is_ok());
                    prop_assert!(cache.total_bytes_used() <= limit);
                }
            }

            #[cfg_attr(miri, ignore)]
            #[test]
            fn prop_least_recently_touched_is_evicted_first(
                touches in prop::collection::vec(0u32..8, 0..40)
            ) {
                let cache = heap_cache(800);
                for word in 0..8 {
                    cache.add(rec(1, word, 100));
                }
                let mut recency: Vec<u32> = (0..8).rev().collect();
                for word in touches {
                    prop_assert!(cache.find(&key(1, word), |_| true));
                    recency.retain(|&w| w != word);
                    recency.insert(0, word);
                }
                prop_assert_eq!(order(&cache), recency.clone());

                cache.add(rec(1, 100, 100));
                let coldest = *recency.last().unwrap();
                prop_assert!(!cache.contains(&key(1, coldest)));
                prop_assert_eq!(cache.len(), 8);
            }
        }
    }
}

//! Budgeted pool of discardable allocations.
//!
//! The pool owns the bytes of every *unlocked* allocation and keeps all
//! allocations on a recency list. While RAM in use exceeds the budget, the
//! coldest unlocked allocations are freed; a later `lock()` on one of them
//! fails. Locked allocations are never reclaimed, so the pool can sit over
//! budget while enough memory is pinned.
//!
//! ```text
//!   PoolMemory (client side)          DiscardableMemoryPool
//!   ┌───────────────────────┐         ┌───────────────────────────────────┐
//!   │ data: Some(bytes)     │ unlock  │ entries: IntrusiveList<PoolEntry> │
//!   │   (locked)            │ ──────► │   Unlocked(bytes) ... Locked ...  │
//!   │ data: None            │ ◄────── │ used / budget                     │
//!   │   (unlocked)          │  lock   │                                   │
//!   └───────────────────────┘         └───────────────────────────────────┘
//! ```
//!
//! Bytes move into the handle on `lock` and back into the pool on `unlock`,
//! so the pool never touches memory a client can currently see.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::discardable::{DiscardableFactory, DiscardableMemory};
use crate::ds::{IntrusiveList, SlotId};
use crate::error::InvariantError;

#[derive(Debug)]
enum EntryState {
    Locked,
    Unlocked(Box<[u8]>),
}

#[derive(Debug)]
struct PoolEntry {
    serial: u64,
    bytes: usize,
    state: EntryState,
}

#[derive(Debug)]
struct PoolState {
    entries: IntrusiveList<PoolEntry>,
    budget: usize,
    used: usize,
    next_serial: u64,
    lock_hits: u64,
    lock_misses: u64,
    reclaimed: u64,
}

impl PoolState {
    fn entry_mut(&mut self, slot: SlotId, serial: u64) -> Option<&mut PoolEntry> {
        self.entries
            .get_mut(slot)
            .filter(|entry| entry.serial == serial)
    }

    /// Frees unlocked allocations, coldest first, until `used <= target`.
    fn dump_down_to(&mut self, target: usize) {
        let mut current = self.entries.back_id();
        while let Some(id) = current {
            if self.used <= target {
                break;
            }
            current = self.entries.prev_id(id);
            let unlocked = self
                .entries
                .get(id)
                .is_some_and(|entry| matches!(entry.state, EntryState::Unlocked(_)));
            if unlocked {
                if let Some(entry) = self.entries.remove(id) {
                    self.used -= entry.bytes;
                    self.reclaimed += 1;
                    trace!(bytes = entry.bytes, "discardable allocation reclaimed");
                }
            }
        }
    }
}

/// Counters describing pool activity.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub lock_hits: u64,
    pub lock_misses: u64,
    pub reclaimed: u64,
    pub allocations: usize,
    pub ram_used: usize,
    pub ram_budget: usize,
}

/// Reclaiming allocator handing out [`PoolMemory`] blocks.
pub struct DiscardableMemoryPool {
    state: Mutex<PoolState>,
}

impl DiscardableMemoryPool {
    pub fn new(budget: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(PoolState {
                entries: IntrusiveList::new(),
                budget,
                used: 0,
                next_serial: 1,
                lock_hits: 0,
                lock_misses: 0,
                reclaimed: 0,
            }),
        })
    }

    /// Allocates `bytes` of zeroed, locked memory. `None` if the allocation fails.
    pub fn create(self: &Arc<Self>, bytes: usize) -> Option<PoolMemory> {
        let mut buf = Vec::new();
        if buf.try_reserve_exact(bytes).is_err() {
            debug!(bytes, "discardable pool allocation failed");
            return None;
        }
        buf.resize(bytes, 0u8);

        let mut state = self.state.lock();
        let serial = state.next_serial;
        state.next_serial += 1;
        let slot = state.entries.push_front(PoolEntry {
            serial,
            bytes,
            state: EntryState::Locked,
        });
        state.used += bytes;
        let budget = state.budget;
        state.dump_down_to(budget);
        drop(state);

        Some(PoolMemory {
            pool: Arc::clone(self),
            slot,
            serial,
            size: bytes,
            data: Some(buf.into_boxed_slice()),
        })
    }

    /// A factory suitable for a discardable-backed cache.
    pub fn factory(self: &Arc<Self>) -> DiscardableFactory {
        let pool = Arc::clone(self);
        Arc::new(move |bytes| {
            pool.create(bytes)
                .map(|memory| Box::new(memory) as Box<dyn DiscardableMemory>)
        })
    }

    pub fn ram_used(&self) -> usize {
        self.state.lock().used
    }

    pub fn ram_budget(&self) -> usize {
        self.state.lock().budget
    }

    /// Changes the budget, reclaiming immediately if it shrank below usage.
    pub fn set_ram_budget(&self, budget: usize) {
        let mut state = self.state.lock();
        state.budget = budget;
        state.dump_down_to(budget);
    }

    /// Frees every unlocked allocation.
    pub fn dump_pool(&self) {
        let mut state = self.state.lock();
        state.dump_down_to(0);
        debug!(ram_used = state.used, "discardable pool dumped");
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            lock_hits: state.lock_hits,
            lock_misses: state.lock_misses,
            reclaimed: state.reclaimed,
            allocations: state.entries.len(),
            ram_used: state.used,
            ram_budget: state.budget,
        }
    }

    pub fn check_invariants(&self) -> Result<(), InvariantError> {
        let state = self.state.lock();
        state.entries.check_links()?;
        let total: usize = state.entries.iter().map(|entry| entry.bytes).sum();
        if total != state.used {
            return Err(InvariantError::new(format!(
                "pool accounts {} bytes but entries hold {total}",
                state.used
            )));
        }
        Ok(())
    }

    fn lock_entry(&self, slot: SlotId, serial: u64) -> Option<Box<[u8]>> {
        let mut state = self.state.lock();
        let taken = state.entry_mut(slot, serial).and_then(|entry| {
            match std::mem::replace(&mut entry.state, EntryState::Locked) {
                EntryState::Unlocked(bytes) => Some(bytes),
                EntryState::Locked => None,
            }
        });
        match taken {
            Some(bytes) => {
                state.entries.move_to_front(slot);
                state.lock_hits += 1;
                Some(bytes)
            },
            None => {
                state.lock_misses += 1;
                None
            },
        }
    }

    fn unlock_entry(&self, slot: SlotId, serial: u64, bytes: Box<[u8]>) {
        let mut state = self.state.lock();
        if let Some(entry) = state.entry_mut(slot, serial) {
            entry.state = EntryState::Unlocked(bytes);
        }
        let budget = state.budget;
        state.dump_down_to(budget);
    }

    fn release(&self, slot: SlotId, serial: u64) {
        let mut state = self.state.lock();
        if state.entry_mut(slot, serial).is_some() {
            if let Some(entry) = state.entries.remove(slot) {
                state.used -= entry.bytes;
            }
        }
    }
}

impl fmt::Debug for DiscardableMemoryPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stats = self.stats();
        f.debug_struct("DiscardableMemoryPool")
            .field("allocations", &stats.allocations)
            .field("ram_used", &stats.ram_used)
            .field("ram_budget", &stats.ram_budget)
            .finish()
    }
}

/// One allocation from a [`DiscardableMemoryPool`].
pub struct PoolMemory {
    pool: Arc<DiscardableMemoryPool>,
    slot: SlotId,
    serial: u64,
    size: usize,
    data: Option<Box<[u8]>>,
}

impl PoolMemory {
    pub fn is_locked(&self) -> bool {
        self.data.is_some()
    }
}

impl DiscardableMemory for PoolMemory {
    fn lock(&mut self) -> bool {
        if self.data.is_some() {
            debug_assert!(false, "PoolMemory locked twice");
            return true;
        }
        self.data = self.pool.lock_entry(self.slot, self.serial);
        self.data.is_some()
    }

    fn data(&mut self) -> Option<&mut [u8]> {
        self.data.as_deref_mut()
    }

    fn unlock(&mut self) {
        if let Some(bytes) = self.data.take() {
            self.pool.unlock_entry(self.slot, self.serial, bytes);
        }
    }

    fn size(&self) -> usize {
        self.size
    }
}

impl Drop for PoolMemory {
    fn drop(&mut self) {
        self.data = None;
        self.pool.release(self.slot, self.serial);
    }
}

impl fmt::Debug for PoolMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolMemory")
            .field("size", &self.size)
            .field("locked", &self.is_locked())
            .finish()
    }
}

//! Doubly linked recency list backed by `SlotArena`.
//!
//! Nodes live in a [`SlotArena`] and link to each other by [`SlotId`], so a
//! record can be promoted or unlinked in O(1) given only its id, with no raw
//! pointers involved.
//!
//! ```text
//!   head (MRU) ─► [id_4] ◄──► [id_1] ◄──► [id_7] ◄── tail (LRU)
//! ```
//!
//! Eviction walks start at the tail and step towards the head with
//! [`IntrusiveList::prev_id`]; the previous id is read before the current node
//! is removed, which keeps the walk valid across removals.

use crate::ds::slot_arena::{SlotArena, SlotId};
use crate::error::InvariantError;

#[derive(Debug)]
struct Node<T> {
    value: T,
    prev: Option<SlotId>,
    next: Option<SlotId>,
}

/// Recency-ordered list whose nodes are addressed by `SlotId`.
#[derive(Debug)]
pub struct IntrusiveList<T> {
    arena: SlotArena<Node<T>>,
    head: Option<SlotId>,
    tail: Option<SlotId>,
}

impl<T> IntrusiveList<T> {
    pub fn new() -> Self {
        Self {
            arena: SlotArena::new(),
            head: None,
            tail: None,
        }
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    pub fn contains(&self, id: SlotId) -> bool {
        self.arena.contains(id)
    }

    /// Id of the least recently used node.
    pub fn back_id(&self) -> Option<SlotId> {
        self.tail
    }

    /// Id of the node one step closer to the head than `id`.
    pub fn prev_id(&self, id: SlotId) -> Option<SlotId> {
        self.arena.get(id).and_then(|node| node.prev)
    }

    pub fn get(&self, id: SlotId) -> Option<&T> {
        self.arena.get(id).map(|node| &node.value)
    }

    pub fn get_mut(&mut self, id: SlotId) -> Option<&mut T> {
        self.arena.get_mut(id).map(|node| &mut node.value)
    }

    /// Iterates values from head (MRU) to tail (LRU).
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.iter_entries().map(|(_, value)| value)
    }

    /// Iterates `(SlotId, &T)` from head (MRU) to tail (LRU).
    pub fn iter_entries(&self) -> Entries<'_, T> {
        Entries {
            list: self,
            current: self.head,
        }
    }

    /// Links `value` in as the new head and returns its id.
    pub fn push_front(&mut self, value: T) -> SlotId {
        let id = self.arena.insert(Node {
            value,
            prev: None,
            next: None,
        });
        self.attach_front(id);
        id
    }

    /// Unlinks `id` and hands its value back.
    pub fn remove(&mut self, id: SlotId) -> Option<T> {
        self.detach(id)?;
        self.arena.remove(id).map(|node| node.value)
    }

    /// Promotes `id` to the head; `false` if `id` is not in the list.
    pub fn move_to_front(&mut self, id: SlotId) -> bool {
        if !self.arena.contains(id) {
            return false;
        }
        if self.head != Some(id) {
            self.detach(id);
            self.attach_front(id);
        }
        true
    }

    fn detach(&mut self, id: SlotId) -> Option<()> {
        let (prev, next) = {
            let node = self.arena.get(id)?;
            (node.prev, node.next)
        };

        match prev {
            Some(prev_id) => {
                if let Some(prev_node) = self.arena.get_mut(prev_id) {
                    prev_node.next = next;
                }
            },
            None => self.head = next,
        }

        match next {
            Some(next_id) => {
                if let Some(next_node) = self.arena.get_mut(next_id) {
                    next_node.prev = prev;
                }
            },
            None => self.tail = prev,
        }

        if let Some(node) = self.arena.get_mut(id) {
            node.prev = None;
            node.next = None;
        }
        Some(())
    }

    fn attach_front(&mut self, id: SlotId) {
        let old_head = self.head;
        if let Some(node) = self.arena.get_mut(id) {
            node.prev = None;
            node.next = old_head;
        }
        match old_head.and_then(|head| self.arena.get_mut(head)) {
            Some(head_node) => head_node.prev = Some(id),
            None => self.tail = Some(id),
        }
        self.head = Some(id);
    }

    /// Walks the links head to tail and checks they agree with the arena.
    pub fn check_links(&self) -> Result<(), InvariantError> {
        if self.head.is_none() || self.tail.is_none() {
            if self.head.is_some() || self.tail.is_some() || !self.is_empty() {
                return Err(InvariantError::new("head/tail disagree on emptiness"));
            }
            return Ok(());
        }

        let mut count = 0usize;
        let mut prev = None;
        let mut current = self.head;
        while let Some(id) = current {
            let node = self
                .arena
                .get(id)
                .ok_or_else(|| InvariantError::new(format!("dangling link to slot {}", id.0)))?;
            if node.prev != prev {
                return Err(InvariantError::new(format!(
                    "slot {} has a stale prev link",
                    id.0
                )));
            }
            count += 1;
            if count > self.len() {
                return Err(InvariantError::new("cycle in recency list"));
            }
            if node.next.is_none() && self.tail != Some(id) {
                return Err(InvariantError::new("list ends before the tail"));
            }
            prev = Some(id);
            current = node.next;
        }

        if count != self.len() {
            return Err(InvariantError::new(format!(
                "list walk saw {count} nodes, arena holds {}",
                self.len()
            )));
        }
        Ok(())
    }
}

impl<T> Default for IntrusiveList<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterator over `(SlotId, &T)` pairs from head to tail.
pub struct Entries<'a, T> {
    list: &'a IntrusiveList<T>,
    current: Option<SlotId>,
}

impl<'a, T> Iterator for Entries<'a, T> {
    type Item = (SlotId, &'a T);

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.current?;
        let node = self.list.arena.get(id)?;
        self.current = node.next;
        Some((id, &node.value))
    }
}

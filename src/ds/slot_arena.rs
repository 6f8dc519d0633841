//! Slab storage with stable indices.
//!
//! `SlotArena` hands out a [`SlotId`] for every inserted value. The id stays
//! valid until that value is removed, after which the slot is recycled by a
//! later insert, so an id must not outlive the value it was issued for.
//!
//! Vacant slots form a chain threaded through the slots themselves, most
//! recently vacated first, so recycling needs no side allocation.

/// Stable handle into a [`SlotArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(pub(crate) usize);

impl SlotId {
    /// Returns the raw slot index.
    #[inline]
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug)]
enum Slot<T> {
    Occupied(T),
    Vacant { next_vacant: Option<usize> },
}

/// Slots plus the head of the vacancy chain.
#[derive(Debug)]
pub struct SlotArena<T> {
    slots: Vec<Slot<T>>,
    first_vacant: Option<usize>,
    occupied: usize,
}

impl<T> SlotArena<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            first_vacant: None,
            occupied: 0,
        }
    }

    /// Stores `value` in the most recently vacated slot, or a new one.
    pub fn insert(&mut self, value: T) -> SlotId {
        self.occupied += 1;
        if let Some(idx) = self.first_vacant {
            let slot = std::mem::replace(&mut self.slots[idx], Slot::Occupied(value));
            if let Slot::Vacant { next_vacant } = slot {
                self.first_vacant = next_vacant;
            }
            return SlotId(idx);
        }
        self.slots.push(Slot::Occupied(value));
        SlotId(self.slots.len() - 1)
    }

    /// Takes the value out of `id`; `None` if the slot is already vacant.
    pub fn remove(&mut self, id: SlotId) -> Option<T> {
        let slot = self.slots.get_mut(id.0)?;
        if matches!(slot, Slot::Vacant { .. }) {
            return None;
        }
        let vacated = Slot::Vacant {
            next_vacant: self.first_vacant,
        };
        match std::mem::replace(slot, vacated) {
            Slot::Occupied(value) => {
                self.first_vacant = Some(id.0);
                self.occupied -= 1;
                Some(value)
            },
            Slot::Vacant { .. } => None,
        }
    }

    #[inline]
    pub fn get(&self, id: SlotId) -> Option<&T> {
        match self.slots.get(id.0)? {
            Slot::Occupied(value) => Some(value),
            Slot::Vacant { .. } => None,
        }
    }

    #[inline]
    pub fn get_mut(&mut self, id: SlotId) -> Option<&mut T> {
        match self.slots.get_mut(id.0)? {
            Slot::Occupied(value) => Some(value),
            Slot::Vacant { .. } => None,
        }
    }

    #[inline]
    pub fn contains(&self, id: SlotId) -> bool {
        self.get(id).is_some()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.occupied
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.occupied == 0
    }
}

impl<T> Default for SlotArena<T> {
    fn default() -> Self {
        Self::new()
    }
}

//! Slotted arena with cookie-validated handles.
//!
//! Nodes live in a `Vec` of slots; a [`Handle`] is a slot index plus the
//! cookie the slot carried when the value was inserted. Removing a value
//! bumps the slot cookie, so handles to removed values go stale instead of
//! aliasing whatever occupies the slot next. The free list doubles as the
//! block pool: removed slots are reused before the backing vector grows.
//!
//! Lookups through stale handles return `None` and the caller maps that to
//! its own error. `remove` of a stale handle panics: by the reference
//! counting protocol a remove only happens while the caller provably owns
//! the node, so a stale handle there is a bookkeeping bug.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

/// Index plus cookie naming one value in a [`SlotArena`].
pub struct Handle<T> {
    index: u32,
    cookie: u32,
    _marker: PhantomData<fn() -> T>,
}

// Manual impls: derives would bound on `T`, but a handle is always plain
// data regardless of what it points at.
impl<T> Copy for Handle<T> {}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && self.cookie == other.cookie
    }
}

impl<T> Eq for Handle<T> {}

impl<T> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.index.hash(state);
        self.cookie.hash(state);
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({}#{})", self.index, self.cookie)
    }
}

impl<T> Handle<T> {
    /// Slot index, stable for the lifetime of the value.
    pub fn index(self) -> u32 {
        self.index
    }

    /// Raw parts for embedding in serializable cookies.
    pub fn raw(self) -> (u32, u32) {
        (self.index, self.cookie)
    }

    /// Rebuild from parts produced by [`Handle::raw`]. The handle is only
    /// as valid as the parts; lookups still go through cookie validation.
    pub fn from_raw(index: u32, cookie: u32) -> Self {
        Self {
            index,
            cookie,
            _marker: PhantomData,
        }
    }
}

enum Slot<T> {
    Occupied { cookie: u32, value: T },
    Vacant { cookie: u32 },
}

/// Generational slot arena. See the module docs for the handle contract.
pub struct SlotArena<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    live: u32,
}

impl<T> SlotArena<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            free: Vec::new(),
            live: 0,
        }
    }

    pub fn len(&self) -> u32 {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Store `value`, reusing a vacated slot when one exists.
    pub fn insert(&mut self, value: T) -> Handle<T> {
        let handle = if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            let cookie = match slot {
                Slot::Vacant { cookie } => *cookie,
                Slot::Occupied { .. } => unreachable!("free list entry points at occupied slot"),
            };
            *slot = Slot::Occupied { cookie, value };
            Handle::from_raw(index, cookie)
        } else {
            assert!(
                self.slots.len() < u32::MAX as usize,
                "arena exceeds u32 index space"
            );
            let index = self.slots.len() as u32;
            self.slots.push(Slot::Occupied { cookie: 0, value });
            Handle::from_raw(index, 0)
        };
        self.live += 1;
        handle
    }

    pub fn get(&self, handle: Handle<T>) -> Option<&T> {
        match self.slots.get(handle.index as usize) {
            Some(Slot::Occupied { cookie, value }) if *cookie == handle.cookie => Some(value),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, handle: Handle<T>) -> Option<&mut T> {
        match self.slots.get_mut(handle.index as usize) {
            Some(Slot::Occupied { cookie, value }) if *cookie == handle.cookie => Some(value),
            _ => None,
        }
    }

    pub fn contains(&self, handle: Handle<T>) -> bool {
        self.get(handle).is_some()
    }

    /// Remove and return the value. Panics if the handle is stale; removal
    /// is only legal while the caller owns the node.
    pub fn remove(&mut self, handle: Handle<T>) -> T {
        let slot = self
            .slots
            .get_mut(handle.index as usize)
            .unwrap_or_else(|| panic!("remove: handle index {} out of range", handle.index));
        match slot {
            Slot::Occupied { cookie, .. } if *cookie == handle.cookie => {
                let next_cookie = cookie.wrapping_add(1);
                let old = std::mem::replace(slot, Slot::Vacant { cookie: next_cookie });
                self.free.push(handle.index);
                assert!(self.live > 0, "remove with zero live values");
                self.live -= 1;
                match old {
                    Slot::Occupied { value, .. } => value,
                    Slot::Vacant { .. } => unreachable!(),
                }
            }
            _ => panic!("remove: stale handle {:?}", handle),
        }
    }

    /// Visit every live value in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (Handle<T>, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| match slot {
                Slot::Occupied { cookie, value } => {
                    Some((Handle::from_raw(index as u32, *cookie), value))
                }
                Slot::Vacant { .. } => None,
            })
    }
}

impl<T> Default for SlotArena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: fmt::Debug> fmt::Debug for SlotArena<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.iter().map(|(h, v)| (h, v)))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_then_get() {
        let mut arena = SlotArena::new();
        let h = arena.insert("alpha");
        assert_eq!(arena.get(h), Some(&"alpha"));
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn remove_makes_handle_stale() {
        let mut arena = SlotArena::new();
        let h = arena.insert(7u32);
        assert_eq!(arena.remove(h), 7);
        assert_eq!(arena.get(h), None);
        assert!(!arena.contains(h));
        assert!(arena.is_empty());
    }

    #[test]
    fn slot_reuse_does_not_alias_old_handles() {
        let mut arena = SlotArena::new();
        let first = arena.insert(1u32);
        arena.remove(first);
        let second = arena.insert(2u32);
        // Same slot, different cookie.
        assert_eq!(first.index(), second.index());
        assert_ne!(first, second);
        assert_eq!(arena.get(first), None);
        assert_eq!(arena.get(second), Some(&2));
    }

    #[test]
    fn get_mut_updates_in_place() {
        let mut arena = SlotArena::new();
        let h = arena.insert(vec![1, 2]);
        if let Some(v) = arena.get_mut(h) {
            v.push(3);
        }
        assert_eq!(arena.get(h), Some(&vec![1, 2, 3]));
    }

    #[test]
    fn iter_skips_vacant_slots() {
        let mut arena = SlotArena::new();
        let a = arena.insert("a");
        let b = arena.insert("b");
        let c = arena.insert("c");
        arena.remove(b);
        let seen: Vec<_> = arena.iter().map(|(h, v)| (h, *v)).collect();
        assert_eq!(seen, vec![(a, "a"), (c, "c")]);
    }

    #[test]
    fn free_list_drains_before_growth() {
        let mut arena = SlotArena::new();
        let handles: Vec<_> = (0..4u32).map(|n| arena.insert(n)).collect();
        for h in &handles {
            arena.remove(*h);
        }
        for n in 0..4u32 {
            let h = arena.insert(n);
            assert!(h.index() < 4, "expected slot reuse, got index {}", h.index());
        }
        assert_eq!(arena.len(), 4);
    }

    #[test]
    fn raw_round_trip() {
        let mut arena = SlotArena::new();
        let h = arena.insert(42u32);
        let (index, cookie) = h.raw();
        let rebuilt: Handle<u32> = Handle::from_raw(index, cookie);
        assert_eq!(arena.get(rebuilt), Some(&42));
    }

    #[test]
    #[should_panic(expected = "remove: stale handle")]
    fn double_remove_panics() {
        let mut arena = SlotArena::new();
        let h = arena.insert(1u32);
        arena.remove(h);
        arena.remove(h);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn remove_of_never_issued_handle_panics() {
        let mut arena: SlotArena<u32> = SlotArena::new();
        arena.remove(Handle::from_raw(9, 0));
    }
}

//! Index-tracked priority queue over arena handles.
//!
//! A binary min-heap ordered by `(priority, order)`: lower priority values
//! run first, and `order` (a per-queue insertion counter) breaks ties so
//! equal-priority entries leave in FIFO order. The heap stores handles plus
//! their queued priority; the node itself carries only its current heap
//! index, written back on every swap through the [`ReadySlot`] impl. That
//! index is the single source of truth for "is this node queued here":
//! [`UNQUEUED`] means off-queue, anything else is a live heap position.
//!
//! A node type can sit on several queues at once by implementing
//! `ReadySlot` for a distinct tag per queue. The tag is phantom; it only
//! keeps the seat fields from being mixed up at compile time.

use std::marker::PhantomData;

use crate::stdx::arena::{Handle, SlotArena};

/// Seat value for a node that is not on the queue.
pub const UNQUEUED: u32 = u32::MAX;

/// Access to the seat field a queue with tag `Tag` maintains on the node.
pub trait ReadySlot<Tag> {
    fn seat(&self) -> u32;
    fn set_seat(&mut self, seat: u32);
}

struct Entry<T> {
    handle: Handle<T>,
    priority: u32,
    order: u64,
}

impl<T> Entry<T> {
    fn key(&self) -> (u32, u64) {
        (self.priority, self.order)
    }
}

/// Min-heap of arena handles with positional write-back.
pub struct ReadyQueue<T, Tag>
where
    T: ReadySlot<Tag>,
{
    entries: Vec<Entry<T>>,
    next_order: u64,
    _tag: PhantomData<fn() -> Tag>,
}

impl<T, Tag> ReadyQueue<T, Tag>
where
    T: ReadySlot<Tag>,
{
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            next_order: 0,
            _tag: PhantomData,
        }
    }

    pub fn len(&self) -> u32 {
        self.entries.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn head(&self) -> Option<Handle<T>> {
        self.entries.first().map(|e| e.handle)
    }

    pub fn head_entry(&self) -> Option<(Handle<T>, u32)> {
        self.entries.first().map(|e| (e.handle, e.priority))
    }

    pub fn head_priority(&self) -> Option<u32> {
        self.entries.first().map(|e| e.priority)
    }

    /// Priority of the entry a node's seat points at.
    pub fn priority_at(&self, seat: u32) -> u32 {
        assert!(
            (seat as usize) < self.entries.len(),
            "priority_at: seat {seat} out of range"
        );
        self.entries[seat as usize].priority
    }

    /// Seat `handle` at `priority`. Panics if the node is already seated on
    /// this queue; callers reorder with [`ReadyQueue::reprioritize`].
    pub fn insert(&mut self, arena: &mut SlotArena<T>, handle: Handle<T>, priority: u32) {
        let node = arena
            .get_mut(handle)
            .unwrap_or_else(|| panic!("insert: stale handle {handle:?}"));
        assert!(
            node.seat() == UNQUEUED,
            "insert: node already seated at {}",
            node.seat()
        );
        let index = self.entries.len() as u32;
        node.set_seat(index);
        self.entries.push(Entry {
            handle,
            priority,
            order: self.next_order,
        });
        self.next_order += 1;
        self.sift_up(arena, index as usize);
    }

    /// Remove and return the head entry with its queued priority.
    pub fn pop(&mut self, arena: &mut SlotArena<T>) -> Option<(Handle<T>, u32)> {
        if self.entries.is_empty() {
            return None;
        }
        let last = self.entries.len() - 1;
        self.entries.swap(0, last);
        let entry = self.entries.pop().unwrap_or_else(|| unreachable!());
        self.unseat(arena, entry.handle);
        if !self.entries.is_empty() {
            self.reseat(arena, 0);
            self.sift_down(arena, 0);
        }
        Some((entry.handle, entry.priority))
    }

    /// Remove an arbitrary seated node. Panics if the node's seat does not
    /// point back at this queue; membership must be checked by the caller
    /// through the seat field.
    pub fn remove(&mut self, arena: &mut SlotArena<T>, handle: Handle<T>) {
        let seat = arena
            .get(handle)
            .unwrap_or_else(|| panic!("remove: stale handle {handle:?}"))
            .seat();
        assert!(seat != UNQUEUED, "remove: node not seated");
        let index = seat as usize;
        assert!(
            self.entries[index].handle == handle,
            "remove: seat does not match queue entry"
        );
        let last = self.entries.len() - 1;
        self.entries.swap(index, last);
        let entry = self.entries.pop().unwrap_or_else(|| unreachable!());
        self.unseat(arena, entry.handle);
        if index < self.entries.len() {
            self.reseat(arena, index);
            // The displaced entry may need to move either direction.
            self.sift_down(arena, index);
            self.sift_up(arena, index);
        }
    }

    /// Change a seated node's priority in place, preserving its insertion
    /// order for FIFO tie-breaks.
    pub fn reprioritize(&mut self, arena: &mut SlotArena<T>, handle: Handle<T>, priority: u32) {
        let seat = arena
            .get(handle)
            .unwrap_or_else(|| panic!("reprioritize: stale handle {handle:?}"))
            .seat();
        assert!(seat != UNQUEUED, "reprioritize: node not seated");
        let index = seat as usize;
        assert!(
            self.entries[index].handle == handle,
            "reprioritize: seat does not match queue entry"
        );
        self.entries[index].priority = priority;
        self.sift_up(arena, index);
        self.sift_down(arena, index);
    }

    /// Heap-shape and seat-consistency check for tests.
    pub fn check(&self, arena: &SlotArena<T>) {
        for (i, entry) in self.entries.iter().enumerate() {
            if i > 0 {
                let parent = (i - 1) / 2;
                assert!(
                    self.entries[parent].key() <= entry.key(),
                    "heap order violated at {i}"
                );
            }
            let node = arena.get(entry.handle).unwrap_or_else(|| {
                panic!("queue entry {i} holds stale handle {:?}", entry.handle)
            });
            assert!(
                node.seat() == i as u32,
                "seat write-back out of sync at {i}: node says {}",
                node.seat()
            );
        }
    }

    fn unseat(&self, arena: &mut SlotArena<T>, handle: Handle<T>) {
        if let Some(node) = arena.get_mut(handle) {
            node.set_seat(UNQUEUED);
        }
    }

    fn reseat(&self, arena: &mut SlotArena<T>, index: usize) {
        let handle = self.entries[index].handle;
        if let Some(node) = arena.get_mut(handle) {
            node.set_seat(index as u32);
        }
    }

    fn sift_up(&mut self, arena: &mut SlotArena<T>, mut index: usize) {
        while index > 0 {
            let parent = (index - 1) / 2;
            if self.entries[parent].key() <= self.entries[index].key() {
                break;
            }
            self.entries.swap(parent, index);
            self.reseat(arena, parent);
            self.reseat(arena, index);
            index = parent;
        }
    }

    fn sift_down(&mut self, arena: &mut SlotArena<T>, mut index: usize) {
        let len = self.entries.len();
        loop {
            let left = 2 * index + 1;
            if left >= len {
                break;
            }
            let right = left + 1;
            let mut smallest = left;
            if right < len && self.entries[right].key() < self.entries[left].key() {
                smallest = right;
            }
            if self.entries[index].key() <= self.entries[smallest].key() {
                break;
            }
            self.entries.swap(index, smallest);
            self.reseat(arena, index);
            self.reseat(arena, smallest);
            index = smallest;
        }
    }
}

impl<T, Tag> Default for ReadyQueue<T, Tag>
where
    T: ReadySlot<Tag>,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    enum TestSeat {}

    struct Job {
        name: &'static str,
        seat: u32,
    }

    impl Job {
        fn new(name: &'static str) -> Self {
            Self {
                name,
                seat: UNQUEUED,
            }
        }
    }

    impl ReadySlot<TestSeat> for Job {
        fn seat(&self) -> u32 {
            self.seat
        }
        fn set_seat(&mut self, seat: u32) {
            self.seat = seat;
        }
    }

    fn drain(
        queue: &mut ReadyQueue<Job, TestSeat>,
        arena: &mut SlotArena<Job>,
    ) -> Vec<&'static str> {
        let mut out = Vec::new();
        while let Some((h, _)) = queue.pop(arena) {
            out.push(arena.get(h).unwrap().name);
        }
        out
    }

    // ==================== Ordering ====================

    #[test]
    fn pops_in_priority_order() {
        let mut arena = SlotArena::new();
        let mut queue = ReadyQueue::new();
        for (name, prio) in [("c", 30), ("a", 10), ("d", 40), ("b", 20)] {
            let h = arena.insert(Job::new(name));
            queue.insert(&mut arena, h, prio);
            queue.check(&arena);
        }
        assert_eq!(drain(&mut queue, &mut arena), vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn equal_priority_is_fifo() {
        let mut arena = SlotArena::new();
        let mut queue = ReadyQueue::new();
        for name in ["first", "second", "third"] {
            let h = arena.insert(Job::new(name));
            queue.insert(&mut arena, h, 5);
        }
        assert_eq!(
            drain(&mut queue, &mut arena),
            vec!["first", "second", "third"]
        );
    }

    #[test]
    fn head_matches_pop() {
        let mut arena = SlotArena::new();
        let mut queue = ReadyQueue::new();
        let low = arena.insert(Job::new("low"));
        let high = arena.insert(Job::new("high"));
        queue.insert(&mut arena, high, 100);
        queue.insert(&mut arena, low, 1);
        assert_eq!(queue.head(), Some(low));
        assert_eq!(queue.head_priority(), Some(1));
        let (popped, prio) = queue.pop(&mut arena).unwrap();
        assert_eq!(popped, low);
        assert_eq!(prio, 1);
    }

    // ==================== Seat write-back ====================

    #[test]
    fn seat_tracks_membership() {
        let mut arena = SlotArena::new();
        let mut queue = ReadyQueue::new();
        let h = arena.insert(Job::new("x"));
        assert_eq!(arena.get(h).unwrap().seat(), UNQUEUED);
        queue.insert(&mut arena, h, 1);
        assert_ne!(arena.get(h).unwrap().seat(), UNQUEUED);
        queue.pop(&mut arena);
        assert_eq!(arena.get(h).unwrap().seat(), UNQUEUED);
    }

    #[test]
    fn remove_from_middle_keeps_heap_valid() {
        let mut arena = SlotArena::new();
        let mut queue = ReadyQueue::new();
        let handles: Vec<_> = (0..8u32)
            .map(|n| {
                let h = arena.insert(Job::new(["a", "b", "c", "d", "e", "f", "g", "h"][n as usize]));
                queue.insert(&mut arena, h, n * 10);
                h
            })
            .collect();
        queue.remove(&mut arena, handles[3]);
        queue.check(&arena);
        assert_eq!(arena.get(handles[3]).unwrap().seat(), UNQUEUED);
        assert_eq!(
            drain(&mut queue, &mut arena),
            vec!["a", "b", "c", "e", "f", "g", "h"]
        );
    }

    #[test]
    fn reprioritize_moves_both_directions() {
        let mut arena = SlotArena::new();
        let mut queue = ReadyQueue::new();
        let a = arena.insert(Job::new("a"));
        let b = arena.insert(Job::new("b"));
        let c = arena.insert(Job::new("c"));
        queue.insert(&mut arena, a, 10);
        queue.insert(&mut arena, b, 20);
        queue.insert(&mut arena, c, 30);
        queue.reprioritize(&mut arena, c, 1);
        queue.reprioritize(&mut arena, a, 40);
        queue.check(&arena);
        assert_eq!(drain(&mut queue, &mut arena), vec!["c", "b", "a"]);
    }

    #[test]
    fn reprioritize_preserves_fifo_order() {
        let mut arena = SlotArena::new();
        let mut queue = ReadyQueue::new();
        let a = arena.insert(Job::new("a"));
        let b = arena.insert(Job::new("b"));
        queue.insert(&mut arena, a, 10);
        queue.insert(&mut arena, b, 10);
        // Re-assert the same priority; `a` keeps its earlier order stamp.
        queue.reprioritize(&mut arena, a, 10);
        assert_eq!(drain(&mut queue, &mut arena), vec!["a", "b"]);
    }

    #[test]
    fn pop_on_empty_returns_none() {
        let mut arena: SlotArena<Job> = SlotArena::new();
        let mut queue: ReadyQueue<Job, TestSeat> = ReadyQueue::new();
        assert!(queue.pop(&mut arena).is_none());
        assert!(queue.is_empty());
    }

    // ==================== Contract panics ====================

    #[test]
    #[should_panic(expected = "already seated")]
    fn double_insert_panics() {
        let mut arena = SlotArena::new();
        let mut queue = ReadyQueue::new();
        let h = arena.insert(Job::new("x"));
        queue.insert(&mut arena, h, 1);
        queue.insert(&mut arena, h, 2);
    }

    #[test]
    #[should_panic(expected = "not seated")]
    fn remove_of_unseated_panics() {
        let mut arena = SlotArena::new();
        let mut queue: ReadyQueue<Job, TestSeat> = ReadyQueue::new();
        let h = arena.insert(Job::new("x"));
        queue.remove(&mut arena, h);
    }

    // ==================== Model check ====================

    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        use crate::test_utils::proptest_cases;

        #[derive(Debug, Clone)]
        enum Op {
            Insert(u32),
            Pop,
            RemoveNth(usize),
            ReprioritizeNth(usize, u32),
        }

        fn op_strategy() -> impl Strategy<Value = Op> {
            prop_oneof![
                3 => (0u32..64).prop_map(Op::Insert),
                2 => Just(Op::Pop),
                1 => (0usize..16).prop_map(Op::RemoveNth),
                1 => ((0usize..16), (0u32..64)).prop_map(|(n, p)| Op::ReprioritizeNth(n, p)),
            ]
        }

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(proptest_cases(64)))]

            #[test]
            fn matches_sorted_model(ops in proptest::collection::vec(op_strategy(), 1..64)) {
                let mut arena = SlotArena::new();
                let mut queue = ReadyQueue::new();
                // Model: (priority, order, handle) triples kept unsorted;
                // the minimum is recomputed per pop.
                let mut model: Vec<(u32, u64, Handle<Job>)> = Vec::new();
                let mut next_order = 0u64;

                for op in ops {
                    match op {
                        Op::Insert(prio) => {
                            let h = arena.insert(Job::new("node"));
                            queue.insert(&mut arena, h, prio);
                            model.push((prio, next_order, h));
                            next_order += 1;
                        }
                        Op::Pop => {
                            let popped = queue.pop(&mut arena).map(|(h, _)| h);
                            let expect = model
                                .iter()
                                .enumerate()
                                .min_by_key(|(_, (p, o, _))| (*p, *o))
                                .map(|(i, _)| i);
                            match (popped, expect) {
                                (Some(h), Some(i)) => {
                                    prop_assert_eq!(h, model.remove(i).2);
                                }
                                (None, None) => {}
                                other => prop_assert!(false, "pop mismatch: {:?}", other.0),
                            }
                        }
                        Op::RemoveNth(n) => {
                            if !model.is_empty() {
                                let (_, _, h) = model.remove(n % model.len());
                                queue.remove(&mut arena, h);
                            }
                        }
                        Op::ReprioritizeNth(n, prio) => {
                            if !model.is_empty() {
                                let slot = n % model.len();
                                model[slot].0 = prio;
                                let h = model[slot].2;
                                queue.reprioritize(&mut arena, h, prio);
                            }
                        }
                    }
                    queue.check(&arena);
                    prop_assert_eq!(queue.len() as usize, model.len());
                }
            }
        }
    }
}

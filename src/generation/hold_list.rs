//! Two-phase hold list keyed by generation

use super::Generation;
use std::collections::VecDeque;

/// Bytes accounted to an item while it sits on a hold list
pub trait HeldBytes {
    fn byte_size(&self) -> usize;
}

/// Items retired by the writer, waiting until no reader can observe them
///
/// Phase 1 collects items that have no generation yet. `assign_generation`
/// moves them to phase 2 tagged with the given generation, and `reclaim`
/// hands back every phase 2 item whose tag is at or below the oldest
/// generation still in use.
#[derive(Debug)]
pub struct GenerationHoldList<T> {
    phase1: Vec<T>,
    phase2: VecDeque<(Generation, T)>,
    held_bytes: usize,
}

impl<T> Default for GenerationHoldList<T> {
    fn default() -> Self {
        Self {
            phase1: Vec::new(),
            phase2: VecDeque::new(),
            held_bytes: 0,
        }
    }
}

impl<T: HeldBytes> GenerationHoldList<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, item: T) {
        self.held_bytes += item.byte_size();
        self.phase1.push(item);
    }

    /// Tag all unassigned items with `generation`
    pub fn assign_generation(&mut self, generation: Generation) {
        if let Some(&(last, _)) = self.phase2.back() {
            assert!(
                generation >= last,
                "hold list generation went backwards: {} < {}",
                generation,
                last
            );
        }
        self.phase2
            .extend(self.phase1.drain(..).map(|item| (generation, item)));
    }

    /// Release items tagged at or before `oldest_used`
    pub fn reclaim<F>(&mut self, oldest_used: Generation, mut release: F)
    where
        F: FnMut(T),
    {
        while let Some(&(generation, _)) = self.phase2.front() {
            if generation > oldest_used {
                break;
            }
            if let Some((_, item)) = self.phase2.pop_front() {
                self.held_bytes -= item.byte_size();
                release(item);
            }
        }
    }

    /// Release everything, assigned or not
    pub fn reclaim_all<F>(&mut self, mut release: F)
    where
        F: FnMut(T),
    {
        for (_, item) in self.phase2.drain(..) {
            release(item);
        }
        for item in self.phase1.drain(..) {
            release(item);
        }
        self.held_bytes = 0;
    }

    pub fn held_bytes(&self) -> usize {
        self.held_bytes
    }

    pub fn len(&self) -> usize {
        self.phase1.len() + self.phase2.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phase1.is_empty() && self.phase2.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Item(usize);

    impl HeldBytes for Item {
        fn byte_size(&self) -> usize {
            self.0
        }
    }

    #[test]
    fn test_unassigned_items_are_not_reclaimed() {
        let mut list = GenerationHoldList::new();
        list.insert(Item(10));
        let mut released = Vec::new();
        list.reclaim(u64::MAX, |item| released.push(item));
        assert!(released.is_empty());
        assert_eq!(list.held_bytes(), 10);
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_reclaim_up_to_oldest_used() {
        let mut list = GenerationHoldList::new();
        list.insert(Item(1));
        list.assign_generation(3);
        list.insert(Item(2));
        list.insert(Item(4));
        list.assign_generation(5);

        let mut released = Vec::new();
        list.reclaim(2, |item| released.push(item));
        assert!(released.is_empty());

        list.reclaim(3, |item| released.push(item));
        assert_eq!(released, vec![Item(1)]);
        assert_eq!(list.held_bytes(), 6);

        list.reclaim(10, |item| released.push(item));
        assert_eq!(released, vec![Item(1), Item(2), Item(4)]);
        assert!(list.is_empty());
        assert_eq!(list.held_bytes(), 0);
    }

    #[test]
    fn test_reclaim_all() {
        let mut list = GenerationHoldList::new();
        list.insert(Item(1));
        list.assign_generation(1);
        list.insert(Item(2));

        let mut count = 0;
        list.reclaim_all(|_| count += 1);
        assert_eq!(count, 2);
        assert!(list.is_empty());
        assert_eq!(list.held_bytes(), 0);
    }

    #[test]
    #[should_panic(expected = "went backwards")]
    fn test_generation_must_not_decrease() {
        let mut list = GenerationHoldList::new();
        list.insert(Item(1));
        list.assign_generation(5);
        list.insert(Item(1));
        list.assign_generation(4);
    }
}

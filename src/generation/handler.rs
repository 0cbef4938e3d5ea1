//! Reader generation tracking
//!
//! Each generation has a hold with an atomic guard count. Readers pin the
//! latest hold with a compare-and-swap and never touch the writer lock; the
//! writer retires holds from the oldest end once their count drops to zero.
//! Retired holds are recycled, never freed, so a reader racing with the
//! writer always dereferences live memory.

use super::Generation;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicPtr, AtomicU64, Ordering};
use std::sync::Arc;

/// Count marking a hold that no longer accepts guards
const RETIRED: i64 = -1;

struct GenerationHold {
    generation: AtomicU64,
    /// Live guards, or [`RETIRED`]
    ref_count: AtomicI64,
}

impl GenerationHold {
    fn new(generation: Generation) -> Box<Self> {
        Box::new(Self {
            generation: AtomicU64::new(generation),
            ref_count: AtomicI64::new(0),
        })
    }

    fn try_acquire(&self) -> bool {
        let mut count = self.ref_count.load(Ordering::Relaxed);
        loop {
            if count == RETIRED {
                return false;
            }
            match self.ref_count.compare_exchange_weak(
                count,
                count + 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(current) => count = current,
            }
        }
    }

    fn release(&self) {
        let previous = self.ref_count.fetch_sub(1, Ordering::Release);
        debug_assert!(previous > 0, "guard released on hold with count {}", previous);
    }

    /// Stop accepting guards if none are live
    fn try_retire(&self) -> bool {
        self.ref_count
            .compare_exchange(0, RETIRED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    fn guards(&self) -> usize {
        self.ref_count.load(Ordering::Acquire).max(0) as usize
    }
}

/// Writer-side bookkeeping; readers never lock it
struct HoldQueue {
    /// Holds that may still have guards, oldest first; the back is current
    pending: VecDeque<Box<GenerationHold>>,
    /// Retired holds ready for reuse
    spare: Vec<Box<GenerationHold>>,
}

impl HoldQueue {
    fn retire_unused(&mut self) {
        while self.pending.len() > 1 && self.pending[0].try_retire() {
            if let Some(hold) = self.pending.pop_front() {
                self.spare.push(hold);
            }
        }
    }

    fn oldest(&self) -> Option<Generation> {
        self.pending
            .front()
            .map(|hold| hold.generation.load(Ordering::Relaxed))
    }
}

struct HandlerInner {
    current: AtomicU64,
    /// Hold of the current generation
    last: AtomicPtr<GenerationHold>,
    holds: Mutex<HoldQueue>,
}

/// Tracks which generations readers may still observe
///
/// Cheap to clone; all clones share the same counter. The writer advances
/// the generation with [`inc_generation`](Self::inc_generation), readers pin
/// the current one with [`take_guard`](Self::take_guard).
#[derive(Clone)]
pub struct GenerationHandler {
    inner: Arc<HandlerInner>,
}

impl Default for GenerationHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for GenerationHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenerationHandler")
            .field("current", &self.current_generation())
            .field("oldest_used", &self.oldest_used_generation())
            .finish()
    }
}

impl GenerationHandler {
    pub fn new() -> Self {
        let first = GenerationHold::new(0);
        let last = &*first as *const GenerationHold as *mut GenerationHold;
        let mut pending = VecDeque::new();
        pending.push_back(first);
        Self {
            inner: Arc::new(HandlerInner {
                current: AtomicU64::new(0),
                last: AtomicPtr::new(last),
                holds: Mutex::new(HoldQueue {
                    pending,
                    spare: Vec::new(),
                }),
            }),
        }
    }

    pub fn current_generation(&self) -> Generation {
        self.inner.current.load(Ordering::Acquire)
    }

    /// Advance to the next generation, returning the new value
    ///
    /// Only the writer calls this.
    pub fn inc_generation(&self) -> Generation {
        let mut holds = self.inner.holds.lock();
        let generation = self.inner.current.load(Ordering::Relaxed) + 1;
        let hold = match holds.spare.pop() {
            Some(hold) => {
                hold.generation.store(generation, Ordering::Relaxed);
                hold
            }
            None => GenerationHold::new(generation),
        };
        self.inner.current.store(generation, Ordering::Release);
        // A reader still holding a stale pointer to a recycled hold may pin
        // it from here on, and then observes the new current generation
        hold.ref_count.store(0, Ordering::Release);
        let hold_ptr = &*hold as *const GenerationHold as *mut GenerationHold;
        holds.pending.push_back(hold);
        self.inner.last.store(hold_ptr, Ordering::Release);
        holds.retire_unused();
        generation
    }

    /// Pin the current generation for the lifetime of the guard
    pub fn take_guard(&self) -> GenerationGuard {
        loop {
            let hold = self.inner.last.load(Ordering::Acquire);
            // SAFETY: holds are only freed with the handler, which the
            // Arc keeps alive
            let hold_ref = unsafe { &*hold };
            if hold_ref.try_acquire() {
                return GenerationGuard {
                    inner: Arc::clone(&self.inner),
                    hold,
                    generation: hold_ref.generation.load(Ordering::Acquire),
                };
            }
            std::hint::spin_loop();
        }
    }

    /// Oldest generation pinned by a live guard, or the current one when none
    pub fn oldest_used_generation(&self) -> Generation {
        let mut holds = self.inner.holds.lock();
        holds.retire_unused();
        holds
            .oldest()
            .unwrap_or_else(|| self.inner.current.load(Ordering::Acquire))
    }

    /// Number of live guards pinning `generation`
    pub fn generation_ref_count(&self, generation: Generation) -> usize {
        self.inner
            .holds
            .lock()
            .pending
            .iter()
            .find(|hold| hold.generation.load(Ordering::Relaxed) == generation)
            .map_or(0, |hold| hold.guards())
    }

    /// Number of live guards over all generations
    pub fn active_guards(&self) -> usize {
        self.inner.holds.lock().pending.iter().map(|hold| hold.guards()).sum()
    }
}

/// RAII pin on a generation
///
/// Memory retired after the guard was taken stays valid until it is dropped.
pub struct GenerationGuard {
    inner: Arc<HandlerInner>,
    hold: *const GenerationHold,
    generation: Generation,
}

// SAFETY: the hold outlives `inner` and is only touched through atomics
unsafe impl Send for GenerationGuard {}
unsafe impl Sync for GenerationGuard {}

impl GenerationGuard {
    pub fn generation(&self) -> Generation {
        self.generation
    }

    fn hold(&self) -> &GenerationHold {
        // SAFETY: holds are only freed with `inner`, which self keeps alive
        unsafe { &*self.hold }
    }
}

impl Clone for GenerationGuard {
    fn clone(&self) -> Self {
        // A live guard keeps the count positive, so the hold cannot retire
        self.hold().ref_count.fetch_add(1, Ordering::Relaxed);
        Self {
            inner: Arc::clone(&self.inner),
            hold: self.hold,
            generation: self.generation,
        }
    }
}

impl Drop for GenerationGuard {
    fn drop(&mut self) {
        self.hold().release();
    }
}

impl fmt::Debug for GenerationGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenerationGuard")
            .field("generation", &self.generation)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oldest_used_without_guards() {
        let handler = GenerationHandler::new();
        assert_eq!(handler.current_generation(), 0);
        assert_eq!(handler.oldest_used_generation(), 0);
        assert_eq!(handler.inc_generation(), 1);
        assert_eq!(handler.oldest_used_generation(), 1);
    }

    #[test]
    fn test_guard_pins_generation() {
        let handler = GenerationHandler::new();
        let guard = handler.take_guard();
        assert_eq!(guard.generation(), 0);

        handler.inc_generation();
        handler.inc_generation();
        assert_eq!(handler.current_generation(), 2);
        assert_eq!(handler.oldest_used_generation(), 0);

        let later = handler.take_guard();
        assert_eq!(later.generation(), 2);
        assert_eq!(handler.active_guards(), 2);

        drop(guard);
        assert_eq!(handler.oldest_used_generation(), 2);
        drop(later);
        assert_eq!(handler.active_guards(), 0);
        assert_eq!(handler.oldest_used_generation(), 2);
    }

    #[test]
    fn test_cloned_guards_are_counted() {
        let handler = GenerationHandler::new();
        let guard = handler.take_guard();
        let copy = guard.clone();
        assert_eq!(handler.generation_ref_count(0), 2);
        drop(guard);
        assert_eq!(handler.generation_ref_count(0), 1);
        handler.inc_generation();
        assert_eq!(handler.oldest_used_generation(), 0);
        drop(copy);
        assert_eq!(handler.oldest_used_generation(), 1);
    }

    #[test]
    fn test_take_guard_does_not_wait_for_writer() {
        let handler = GenerationHandler::new();
        handler.inc_generation();
        let holds = handler.inner.holds.lock();
        let guard = handler.take_guard();
        assert_eq!(guard.generation(), 1);
        drop(guard);
        drop(holds);
        assert_eq!(handler.active_guards(), 0);
    }

    #[test]
    fn test_retired_holds_are_recycled() {
        let handler = GenerationHandler::new();
        for _ in 0..1000 {
            let guard = handler.take_guard();
            handler.inc_generation();
            drop(guard);
        }
        handler.oldest_used_generation();
        let holds = handler.inner.holds.lock();
        assert_eq!(holds.pending.len(), 1);
        assert!(holds.spare.len() <= 2);
    }

    #[test]
    fn test_guards_across_threads() {
        let handler = GenerationHandler::new();
        std::thread::scope(|s| {
            for _ in 0..4 {
                let handler = handler.clone();
                s.spawn(move || {
                    for _ in 0..100 {
                        let guard = handler.take_guard();
                        assert!(guard.generation() <= handler.current_generation());
                        assert!(handler.generation_ref_count(guard.generation()) >= 1);
                    }
                });
            }
            for _ in 0..100 {
                handler.inc_generation();
                assert!(handler.oldest_used_generation() <= handler.current_generation());
            }
        });
        assert_eq!(handler.active_guards(), 0);
        assert_eq!(handler.current_generation(), 100);
    }
}

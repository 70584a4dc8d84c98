//! Fixed-capacity, index-stable roster (spec §4.1).
//!
//! The backing `Vec` is sized once at construction to `capacity` and never
//! grows or shrinks — only its slots toggle between empty and occupied.
//! This is the only structure in the core mutated from multiple threads
//! (spec §5); the outer `RwLock` protects slot membership (which index
//! holds which client), while each occupied slot's own `Mutex` protects
//! mutation of that client's state, so fan-out (shared lock, §4.4) never
//! has to upgrade to exclusive to touch a single wire.
use std::sync::{Arc, Mutex, RwLock};

use hcnet_utils::safe_assert;

use crate::message::PeerId;

pub struct Roster<T> {
    slots: RwLock<Vec<Option<Arc<Mutex<T>>>>>,
}

impl<T> Roster<T> {
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self { slots: RwLock::new(slots) }
    }

    pub fn capacity(&self) -> usize {
        self.slots.read().unwrap().len()
    }

    /// Number of occupied slots (invariant I1).
    pub fn size(&self) -> usize {
        self.slots.read().unwrap().iter().filter(|s| s.is_some()).count()
    }

    /// Lowest vacant index, or `None` if full (invariant I2).
    pub fn next_empty_index(&self) -> Option<PeerId> {
        self.slots
            .read()
            .unwrap()
            .iter()
            .position(Option::is_none)
            .map(|i| i as PeerId)
    }

    pub fn is_full(&self) -> bool {
        self.next_empty_index().is_none()
    }

    /// Places `value` at `id`. Logic error (I3) if already occupied —
    /// callers must hold the exclusive admission discipline described in
    /// spec §4.6 to avoid this; in release builds it is logged rather than
    /// panicking (`safe_assert!`) so a single bad admission can't bring the
    /// host down.
    pub fn emplace_at(&self, id: PeerId, value: T) {
        let mut slots = self.slots.write().unwrap();
        let idx = id as usize;
        safe_assert!(idx < slots.len(), "emplace_at: id {id} out of range");
        if idx >= slots.len() {
            return;
        }
        safe_assert!(slots[idx].is_none(), "emplace_at: slot {id} already occupied");
        slots[idx] = Some(Arc::new(Mutex::new(value)));
    }

    pub fn erase_at(&self, id: PeerId) -> Option<Arc<Mutex<T>>> {
        let mut slots = self.slots.write().unwrap();
        slots.get_mut(id as usize).and_then(Option::take)
    }

    pub fn get(&self, id: PeerId) -> Option<Arc<Mutex<T>>> {
        self.slots.read().unwrap().get(id as usize).and_then(Clone::clone)
    }

    /// Returns the id of the first occupied slot matching `pred`, taking
    /// the roster's shared lock for the duration of the scan (used for the
    /// duplicate-name admission check, spec §4.6).
    pub fn first_if(&self, mut pred: impl FnMut(&T) -> bool) -> Option<PeerId> {
        let slots = self.slots.read().unwrap();
        for (idx, slot) in slots.iter().enumerate() {
            if let Some(entry) = slot {
                let guard = entry.lock().unwrap();
                if pred(&guard) {
                    return Some(idx as PeerId);
                }
            }
        }
        None
    }

    /// Iterates live `(id, entry)` pairs under a single shared lock. `f` is
    /// called with the entry's own lock *not* held, so it may lock it
    /// itself; the roster's membership cannot change mid-iteration because
    /// the shared lock is held for the whole call (spec §4.1).
    pub fn for_each(&self, mut f: impl FnMut(PeerId, &Arc<Mutex<T>>)) {
        let slots = self.slots.read().unwrap();
        for (idx, slot) in slots.iter().enumerate() {
            if let Some(entry) = slot {
                f(idx as PeerId, entry);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emplace_get_erase() {
        let r: Roster<String> = Roster::new(4);
        assert_eq!(r.capacity(), 4);
        assert_eq!(r.next_empty_index(), Some(0));
        r.emplace_at(0, "alice".to_string());
        assert_eq!(r.size(), 1);
        assert_eq!(r.next_empty_index(), Some(1));
        assert_eq!(*r.get(0).unwrap().lock().unwrap(), "alice");
        let erased = r.erase_at(0).unwrap();
        assert_eq!(*erased.lock().unwrap(), "alice");
        assert_eq!(r.size(), 0);
        assert!(r.get(0).is_none());
    }

    #[test]
    fn full_roster_has_no_empty_index() {
        let r: Roster<u8> = Roster::new(2);
        r.emplace_at(0, 1);
        r.emplace_at(1, 2);
        assert!(r.is_full());
        assert_eq!(r.next_empty_index(), None);
    }

    #[test]
    fn first_if_finds_duplicate() {
        let r: Roster<String> = Roster::new(4);
        r.emplace_at(0, "bob".to_string());
        r.emplace_at(2, "carol".to_string());
        assert_eq!(r.first_if(|n| n == "carol"), Some(2));
        assert_eq!(r.first_if(|n| n == "dave"), None);
    }

    #[test]
    fn for_each_visits_live_slots_only() {
        let r: Roster<u32> = Roster::new(3);
        r.emplace_at(0, 10);
        r.emplace_at(2, 30);
        let mut seen = Vec::new();
        r.for_each(|id, v| seen.push((id, *v.lock().unwrap())));
        seen.sort();
        assert_eq!(seen, vec![(0, 10), (2, 30)]);
    }
}

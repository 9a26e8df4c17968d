//! The capability table.
//!
//! One fixed slot array for the whole system, indexed by
//! `(pid, cidx)`. Occupied slots are threaded onto a single circular
//! doubly linked list in depth-first pre-order of the derivation tree:
//! a parent precedes all of its descendants and its first descendant is
//! its `next`. Links are slot indices, so there is nothing to allocate
//! or free.
//!
//! Reads (`cap`, `next`, `prev`, `is_empty`) are lock-free; every
//! mutation happens through a [`CdtGuard`], the witness that the global
//! ticket lock is held. A lock-free reader can observe a capability and
//! a link from different list versions, so whoever acts on such a pair
//! must revalidate it under the guard, which is what
//! [`CdtGuard::delete_if`] is for.

use core::sync::atomic::{AtomicU16, AtomicU64, Ordering};

use array_macro::array;

use crate::cap::Cap;
use crate::excpt::Excpt;
use crate::kassert;
use crate::lock::{RawLock, RawTicketLock};
use crate::param::{N_CAP, N_PROC};

/// Index of a capability slot: a pid and a capability index.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CapPtr {
    pid: u16,
    idx: u16,
}

impl CapPtr {
    /// Returns `None` when the capability index is out of range. The
    /// pid must already be valid.
    pub fn new(pid: usize, idx: u64) -> Option<Self> {
        kassert!(pid < N_PROC);
        if idx < N_CAP as u64 {
            Some(Self { pid: pid as u16, idx: idx as u16 })
        } else {
            None
        }
    }

    pub fn pid(self) -> usize {
        self.pid as usize
    }

    pub fn idx(self) -> usize {
        self.idx as usize
    }

    fn link(self) -> u16 {
        self.pid * N_CAP as u16 + self.idx
    }

    fn from_link(link: u16) -> Self {
        Self {
            pid: link / N_CAP as u16,
            idx: link % N_CAP as u16,
        }
    }
}

struct Slot {
    /// Wire form of the capability; 0 is an empty slot.
    raw: AtomicU64,
    prev: AtomicU16,
    next: AtomicU16,
}

/// The capability table and the lock over its list structure.
pub struct CapTable {
    lock: RawTicketLock,
    slots: [Slot; N_PROC * N_CAP],
}

impl CapTable {
    pub fn new() -> Self {
        Self {
            lock: RawTicketLock::new(),
            slots: array![_ => Slot {
                raw: AtomicU64::new(0),
                prev: AtomicU16::new(0),
                next: AtomicU16::new(0),
            }; N_PROC * N_CAP],
        }
    }

    /// Places the boot capabilities in process 0's first slots and wires
    /// them into a circular list. Called once, before any hart runs.
    pub fn init(&self, caps: &[Cap]) {
        kassert!(caps.len() <= N_CAP);
        let n = caps.len() as u16;
        for (i, cap) in caps.iter().enumerate() {
            let slot = &self.slots[i];
            slot.raw.store(cap.raw(), Ordering::Relaxed);
            slot.prev.store((i as u16 + n - 1) % n, Ordering::Relaxed);
            slot.next.store((i as u16 + 1) % n, Ordering::Relaxed);
        }
    }

    fn slot(&self, p: CapPtr) -> &Slot {
        &self.slots[p.link() as usize]
    }

    /// The capability stored at `p`; `Cap::None` for an empty slot.
    pub fn cap(&self, p: CapPtr) -> Cap {
        Cap::from_raw(self.slot(p).raw.load(Ordering::Acquire))
    }

    pub fn is_empty(&self, p: CapPtr) -> bool {
        self.slot(p).raw.load(Ordering::Acquire) == 0
    }

    pub fn next(&self, p: CapPtr) -> CapPtr {
        CapPtr::from_link(self.slot(p).next.load(Ordering::Acquire))
    }

    pub fn prev(&self, p: CapPtr) -> CapPtr {
        CapPtr::from_link(self.slot(p).prev.load(Ordering::Acquire))
    }

    /// Acquires the CDT lock. Strictly FIFO; hold it only across one
    /// splice plus its hooks.
    pub fn lock(&self) -> CdtGuard<'_> {
        self.lock.acquire();
        CdtGuard { table: self }
    }
}

/// Witness that the CDT lock is held. All list mutation lives here.
pub struct CdtGuard<'s> {
    table: &'s CapTable,
}

impl Drop for CdtGuard<'_> {
    fn drop(&mut self) {
        // SAFETY: constructing a guard acquires the lock.
        unsafe { self.table.lock.release() };
    }
}

impl CdtGuard<'_> {
    fn slots(&self) -> &[Slot; N_PROC * N_CAP] {
        &self.table.slots
    }

    /// Splices `cap` into `new` immediately after `after`.
    pub fn insert(&mut self, new: CapPtr, cap: Cap, after: CapPtr) -> Result<(), Excpt> {
        kassert!(!cap.is_none());
        if !self.table.is_empty(new) {
            return Err(Excpt::Collision);
        }
        if self.table.is_empty(after) {
            return Err(Excpt::Empty);
        }
        let slots = self.slots();
        let next = slots[after.link() as usize].next.load(Ordering::Relaxed);
        slots[next as usize].prev.store(new.link(), Ordering::Relaxed);
        let slot = &slots[new.link() as usize];
        slot.next.store(next, Ordering::Relaxed);
        slot.prev.store(after.link(), Ordering::Relaxed);
        slot.raw.store(cap.raw(), Ordering::Release);
        slots[after.link() as usize].next.store(new.link(), Ordering::Relaxed);
        Ok(())
    }

    /// Moves the capability at `src` to the empty slot `dst`,
    /// preserving its position in the list.
    pub fn move_cap(&mut self, src: CapPtr, dst: CapPtr) -> Result<Cap, Excpt> {
        if !self.table.is_empty(dst) {
            return Err(Excpt::Collision);
        }
        if self.table.is_empty(src) {
            return Err(Excpt::Empty);
        }
        let slots = self.slots();
        let from = &slots[src.link() as usize];
        let raw = from.raw.load(Ordering::Relaxed);
        let mut prev = from.prev.load(Ordering::Relaxed);
        let mut next = from.next.load(Ordering::Relaxed);
        if next == src.link() {
            // The list is just `src`.
            prev = dst.link();
            next = dst.link();
        }
        let to = &slots[dst.link() as usize];
        to.prev.store(prev, Ordering::Relaxed);
        to.next.store(next, Ordering::Relaxed);
        to.raw.store(raw, Ordering::Release);
        slots[prev as usize].next.store(dst.link(), Ordering::Relaxed);
        slots[next as usize].prev.store(dst.link(), Ordering::Relaxed);
        from.raw.store(0, Ordering::Release);
        Ok(Cap::from_raw(raw))
    }

    /// Unlinks and clears the slot at `p`.
    pub fn delete(&mut self, p: CapPtr) -> Result<Cap, Excpt> {
        if self.table.is_empty(p) {
            return Err(Excpt::Empty);
        }
        let slots = self.slots();
        let slot = &slots[p.link() as usize];
        let raw = slot.raw.load(Ordering::Relaxed);
        let prev = slot.prev.load(Ordering::Relaxed);
        let next = slot.next.load(Ordering::Relaxed);
        slots[next as usize].prev.store(prev, Ordering::Relaxed);
        slots[prev as usize].next.store(next, Ordering::Relaxed);
        slot.raw.store(0, Ordering::Release);
        Ok(Cap::from_raw(raw))
    }

    /// Deletes `p` only if it still holds `expected` and still directly
    /// follows `expected_prev`. This is the revocation loop's guard
    /// against a concurrent move, delete or derive between its unlocked
    /// read and this critical section.
    pub fn delete_if(&mut self, p: CapPtr, expected: Cap, expected_prev: CapPtr) -> bool {
        let slot = &self.slots()[p.link() as usize];
        if slot.raw.load(Ordering::Relaxed) != expected.raw()
            || slot.prev.load(Ordering::Relaxed) != expected_prev.link()
        {
            return false;
        }
        // Cannot fail: the slot was just observed occupied.
        self.delete(p).is_ok()
    }

    /// Replaces the capability payload at `p` in place.
    pub fn update(&mut self, p: CapPtr, cap: Cap) -> Result<(), Excpt> {
        kassert!(!cap.is_none());
        if self.table.is_empty(p) {
            return Err(Excpt::Empty);
        }
        self.slots()[p.link() as usize]
            .raw
            .store(cap.raw(), Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;
    use crate::cap::Rwx;

    fn cptr(pid: usize, idx: u64) -> CapPtr {
        CapPtr::new(pid, idx).unwrap()
    }

    fn table_with(caps: &[Cap]) -> CapTable {
        let t = CapTable::new();
        t.init(caps);
        t
    }

    fn boot_caps() -> Vec<Cap> {
        vec![
            Cap::time(0, 0, 64),
            Cap::memory(0x10, 0x20, 0x80, Rwx::RWX),
            Cap::monitor(0, 8),
            Cap::channel(0, 16),
        ]
    }

    /// Walks the whole list from `start` and checks both link
    /// directions agree.
    fn assert_consistent(t: &CapTable, start: CapPtr, expected_len: usize) {
        let mut p = start;
        for _ in 0..expected_len {
            assert!(!t.is_empty(p));
            assert_eq!(t.prev(t.next(p)), p);
            assert_eq!(t.next(t.prev(p)), p);
            p = t.next(p);
        }
        assert_eq!(p, start, "list is circular with {} entries", expected_len);
    }

    #[test]
    fn init_wires_a_circular_list() {
        let caps = boot_caps();
        let t = table_with(&caps);
        assert_consistent(&t, cptr(0, 0), caps.len());
        for (i, cap) in caps.iter().enumerate() {
            assert_eq!(t.cap(cptr(0, i as u64)), *cap);
        }
        assert!(t.is_empty(cptr(0, caps.len() as u64)));
        assert!(t.is_empty(cptr(3, 0)));
    }

    #[test]
    fn insert_splices_after_parent() {
        let t = table_with(&boot_caps());
        let child = Cap::time(0, 0, 32);
        t.lock().insert(cptr(0, 10), child, cptr(0, 0)).unwrap();
        assert_eq!(t.next(cptr(0, 0)), cptr(0, 10));
        assert_eq!(t.next(cptr(0, 10)), cptr(0, 1));
        assert_consistent(&t, cptr(0, 0), 5);

        // Occupied destination and empty anchor are rejected.
        assert_eq!(
            t.lock().insert(cptr(0, 10), child, cptr(0, 0)),
            Err(Excpt::Collision)
        );
        assert_eq!(
            t.lock().insert(cptr(0, 11), child, cptr(0, 20)),
            Err(Excpt::Empty)
        );
    }

    #[test]
    fn move_preserves_list_position() {
        let t = table_with(&boot_caps());
        let cap = t.cap(cptr(0, 1));
        let got = t.lock().move_cap(cptr(0, 1), cptr(2, 5)).unwrap();
        assert_eq!(got, cap);
        assert!(t.is_empty(cptr(0, 1)));
        assert_eq!(t.cap(cptr(2, 5)), cap);
        assert_eq!(t.next(cptr(0, 0)), cptr(2, 5));
        assert_eq!(t.next(cptr(2, 5)), cptr(0, 2));
        assert_consistent(&t, cptr(0, 0), 4);

        assert_eq!(
            t.lock().move_cap(cptr(0, 1), cptr(2, 6)),
            Err(Excpt::Empty)
        );
        assert_eq!(
            t.lock().move_cap(cptr(0, 0), cptr(2, 5)),
            Err(Excpt::Collision)
        );
    }

    #[test]
    fn delete_unlinks() {
        let t = table_with(&boot_caps());
        t.lock().delete(cptr(0, 1)).unwrap();
        assert!(t.is_empty(cptr(0, 1)));
        assert_eq!(t.next(cptr(0, 0)), cptr(0, 2));
        assert_eq!(t.prev(cptr(0, 2)), cptr(0, 0));
        assert_consistent(&t, cptr(0, 0), 3);
        assert_eq!(t.lock().delete(cptr(0, 1)), Err(Excpt::Empty));
    }

    #[test]
    fn delete_if_rejects_stale_observations() {
        let t = table_with(&boot_caps());
        let cap = t.cap(cptr(0, 1));

        // Stale capability value.
        assert!(!t.lock().delete_if(cptr(0, 1), Cap::time(3, 0, 1), cptr(0, 0)));
        // Stale predecessor.
        assert!(!t.lock().delete_if(cptr(0, 1), cap, cptr(0, 3)));
        assert!(!t.is_empty(cptr(0, 1)));

        assert!(t.lock().delete_if(cptr(0, 1), cap, cptr(0, 0)));
        assert!(t.is_empty(cptr(0, 1)));
        assert_consistent(&t, cptr(0, 0), 3);
    }

    #[test]
    fn update_replaces_payload_in_place() {
        let t = table_with(&boot_caps());
        let newer = Cap::Time { hart: 0, begin: 0, free: 32, end: 64 };
        t.lock().update(cptr(0, 0), newer).unwrap();
        assert_eq!(t.cap(cptr(0, 0)), newer);
        assert_eq!(
            t.lock().update(cptr(0, 9), newer),
            Err(Excpt::Empty)
        );
    }

    #[test]
    fn concurrent_moves_of_one_source_leave_one_winner() {
        for _ in 0..64 {
            let t = Arc::new(table_with(&boot_caps()));
            let a = {
                let t = Arc::clone(&t);
                thread::spawn(move || t.lock().move_cap(cptr(0, 1), cptr(1, 0)).map(|_| ()))
            };
            let b = {
                let t = Arc::clone(&t);
                thread::spawn(move || t.lock().move_cap(cptr(0, 1), cptr(2, 0)).map(|_| ()))
            };
            let results = [a.join().unwrap(), b.join().unwrap()];
            assert!(results.contains(&Ok(())));
            assert!(results.contains(&Err(Excpt::Empty)));
            assert_consistent(&t, cptr(0, 0), 4);
        }
    }
}

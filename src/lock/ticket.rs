//! FIFO ticket lock.

use core::hint::spin_loop;
use core::sync::atomic::{AtomicU32, Ordering};

use super::RawLock;

/// Mutual exclusion that serves harts in the order they asked.
///
/// Each acquirer draws a ticket; the lock serves ticket numbers in
/// sequence, so no hart can starve behind a faster neighbor. This is
/// the lock guarding every CDT-mutating critical section: the revoke
/// loop takes it once per deleted descendant, and fairness bounds how
/// long any single syscall can be delayed.
pub struct RawTicketLock {
    /// Next ticket number to be issued.
    next: AtomicU32,
    /// Ticket number currently being served.
    serving: AtomicU32,
}

impl RawTicketLock {
    pub const fn new() -> Self {
        Self {
            next: AtomicU32::new(0),
            serving: AtomicU32::new(0),
        }
    }
}

impl RawLock for RawTicketLock {
    fn acquire(&self) {
        let ticket = self.next.fetch_add(1, Ordering::Relaxed);
        while self.serving.load(Ordering::Acquire) != ticket {
            spin_loop();
        }
    }

    unsafe fn release(&self) {
        // The holder is the serving ticket; no one else stores here.
        let _ = self.serving.fetch_add(1, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::super::TicketLock;

    #[test]
    fn counts_stay_consistent_under_contention() {
        let lock = Arc::new(TicketLock::new(0u64));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let lock = Arc::clone(&lock);
            handles.push(thread::spawn(move || {
                for _ in 0..10_000 {
                    *lock.lock() += 1;
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*lock.lock(), 40_000);
    }
}

//! The lock module.
//!
//! Contains the `RawLock` trait for raw mutual-exclusion primitives and
//! the `Lock`/`Guard` pair that couples a raw lock with the data it
//! protects. The kernel's single CDT lock is a [`RawTicketLock`] used
//! bare (the capability table wants lock-free readers); `Lock` wraps
//! data that is only ever touched under the lock, like the printer.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

mod ticket;

pub use ticket::RawTicketLock;

/// Raw locks that provide mutual exclusion among harts.
pub trait RawLock {
    /// Acquires the lock, spinning until it is held.
    fn acquire(&self);

    /// Releases the lock.
    ///
    /// # Safety
    ///
    /// The lock must be held by the caller.
    unsafe fn release(&self);
}

/// A lock that owns its raw lock and `data: T`.
pub struct Lock<R: RawLock, T> {
    lock: R,
    data: UnsafeCell<T>,
}

/// Locks that serve waiters strictly in arrival order.
pub type TicketLock<T> = Lock<RawTicketLock, T>;

// SAFETY: the raw lock serializes all access to `data`.
unsafe impl<R: RawLock + Sync, T: Send> Sync for Lock<R, T> {}

impl<T> TicketLock<T> {
    pub const fn new(data: T) -> Self {
        Self {
            lock: RawTicketLock::new(),
            data: UnsafeCell::new(data),
        }
    }
}

impl<R: RawLock, T> Lock<R, T> {
    /// Acquires the lock and returns an RAII guard.
    pub fn lock(&self) -> Guard<'_, R, T> {
        self.lock.acquire();
        Guard { lock: self }
    }
}

/// Guard of a `Lock`. Dereferences to the protected data; releases the
/// lock on drop.
pub struct Guard<'s, R: RawLock, T> {
    lock: &'s Lock<R, T>,
}

impl<R: RawLock, T> Drop for Guard<'_, R, T> {
    fn drop(&mut self) {
        // SAFETY: a live guard means the lock is held.
        unsafe { self.lock.lock.release() };
    }
}

impl<R: RawLock, T> Deref for Guard<'_, R, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the lock is held while the guard lives.
        unsafe { &*self.lock.data.get() }
    }
}

impl<R: RawLock, T> DerefMut for Guard<'_, R, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the lock is held while the guard lives.
        unsafe { &mut *self.lock.data.get() }
    }
}

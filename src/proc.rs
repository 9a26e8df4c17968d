//! Process control blocks.
//!
//! A process is a register save area, a PMP shadow and one atomic state
//! word. The state word is the only synchronization a process has: the
//! low bits are [`PsFlags`] and the high bits carry the channel id the
//! process is blocked on. `BUSY` is the per-process mutual exclusion
//! between scheduler dispatch and monitor inspection; whoever wins the
//! compare-exchange owns `ProcData` until it releases.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;
use itertools::izip;

use crate::excpt::Excpt;
use crate::kassert;
use crate::param::{N_PMP, REG_COUNT};

bitflags! {
    /// Flag bits of the process state word.
    pub struct PsFlags: u64 {
        /// Held by a hart (running) or by a monitor (inspected).
        const BUSY = 0x1;
        /// Blocked on an IPC channel; the channel id sits above
        /// `CHANNEL_SHIFT`.
        const BLOCKED = 0x2;
        /// Will not be scheduled again until resumed.
        const SUSPENDED = 0x4;
    }
}

/// Bit position of the blocked-on channel id in the state word.
const CHANNEL_SHIFT: u32 = 16;

/// Named indices into the register save area. The first 32 mirror the
/// RISC-V general-purpose registers; the rest are virtual registers for
/// user-level exception handling.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(usize)]
#[allow(clippy::upper_case_acronyms)]
pub enum Reg {
    Pc = 0,
    Ra,
    Sp,
    Gp,
    Tp,
    T0,
    T1,
    T2,
    S0,
    S1,
    A0,
    A1,
    A2,
    A3,
    A4,
    A5,
    A6,
    A7,
    S2,
    S3,
    S4,
    S5,
    S6,
    S7,
    S8,
    S9,
    S10,
    S11,
    T3,
    T4,
    T5,
    T6,
    /// User trap handler entry point.
    Tpc,
    /// User trap handler stack pointer.
    Tsp,
    /// `pc` at the moment of the delegated exception.
    Epc,
    /// `sp` at the moment of the delegated exception.
    Esp,
    Ecause,
    Eval,
}

static_assertions::const_assert_eq!(Reg::Eval as usize + 1, REG_COUNT);

/// Everything a holder of the process may touch. Protected by the
/// `BUSY` flag, not by a lock.
pub struct ProcData {
    /// User registers plus virtual registers, saved on trap.
    pub regs: [u64; REG_COUNT],
    /// PMP shadow, flushed to hardware on dispatch.
    pub pmpcfg: [u8; N_PMP],
    pub pmpaddr: [u64; N_PMP],
    /// Start and end of the current time slice.
    pub start_time: u64,
    pub end_time: u64,
    /// Worst observed activation time, reported via `get_info`.
    pub wcet: u64,
    /// Capability slot latched by `sock_recv` for an incoming transfer.
    pub cap_dest: u64,
}

/// Per-process state.
pub struct Proc {
    pid: usize,
    /// Flags plus blocked-on channel; see the module doc.
    state: AtomicU64,
    /// Read by the scheduler without holding the process.
    sleep_until: AtomicU64,
    data: UnsafeCell<ProcData>,
}

// SAFETY: `data` is only accessed by the holder of the `BUSY` flag (or
// under the CDT lock for the PMP shadow); `state` and `sleep_until` are
// atomics.
unsafe impl Sync for Proc {}

impl Proc {
    /// A fresh, suspended process. pid 0 is readied by `Kernel::new`.
    pub fn new(pid: usize) -> Self {
        Self {
            pid,
            state: AtomicU64::new(PsFlags::SUSPENDED.bits()),
            sleep_until: AtomicU64::new(0),
            data: UnsafeCell::new(ProcData {
                regs: [0; REG_COUNT],
                pmpcfg: [0; N_PMP],
                pmpaddr: [0; N_PMP],
                start_time: 0,
                end_time: 0,
                wcet: 0,
                cap_dest: 0,
            }),
        }
    }

    pub fn pid(&self) -> usize {
        self.pid
    }

    /// The holder's view of the process.
    ///
    /// # Safety
    ///
    /// The caller must hold the process (`acquire`, `monitor_acquire`
    /// or `ipc_acquire`), or be the CDT-lock holder touching only the
    /// PMP shadow, or otherwise have exclusive access.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn data(&self) -> &mut ProcData {
        unsafe { &mut *self.data.get() }
    }

    /// Saved register read/write shorthands for holders.
    ///
    /// # Safety
    ///
    /// Same contract as [`Proc::data`].
    pub unsafe fn reg(&self, r: Reg) -> u64 {
        unsafe { self.data() }.regs[r as usize]
    }

    /// # Safety
    ///
    /// Same contract as [`Proc::data`].
    pub unsafe fn set_reg(&self, r: Reg, val: u64) {
        unsafe { self.data() }.regs[r as usize] = val;
    }

    pub fn state(&self) -> u64 {
        self.state.load(Ordering::Acquire)
    }

    pub fn sleep_until(&self) -> u64 {
        self.sleep_until.load(Ordering::Acquire)
    }

    pub fn set_sleep_until(&self, until: u64) {
        self.sleep_until.store(until, Ordering::Release);
    }

    /// Scheduler dispatch: takes the process only if it is idle and not
    /// suspended.
    pub fn acquire(&self) -> bool {
        self.state
            .compare_exchange(
                0,
                PsFlags::BUSY.bits(),
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    /// Monitor inspection: takes the process even when it is suspended,
    /// but never while it runs or waits.
    pub fn monitor_acquire(&self) -> bool {
        let observed = self.state.load(Ordering::Relaxed);
        if observed & (PsFlags::BUSY | PsFlags::BLOCKED).bits() != 0 {
            return false;
        }
        self.state
            .compare_exchange(
                observed,
                observed | PsFlags::BUSY.bits(),
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    /// Drops everything except a pending suspend.
    pub fn release(&self) {
        let _ = self
            .state
            .fetch_and(PsFlags::SUSPENDED.bits(), Ordering::Release);
    }

    /// Orders the process to stop being scheduled. A process blocked in
    /// `recv` is kicked out of the wait: its state collapses to
    /// `SUSPENDED` and its pending syscall completes with `Suspended`.
    pub fn suspend(&self) {
        let prev = self
            .state
            .fetch_or(PsFlags::SUSPENDED.bits(), Ordering::Acquire);
        // Only a parked waiter is cancelled here. If the waiter is
        // momentarily held by a sender (`BUSY | BLOCKED`), the sender's
        // release or requeue sees the suspend instead.
        if prev & 0xff == PsFlags::BLOCKED.bits() {
            self.state
                .store(PsFlags::SUSPENDED.bits(), Ordering::Release);
            // The process was parked in the middle of a recv; it was
            // not running, so completing its syscall here is exclusive.
            unsafe { self.set_reg(Reg::A0, Excpt::Suspended.code()) };
        }
    }

    pub fn resume(&self) {
        let _ = self
            .state
            .fetch_and(!PsFlags::SUSPENDED.bits(), Ordering::Release);
    }

    /// Parks the running process on `channel`. Fails if a suspend
    /// arrived, in which case the caller must not block.
    pub fn ipc_wait(&self, channel: u64) -> bool {
        self.state
            .compare_exchange(
                PsFlags::BUSY.bits(),
                channel << CHANNEL_SHIFT | PsFlags::BLOCKED.bits(),
                Ordering::SeqCst,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    /// Puts a waiter taken by `ipc_acquire` back into its wait without
    /// it ever observing the wake. If a suspend arrived while the
    /// waiter was held, the wait is cancelled instead and the parked
    /// recv completes with `Suspended`; returns false in that case.
    pub fn ipc_requeue(&self, channel: u64) -> bool {
        if self.state.load(Ordering::Relaxed) & PsFlags::SUSPENDED.bits() != 0 {
            self.state
                .store(PsFlags::SUSPENDED.bits(), Ordering::Release);
            unsafe { self.set_reg(Reg::A0, Excpt::Suspended.code()) };
            false
        } else {
            self.state.store(
                channel << CHANNEL_SHIFT | PsFlags::BLOCKED.bits(),
                Ordering::Release,
            );
            true
        }
    }

    /// Wakes a process blocked on exactly `channel`, taking it busy.
    pub fn ipc_acquire(&self, channel: u64) -> bool {
        let expected = channel << CHANNEL_SHIFT | PsFlags::BLOCKED.bits();
        self.state
            .compare_exchange(
                expected,
                expected | PsFlags::BUSY.bits(),
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    /// Folds one activation's duration into the worst case reported by
    /// `get_info`. The trap glue calls this on every kernel exit.
    #[cfg(feature = "instrument")]
    pub fn note_activation(&self, ticks: u64) {
        // SAFETY: called by the hart that holds the process.
        let data = unsafe { self.data() };
        if ticks > data.wcet {
            data.wcet = ticks;
        }
    }

    /// Writes one PMP shadow slot. Callers hold the CDT lock.
    pub fn pmp_set(&self, i: usize, addr: u64, rwx: u64) {
        kassert!(i < N_PMP);
        // NAPOT address matching plus the permission bits.
        let data = unsafe { self.data() };
        data.pmpcfg[i] = (rwx | 0x18) as u8;
        data.pmpaddr[i] = addr;
    }

    pub fn pmp_clear(&self, i: usize) {
        kassert!(i < N_PMP);
        unsafe { self.data() }.pmpcfg[i] = 0;
    }

    pub fn pmp_is_set(&self, i: usize) -> bool {
        kassert!(i < N_PMP);
        unsafe { self.data() }.pmpcfg[i] != 0
    }

    /// Copies the PMP shadow out, `(cfg, addr)` per hardware slot.
    pub fn pmp_shadow(&self) -> [(u8, u64); N_PMP] {
        let data = unsafe { self.data() };
        let mut out = [(0, 0); N_PMP];
        for (out, cfg, addr) in izip!(&mut out, &data.pmpcfg, &data.pmpaddr) {
            *out = (*cfg, *addr);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn acquire_is_exclusive() {
        let p = Proc::new(1);
        assert!(!p.acquire(), "fresh processes are suspended");
        p.resume();
        assert!(p.acquire());
        assert!(!p.acquire());
        p.release();
        assert!(p.acquire());
    }

    #[test]
    fn release_preserves_a_pending_suspend() {
        let p = Proc::new(1);
        p.resume();
        assert!(p.acquire());
        p.suspend();
        p.release();
        assert_eq!(p.state(), PsFlags::SUSPENDED.bits());
        assert!(!p.acquire());
        p.resume();
        assert!(p.acquire());
    }

    #[test]
    fn monitor_acquire_takes_suspended_processes() {
        let p = Proc::new(1);
        assert!(p.monitor_acquire());
        assert!(!p.acquire());
        p.release();
        assert_eq!(p.state(), PsFlags::SUSPENDED.bits());

        // But not running ones.
        p.resume();
        assert!(p.acquire());
        assert!(!p.monitor_acquire());
    }

    #[test]
    fn ipc_wait_blocks_and_ipc_acquire_wakes() {
        let p = Proc::new(1);
        p.resume();
        assert!(p.acquire());
        assert!(p.ipc_wait(3));
        assert!(!p.ipc_acquire(5), "wrong channel");
        assert!(p.ipc_acquire(3));
        p.release();
        assert_eq!(p.state(), 0);
    }

    #[test]
    fn suspend_cancels_a_wait() {
        let p = Proc::new(1);
        p.resume();
        assert!(p.acquire());
        assert!(p.ipc_wait(3));
        p.suspend();
        assert_eq!(p.state(), PsFlags::SUSPENDED.bits());
        assert!(!p.ipc_acquire(3));
        assert_eq!(unsafe { p.reg(Reg::A0) }, Excpt::Suspended.code());
    }

    #[test]
    fn suspend_races_ipc_wait() {
        // Whatever the interleaving, the process must never end up
        // schedulable while a suspend is pending.
        for _ in 0..256 {
            let p = Arc::new(Proc::new(1));
            p.resume();
            assert!(p.acquire());
            let waiter = {
                let p = Arc::clone(&p);
                thread::spawn(move || p.ipc_wait(3))
            };
            let suspender = {
                let p = Arc::clone(&p);
                thread::spawn(move || p.suspend())
            };
            let waited = waiter.join().unwrap();
            suspender.join().unwrap();
            if waited {
                // Blocked first; the suspend must have cleared it.
                assert_eq!(p.state(), PsFlags::SUSPENDED.bits());
            } else {
                // Suspend hit first; still busy and suspended.
                p.release();
                assert_eq!(p.state(), PsFlags::SUSPENDED.bits());
            }
            assert!(!p.acquire());
        }
    }

    #[test]
    fn only_one_hart_wakes_a_waiter() {
        for _ in 0..256 {
            let p = Arc::new(Proc::new(1));
            p.resume();
            assert!(p.acquire());
            assert!(p.ipc_wait(7));
            let handles: Vec<_> = (0..2)
                .map(|_| {
                    let p = Arc::clone(&p);
                    thread::spawn(move || p.ipc_acquire(7))
                })
                .collect();
            let woken: Vec<bool> = handles.into_iter().map(|h| h.join().unwrap()).collect();
            assert_eq!(woken.iter().filter(|&&w| w).count(), 1);
        }
    }

    #[test]
    fn pmp_shadow_round_trip() {
        let p = Proc::new(0);
        p.pmp_set(0, 0x2000_5fff, 0x3);
        assert!(p.pmp_is_set(0));
        assert!(!p.pmp_is_set(1));
        assert_eq!(p.pmp_shadow()[0], (0x1b, 0x2000_5fff));
        p.pmp_clear(0);
        assert!(!p.pmp_is_set(0));
    }
}

//! The platform interface.
//!
//! The kernel core is hardware-free; everything that touches a device
//! register comes in through this trait. The embedding binary implements
//! it over the real RTC, CLINT timer and PMP CSRs; tests implement it
//! over plain atomics.

use crate::proc::Proc;

pub trait Plat: Sync {
    /// Current wall clock in RTC ticks.
    fn time_now(&self) -> u64;

    /// Programs `hartid`'s timer to fire at `when`.
    fn timer_set(&self, hartid: u64, when: u64);

    /// Flushes `proc`'s PMP shadow into the hardware PMP of the calling
    /// hart, right before entering user mode.
    fn pmp_write_hw(&self, proc: &Proc);

    /// Serial sink for kernel diagnostics.
    fn putc(&self, byte: u8);

    /// Whether a preemption is pending on `hartid`. Long syscalls poll
    /// this between externally observable steps.
    fn preempted(&self, hartid: u64) -> bool;

    /// Wait-for-interrupt hint used in scheduler retry loops.
    fn wfi(&self) {}

    /// Entry point of the boot payload, process 0's initial `pc`.
    fn payload(&self) -> u64 {
        0
    }
}

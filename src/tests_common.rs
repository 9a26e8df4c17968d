//! Shared fixtures for the unit tests.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use crate::hal::Plat;
use crate::kernel::Kernel;
use crate::param::SLOT_LEN;
use crate::proc::{Proc, Reg};
use crate::syscall::Control;

/// A platform made of atomics: settable clock, injectable preemption,
/// captured serial output.
pub(crate) struct TestPlat {
    pub now: AtomicU64,
    pub preempt: AtomicBool,
    pub serial: Mutex<Vec<u8>>,
}

impl TestPlat {
    pub(crate) fn new() -> Self {
        Self {
            now: AtomicU64::new(1),
            preempt: AtomicBool::new(false),
            serial: Mutex::new(Vec::new()),
        }
    }
}

impl Plat for TestPlat {
    fn time_now(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    fn timer_set(&self, _hartid: u64, _when: u64) {}

    fn pmp_write_hw(&self, _proc: &Proc) {}

    fn putc(&self, byte: u8) {
        self.serial.lock().unwrap().push(byte);
    }

    fn preempted(&self, _hartid: u64) -> bool {
        self.preempt.load(Ordering::SeqCst)
    }

    fn wfi(&self) {
        let _ = self.now.fetch_add(SLOT_LEN, Ordering::SeqCst);
    }

    fn payload(&self) -> u64 {
        0x8001_0000
    }
}

pub(crate) fn test_kernel_with_plat() -> (&'static Kernel, &'static TestPlat) {
    let plat = &*Box::leak(Box::new(TestPlat::new()));
    let kernel = &*Box::leak(Box::new(Kernel::new(plat)));
    (kernel, plat)
}

pub(crate) fn test_kernel() -> &'static Kernel {
    test_kernel_with_plat().0
}

/// Issues one system call on behalf of `proc`, which must be acquired
/// by the caller. Returns the control decision and the resulting `a0`.
pub(crate) fn ecall(
    kernel: &Kernel,
    hartid: u64,
    proc: &Proc,
    nr: u64,
    args: &[u64],
) -> (Control, u64) {
    // SAFETY: the caller holds the process, standing in for its hart.
    unsafe {
        let regs = &mut proc.data().regs;
        regs[Reg::T0 as usize] = nr;
        for (i, arg) in args.iter().enumerate() {
            regs[Reg::A0 as usize + i] = *arg;
        }
    }
    let control = kernel.handle_syscall(hartid, proc);
    // SAFETY: as above.
    (control, unsafe { proc.reg(Reg::A0) })
}

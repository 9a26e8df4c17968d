//! The kernel: every table in one place.
//!
//! A `Kernel` owns the capability table, the process pool, the schedule
//! and the IPC channel registry. The embedding binary builds one at
//! boot through [`init`] and hands every hart a reference; tests build
//! private instances instead.

use core::fmt::{self, Write};

use array_macro::array;
use spin::Once;

use crate::ctable::CapTable;
use crate::hal::Plat;
use crate::ipc::Channels;
use crate::lock::TicketLock;
use crate::param::{INIT_CAPS, N_PROC};
use crate::proc::{Proc, PsFlags, Reg};
use crate::schedule::Schedule;

/// Checks a kernel invariant. A failure is fatal: it writes a serial
/// diagnostic and halts the hart by panicking into the embedder's panic
/// handler.
#[macro_export]
macro_rules! kassert {
    ($cond:expr) => {
        if !$cond {
            $crate::kernel::assert_fail(file!(), line!());
        }
    };
}

static KERNEL: Once<Kernel> = Once::new();

/// Builds the global kernel. Call once, before any hart enters its
/// scheduler loop.
pub fn init(plat: &'static dyn Plat) -> &'static Kernel {
    KERNEL.call_once(move || Kernel::new(plat))
}

/// The global kernel.
pub fn kernel() -> &'static Kernel {
    KERNEL.get().expect("kernel is not initialized")
}

#[cold]
pub fn assert_fail(file: &str, line: u32) -> ! {
    if let Some(kernel) = KERNEL.get() {
        let mut printer = kernel.printer.lock();
        let _ = writeln!(printer, "kernel assertion failed at {}:{}", file, line);
    }
    panic!("kernel assertion failed at {}:{}", file, line);
}

/// Serial diagnostics sink. Only the assertion path and `dump` write
/// here, so a plain ticket lock is plenty.
pub struct Printer {
    plat: &'static dyn Plat,
}

impl Write for Printer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            self.plat.putc(byte);
        }
        Ok(())
    }
}

pub struct Kernel {
    plat: &'static dyn Plat,
    pub ctable: CapTable,
    pub schedule: Schedule,
    pub(crate) chans: Channels,
    procs: [Proc; N_PROC],
    printer: TicketLock<Printer>,
}

impl Kernel {
    /// A fully initialized kernel: boot capabilities in process 0's
    /// table, the whole schedule owned by process 0, process 0 ready
    /// with its `pc` at the platform payload, everyone else suspended.
    pub fn new(plat: &'static dyn Plat) -> Self {
        let kernel = Self {
            plat,
            ctable: CapTable::new(),
            schedule: Schedule::new(),
            chans: Channels::new(),
            procs: array![pid => Proc::new(pid); N_PROC],
            printer: TicketLock::new(Printer { plat }),
        };
        kernel.ctable.init(INIT_CAPS);
        kernel.schedule.init();
        kernel.procs[0].resume();
        // SAFETY: the kernel is not shared yet.
        unsafe { kernel.procs[0].set_reg(Reg::Pc, plat.payload()) };
        kernel
    }

    pub fn plat(&self) -> &dyn Plat {
        self.plat
    }

    pub fn proc(&self, pid: usize) -> &Proc {
        kassert!(pid < N_PROC);
        &self.procs[pid]
    }

    /// Dispatches the next process for `hartid`; see `Schedule::pick`.
    pub fn schedule_pick(&self, hartid: u64) -> &Proc {
        self.schedule.pick(self.plat, &self.procs, hartid)
    }

    /// Gives up `current`'s remaining slice and dispatches anew.
    pub fn schedule_yield(&self, hartid: u64, current: &Proc) -> &Proc {
        self.schedule.yield_to_next(self.plat, &self.procs, hartid, current)
    }

    /// Prints one line per process. Takes no process locks so it stays
    /// usable from a wedged machine.
    pub fn dump(&self) {
        let mut printer = self.printer.lock();
        for p in &self.procs {
            let state = p.state();
            let flags = PsFlags::from_bits_truncate(state);
            let name = if flags.contains(PsFlags::SUSPENDED) {
                "susp"
            } else if flags.contains(PsFlags::BLOCKED) {
                "block"
            } else if flags.contains(PsFlags::BUSY) {
                "run"
            } else {
                "ready"
            };
            let _ = writeln!(printer, "{} {} {:#x}", p.pid(), name, state);
        }
    }
}

//! The system-call engine.
//!
//! The embedder's trap path saves the user registers into the process
//! and calls [`Kernel::handle_syscall`]. The dispatcher advances the
//! saved `pc` past the `ecall`, validates arguments while holding
//! nothing, and takes the CDT lock only for the mutating tail of each
//! operation. Long operations (revoke, derive) poll the hart's
//! preemption bit between externally observable steps and bail out with
//! `Preempted`; the user shim re-issues the call and the operation
//! resumes from whatever the table now holds.

mod cap_ops;
mod monitor;

use crate::excpt::Excpt;
use crate::kernel::Kernel;
use crate::param::REG_COUNT;
use crate::proc::{Proc, Reg};

/// What the hart must do after a system call. Every path leaves the
/// exception code in `a0` before the process next runs user code: the
/// dispatcher writes it on `Resume` and on errors, a yielding handler
/// writes it itself, and a parked process gets it from its waker.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Control {
    /// Result delivered; return to user mode.
    Resume,
    /// Release the process and dispatch anew (`yield`, cancelled recv).
    /// `a0` already holds the handler's code.
    Yield,
    /// The process parked itself (`recv`); dispatch anew without
    /// releasing, since the waker owns the release and writes `a0`.
    Block,
}

/// Capability-index argument meaning "no capability".
pub const CAP_IDX_NONE: u64 = u64::MAX;

impl Kernel {
    /// Entry point of the engine; see the module doc for the contract.
    pub fn handle_syscall(&self, hartid: u64, proc: &Proc) -> Control {
        // SAFETY: the calling hart holds the process.
        let (nr, a) = unsafe {
            let data = proc.data();
            data.regs[Reg::Pc as usize] = data.regs[Reg::Pc as usize].wrapping_add(4);
            (
                data.regs[Reg::T0 as usize],
                [
                    data.regs[Reg::A0 as usize],
                    data.regs[Reg::A1 as usize],
                    data.regs[Reg::A2 as usize],
                    data.regs[Reg::A3 as usize],
                    data.regs[Reg::A4 as usize],
                    data.regs[Reg::A5 as usize],
                ],
            )
        };
        let result = match nr {
            0 => self.sys_get_info(proc, a[0]),
            1 => self.sys_get_reg(proc, a[0]),
            2 => self.sys_set_reg(proc, a[0], a[1]),
            3 => self.sys_yield(proc, a[0]),
            4 => self.sys_cap_read(proc, a[0]),
            5 => self.sys_cap_move(hartid, proc, a[0], a[1]),
            6 => self.sys_cap_delete(hartid, proc, a[0]),
            7 => self.sys_cap_revoke(hartid, proc, a[0]),
            8 => self.sys_cap_derive(hartid, proc, a[0], a[1], a[2]),
            9 => self.sys_pmp_load(hartid, proc, a[0], a[1]),
            10 => self.sys_pmp_unload(hartid, proc, a[0]),
            11 => self.sys_mon_suspend(proc, a[0], a[1]),
            12 => self.sys_mon_resume(proc, a[0], a[1]),
            13 => self.sys_mon_reg_get(proc, a[0], a[1], a[2]),
            14 => self.sys_mon_reg_set(proc, a[0], a[1], a[2], a[3]),
            15 => self.sys_mon_cap_read(proc, a[0], a[1], a[2]),
            16 => self.sys_mon_cap_take(proc, a[0], a[1], a[2], a[3]),
            17 => self.sys_mon_cap_give(proc, a[0], a[1], a[2], a[3]),
            18 => self.sys_mon_pmp_load(proc, a[0], a[1], a[2], a[3]),
            19 => self.sys_mon_pmp_unload(proc, a[0], a[1], a[2]),
            20 => self.sys_sock_send(proc, a[0], [a[1], a[2], a[3], a[4]], a[5]),
            21 => self.sys_sock_recv(proc, a[0], a[1]),
            22 => self.sys_sock_sendrecv(proc, a[0], [a[1], a[2], a[3], a[4]], a[5]),
            _ => Err(Excpt::Unimplemented),
        };
        match result {
            Ok(Control::Resume) => {
                // SAFETY: still held by the calling hart.
                unsafe { proc.set_reg(Reg::A0, Excpt::None.code()) };
                Control::Resume
            }
            Ok(control) => control,
            Err(e) => {
                // SAFETY: still held by the calling hart.
                unsafe { proc.set_reg(Reg::A0, e.code()) };
                Control::Resume
            }
        }
    }

    /// Polls the hart's preemption bit.
    pub(crate) fn check_preempt(&self, hartid: u64) -> Result<(), Excpt> {
        if self.plat().preempted(hartid) {
            Err(Excpt::Preempted)
        } else {
            Ok(())
        }
    }

    fn sys_get_info(&self, proc: &Proc, info: u64) -> Result<Control, Excpt> {
        let value = match info {
            0 => proc.pid() as u64,
            1 => self.plat().time_now(),
            2 => {
                // SAFETY: held by the calling hart.
                unsafe { proc.data() }.end_time
            }
            3 => {
                // SAFETY: held by the calling hart.
                let data = unsafe { proc.data() };
                let wcet = data.wcet;
                data.wcet = 0;
                wcet
            }
            _ => return Err(Excpt::Unimplemented),
        };
        // SAFETY: held by the calling hart.
        unsafe { proc.set_reg(Reg::A1, value) };
        Ok(Control::Resume)
    }

    fn sys_get_reg(&self, proc: &Proc, reg: u64) -> Result<Control, Excpt> {
        if reg >= REG_COUNT as u64 {
            return Err(Excpt::Index);
        }
        // SAFETY: held by the calling hart.
        unsafe {
            let value = proc.data().regs[reg as usize];
            proc.set_reg(Reg::A1, value);
        }
        Ok(Control::Resume)
    }

    fn sys_set_reg(&self, proc: &Proc, reg: u64, value: u64) -> Result<Control, Excpt> {
        if reg >= REG_COUNT as u64 {
            return Err(Excpt::Index);
        }
        // SAFETY: held by the calling hart.
        unsafe { proc.data().regs[reg as usize] = value };
        Ok(Control::Resume)
    }

    /// Sleeps until `until`, or just gives up the rest of the slice
    /// when `until` is 0.
    fn sys_yield(&self, proc: &Proc, until: u64) -> Result<Control, Excpt> {
        // SAFETY: held by the calling hart.
        let end_time = unsafe { proc.data() }.end_time;
        proc.set_sleep_until(if until == 0 { end_time } else { until });
        // The dispatcher leaves the registers alone on the yield path;
        // the exception code still goes out in `a0`.
        // SAFETY: held by the calling hart.
        unsafe { proc.set_reg(Reg::A0, Excpt::None.code()) };
        Ok(Control::Yield)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests_common::{ecall, test_kernel};

    #[test]
    fn info_and_registers_round_trip() {
        let k = test_kernel();
        let p = k.proc(0);
        assert!(p.acquire());

        let (ctl, a0) = ecall(k, 0, p, 0, &[0]);
        assert_eq!(ctl, Control::Resume);
        assert_eq!(a0, Excpt::None.code());
        // SAFETY: acquired above; the test stands in for the hart.
        assert_eq!(unsafe { p.reg(Reg::A1) }, 0, "pid");

        // Unknown info ids and syscall numbers are reported as such.
        let (_, a0) = ecall(k, 0, p, 0, &[9]);
        assert_eq!(a0, Excpt::Unimplemented.code());
        let (_, a0) = ecall(k, 0, p, 99, &[]);
        assert_eq!(a0, Excpt::Unimplemented.code());

        // set_reg/get_reg address the whole save area, virtual
        // registers included.
        let (_, a0) = ecall(k, 0, p, 2, &[Reg::Tpc as u64, 0x7000]);
        assert_eq!(a0, Excpt::None.code());
        let (_, a0) = ecall(k, 0, p, 1, &[Reg::Tpc as u64]);
        assert_eq!(a0, Excpt::None.code());
        // SAFETY: as above.
        assert_eq!(unsafe { p.reg(Reg::A1) }, 0x7000);
        let (_, a0) = ecall(k, 0, p, 1, &[REG_COUNT as u64]);
        assert_eq!(a0, Excpt::Index.code());

        // Each issued call advanced the saved pc past its ecall.
        // SAFETY: as above.
        assert_eq!(unsafe { p.reg(Reg::Pc) }, k.plat().payload() + 4 * 6);
    }
}

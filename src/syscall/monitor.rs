//! Monitor invocations: lifecycle and inspection of another process.
//!
//! A monitor capability over `[begin, end)` authorizes control of every
//! pid in `[free, end)`. Register and capability access additionally
//! takes the target busy (`monitor_acquire`), which is what keeps a
//! monitor and a scheduler from touching the same process at once.

use scopeguard::ScopeGuard;

use crate::cap::Cap;
use crate::ctable::CapPtr;
use crate::excpt::Excpt;
use crate::kernel::Kernel;
use crate::param::{N_PMP, REG_COUNT};
use crate::proc::{Proc, Reg};
use crate::syscall::Control;

impl Kernel {
    /// Checks the monitor capability and the target pid; returns the
    /// monitor's slot.
    fn mon_validate(&self, proc: &Proc, mon_cidx: u64, pid: u64) -> Result<CapPtr, Excpt> {
        let mon = CapPtr::new(proc.pid(), mon_cidx).ok_or(Excpt::Index)?;
        match self.ctable.cap(mon) {
            Cap::None => Err(Excpt::Empty),
            Cap::Monitor { free, end, .. } => {
                if free <= pid && pid < end {
                    Ok(mon)
                } else {
                    Err(Excpt::MonitorPid)
                }
            }
            _ => Err(Excpt::InvalidCap),
        }
    }

    pub(super) fn sys_mon_suspend(
        &self,
        proc: &Proc,
        mon_cidx: u64,
        pid: u64,
    ) -> Result<Control, Excpt> {
        let mon = self.mon_validate(proc, mon_cidx, pid)?;
        let _guard = self.ctable.lock();
        if self.ctable.is_empty(mon) {
            return Err(Excpt::Empty);
        }
        self.proc(pid as usize).suspend();
        Ok(Control::Resume)
    }

    pub(super) fn sys_mon_resume(
        &self,
        proc: &Proc,
        mon_cidx: u64,
        pid: u64,
    ) -> Result<Control, Excpt> {
        let mon = self.mon_validate(proc, mon_cidx, pid)?;
        let _guard = self.ctable.lock();
        if self.ctable.is_empty(mon) {
            return Err(Excpt::Empty);
        }
        self.proc(pid as usize).resume();
        Ok(Control::Resume)
    }

    pub(super) fn sys_mon_reg_get(
        &self,
        proc: &Proc,
        mon_cidx: u64,
        pid: u64,
        reg: u64,
    ) -> Result<Control, Excpt> {
        let mon = self.mon_validate(proc, mon_cidx, pid)?;
        if reg >= REG_COUNT as u64 {
            return Err(Excpt::Index);
        }
        let _guard = self.ctable.lock();
        if self.ctable.is_empty(mon) {
            return Err(Excpt::Empty);
        }
        let target = self.proc(pid as usize);
        if !target.monitor_acquire() {
            return Err(Excpt::MonitorBusy);
        }
        // SAFETY: the target was just taken busy.
        let value = unsafe { target.data() }.regs[reg as usize];
        target.release();
        // SAFETY: the caller is held by its hart.
        unsafe { proc.set_reg(Reg::A1, value) };
        Ok(Control::Resume)
    }

    pub(super) fn sys_mon_reg_set(
        &self,
        proc: &Proc,
        mon_cidx: u64,
        pid: u64,
        reg: u64,
        value: u64,
    ) -> Result<Control, Excpt> {
        let mon = self.mon_validate(proc, mon_cidx, pid)?;
        if reg >= REG_COUNT as u64 {
            return Err(Excpt::Index);
        }
        let _guard = self.ctable.lock();
        if self.ctable.is_empty(mon) {
            return Err(Excpt::Empty);
        }
        let target = self.proc(pid as usize);
        if !target.monitor_acquire() {
            return Err(Excpt::MonitorBusy);
        }
        // SAFETY: the target was just taken busy.
        unsafe { target.data() }.regs[reg as usize] = value;
        target.release();
        Ok(Control::Resume)
    }

    pub(super) fn sys_mon_cap_read(
        &self,
        proc: &Proc,
        mon_cidx: u64,
        pid: u64,
        cidx: u64,
    ) -> Result<Control, Excpt> {
        let mon = self.mon_validate(proc, mon_cidx, pid)?;
        let p = CapPtr::new(pid as usize, cidx).ok_or(Excpt::Index)?;
        let _guard = self.ctable.lock();
        if self.ctable.is_empty(mon) {
            return Err(Excpt::Empty);
        }
        let target = self.proc(pid as usize);
        if !target.monitor_acquire() {
            return Err(Excpt::MonitorBusy);
        }
        let raw = self.ctable.cap(p).raw();
        target.release();
        // SAFETY: the caller is held by its hart.
        unsafe { proc.set_reg(Reg::A1, raw) };
        Ok(Control::Resume)
    }

    /// Pulls a capability out of the monitored process.
    pub(super) fn sys_mon_cap_take(
        &self,
        proc: &Proc,
        mon_cidx: u64,
        pid: u64,
        src_cidx: u64,
        dst_cidx: u64,
    ) -> Result<Control, Excpt> {
        let src = CapPtr::new(pid as usize, src_cidx).ok_or(Excpt::Index)?;
        let dst = CapPtr::new(proc.pid(), dst_cidx).ok_or(Excpt::Index)?;
        self.mon_cap_transfer(proc, mon_cidx, pid, src, dst)
    }

    /// Pushes one of the caller's capabilities into the monitored
    /// process.
    pub(super) fn sys_mon_cap_give(
        &self,
        proc: &Proc,
        mon_cidx: u64,
        pid: u64,
        src_cidx: u64,
        dst_cidx: u64,
    ) -> Result<Control, Excpt> {
        let src = CapPtr::new(proc.pid(), src_cidx).ok_or(Excpt::Index)?;
        let dst = CapPtr::new(pid as usize, dst_cidx).ok_or(Excpt::Index)?;
        self.mon_cap_transfer(proc, mon_cidx, pid, src, dst)
    }

    fn mon_cap_transfer(
        &self,
        proc: &Proc,
        mon_cidx: u64,
        pid: u64,
        src: CapPtr,
        dst: CapPtr,
    ) -> Result<Control, Excpt> {
        let mon = self.mon_validate(proc, mon_cidx, pid)?;
        let mut guard = self.ctable.lock();
        if self.ctable.is_empty(mon) {
            return Err(Excpt::Empty);
        }
        if self.ctable.is_empty(src) {
            return Err(Excpt::Empty);
        }
        if !self.ctable.is_empty(dst) {
            return Err(Excpt::Collision);
        }
        let target = self.proc(pid as usize);
        if !target.monitor_acquire() {
            return Err(Excpt::MonitorBusy);
        }
        let result = self.move_with_hook(&mut guard, src, dst);
        target.release();
        result.map(|()| Control::Resume)
    }

    pub(super) fn sys_mon_pmp_load(
        &self,
        proc: &Proc,
        mon_cidx: u64,
        pid: u64,
        pmp_cidx: u64,
        pmpidx: u64,
    ) -> Result<Control, Excpt> {
        let mon = self.mon_validate(proc, mon_cidx, pid)?;
        let p = CapPtr::new(pid as usize, pmp_cidx).ok_or(Excpt::Index)?;
        if pmpidx >= N_PMP as u64 {
            return Err(Excpt::Index);
        }
        let mut guard = self.ctable.lock();
        if self.ctable.is_empty(mon) {
            return Err(Excpt::Empty);
        }
        let (rwx, used, addr) = match self.ctable.cap(p) {
            Cap::None => return Err(Excpt::Empty),
            Cap::Pmp { rwx, used, addr, .. } => (rwx, used, addr),
            _ => return Err(Excpt::InvalidCap),
        };
        let target = self.proc(pid as usize);
        if used || target.pmp_is_set(pmpidx as usize) {
            return Err(Excpt::Collision);
        }
        if !target.monitor_acquire() {
            return Err(Excpt::MonitorBusy);
        }
        target.pmp_set(pmpidx as usize, addr, rwx.bits());
        let shadow = scopeguard::guard((), |()| target.pmp_clear(pmpidx as usize));
        let result = guard.update(p, Cap::Pmp { rwx, used: true, index: pmpidx, addr });
        if result.is_ok() {
            let () = ScopeGuard::into_inner(shadow);
        }
        target.release();
        result.map(|()| Control::Resume)
    }

    pub(super) fn sys_mon_pmp_unload(
        &self,
        proc: &Proc,
        mon_cidx: u64,
        pid: u64,
        pmp_cidx: u64,
    ) -> Result<Control, Excpt> {
        let mon = self.mon_validate(proc, mon_cidx, pid)?;
        let p = CapPtr::new(pid as usize, pmp_cidx).ok_or(Excpt::Index)?;
        let mut guard = self.ctable.lock();
        if self.ctable.is_empty(mon) {
            return Err(Excpt::Empty);
        }
        let (rwx, used, index, addr) = match self.ctable.cap(p) {
            Cap::None => return Err(Excpt::Empty),
            Cap::Pmp { rwx, used, index, addr } => (rwx, used, index, addr),
            _ => return Err(Excpt::InvalidCap),
        };
        if !used {
            return Ok(Control::Resume);
        }
        let target = self.proc(pid as usize);
        if !target.monitor_acquire() {
            return Err(Excpt::MonitorBusy);
        }
        target.pmp_clear(index as usize);
        let result = guard.update(p, Cap::Pmp { rwx, used: false, index: 0, addr });
        target.release();
        result.map(|()| Control::Resume)
    }
}

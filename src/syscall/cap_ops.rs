//! Capability-table system calls and the per-kind hooks.
//!
//! Every mutation follows the same discipline: validate with lock-free
//! reads, poll preemption, then take the CDT lock, revalidate what the
//! decision depended on, and do the splice, the resource hook and the
//! payload update in one critical section.

use scopeguard::ScopeGuard;

use crate::cap::{self, Cap};
use crate::ctable::{CapPtr, CdtGuard};
use crate::excpt::Excpt;
use crate::kernel::Kernel;
use crate::param::N_PMP;
use crate::proc::Proc;
use crate::syscall::Control;

impl Kernel {
    fn now(&self) -> u64 {
        self.plat().time_now()
    }

    /// Adjusts resources when a capability changes hands, after the
    /// list splice and under the same critical section.
    ///
    /// A Time capability's unallocated slots follow their owner to the
    /// destination's schedule column; a bound PMP frame is torn out of
    /// the source's shadow, since the binding never travels.
    pub(crate) fn move_with_hook(
        &self,
        guard: &mut CdtGuard<'_>,
        src: CapPtr,
        dst: CapPtr,
    ) -> Result<(), Excpt> {
        let moved = guard.move_cap(src, dst)?;
        if src.pid() == dst.pid() {
            return Ok(());
        }
        match moved {
            Cap::Time { hart, free, end, .. } => {
                self.schedule.update(self.now(), dst.pid(), end, hart, free, end);
            }
            Cap::Pmp { rwx, used: true, index, addr } => {
                self.proc(src.pid()).pmp_clear(index as usize);
                guard.update(dst, Cap::Pmp { rwx, used: false, index: 0, addr })?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Returns a deleted capability's resources to the system: the
    /// unallocated tail of a Time slice leaves the schedule, a bound
    /// PMP frame leaves its owner's shadow.
    fn delete_hook(&self, pid: usize, cap: Cap) {
        match cap {
            Cap::Time { hart, free, end, .. } => {
                self.schedule.remove(self.now(), hart, free, end);
            }
            Cap::Pmp { used: true, index, .. } => {
                self.proc(pid).pmp_clear(index as usize);
            }
            _ => {}
        }
    }

    /// Folds a just-deleted descendant back into the capability being
    /// revoked and stores the result. Returns the folded capability for
    /// the next loop iteration.
    fn revoke_fold(
        &self,
        guard: &mut CdtGuard<'_>,
        src: CapPtr,
        src_cap: Cap,
        child_ptr: CapPtr,
        child: Cap,
    ) -> Result<Cap, Excpt> {
        let folded = match (src_cap, child) {
            (
                Cap::Time { hart, begin, end, .. },
                Cap::Time { free: cfree, end: cend, .. },
            ) => {
                // The child's unallocated slots come home; whatever it
                // had carved out further is owned by deeper descendants
                // that this same loop is about to fold.
                self.schedule.update(self.now(), src.pid(), end, hart, cfree, cend);
                Cap::Time { hart, begin, free: cfree, end }
            }
            (
                Cap::Memory { rwx, offset, begin, end, .. },
                Cap::Memory { lock: clock, free: cfree, .. },
            ) => Cap::Memory { rwx, lock: clock, offset, begin, free: cfree, end },
            (_, Cap::Pmp { used: true, index, .. }) => {
                self.proc(child_ptr.pid()).pmp_clear(index as usize);
                src_cap
            }
            (Cap::Monitor { begin, end, .. }, Cap::Monitor { free: cfree, .. }) => {
                Cap::Monitor { begin, free: cfree, end }
            }
            (Cap::Channel { begin, end, .. }, Cap::Channel { free: cfree, .. }) => {
                Cap::Channel { begin, free: cfree, end }
            }
            _ => src_cap,
        };
        if folded != src_cap {
            guard.update(src, folded)?;
        }
        Ok(folded)
    }

    /// Final step of a revocation: the watermark rewinds to `begin`,
    /// the Memory lock clears, and a Time capability gets its whole
    /// range back in the schedule.
    fn restore(&self, guard: &mut CdtGuard<'_>, src: CapPtr, src_cap: Cap) -> Result<(), Excpt> {
        let restored = match src_cap {
            Cap::Time { hart, begin, free, end } => {
                self.schedule.update(self.now(), src.pid(), end, hart, begin, free);
                Cap::Time { hart, begin, free: begin, end }
            }
            Cap::Memory { rwx, offset, begin, end, .. } => {
                Cap::Memory { rwx, lock: false, offset, begin, free: begin, end }
            }
            Cap::Monitor { begin, end, .. } => Cap::Monitor { begin, free: begin, end },
            Cap::Channel { begin, end, .. } => Cap::Channel { begin, free: begin, end },
            other => other,
        };
        if restored != src_cap {
            guard.update(src, restored)?;
        }
        Ok(())
    }

    /// Advances the parent's watermark past a fresh derivation and
    /// publishes the newcomer's resources.
    fn derive_fold(&self, pid: usize, src_cap: Cap, new: &Cap) -> Cap {
        match (src_cap, new) {
            (
                Cap::Time { hart, begin, end, .. },
                Cap::Time { begin: nbegin, end: nend, .. },
            ) => {
                self.schedule.update(self.now(), pid, *nend, hart, *nbegin, *nend);
                Cap::Time { hart, begin, free: *nend, end }
            }
            (
                Cap::Memory { rwx, lock, offset, begin, end, .. },
                Cap::Memory { end: nend, .. },
            ) => Cap::Memory { rwx, lock, offset, begin, free: *nend, end },
            (
                Cap::Memory { rwx, offset, begin, free, end, .. },
                Cap::Pmp { .. },
            ) => Cap::Memory { rwx, lock: true, offset, begin, free, end },
            (
                Cap::Monitor { begin, end, .. },
                Cap::Monitor { end: nend, .. },
            ) => Cap::Monitor { begin, free: *nend, end },
            (
                Cap::Channel { begin, end, .. },
                Cap::Channel { end: nend, .. },
            ) => Cap::Channel { begin, free: *nend, end },
            (
                Cap::Channel { begin, end, .. },
                Cap::Socket { channel, tag: 0 },
            ) => Cap::Channel { begin, free: channel + 1, end },
            _ => src_cap,
        }
    }

    pub(super) fn sys_cap_read(&self, proc: &Proc, cidx: u64) -> Result<Control, Excpt> {
        let p = CapPtr::new(proc.pid(), cidx).ok_or(Excpt::Index)?;
        let cap = self.ctable.cap(p);
        if cap.is_none() {
            return Err(Excpt::Empty);
        }
        // SAFETY: held by the calling hart.
        unsafe { proc.set_reg(crate::proc::Reg::A1, cap.raw()) };
        Ok(Control::Resume)
    }

    pub(super) fn sys_cap_move(
        &self,
        hartid: u64,
        proc: &Proc,
        src_cidx: u64,
        dst_cidx: u64,
    ) -> Result<Control, Excpt> {
        let src = CapPtr::new(proc.pid(), src_cidx).ok_or(Excpt::Index)?;
        let dst = CapPtr::new(proc.pid(), dst_cidx).ok_or(Excpt::Index)?;
        if self.ctable.is_empty(src) {
            return Err(Excpt::Empty);
        }
        if !self.ctable.is_empty(dst) {
            return Err(Excpt::Collision);
        }
        self.check_preempt(hartid)?;
        let mut guard = self.ctable.lock();
        // Same table, so no resource hook can apply.
        let _ = guard.move_cap(src, dst)?;
        Ok(Control::Resume)
    }

    pub(super) fn sys_cap_delete(
        &self,
        hartid: u64,
        proc: &Proc,
        cidx: u64,
    ) -> Result<Control, Excpt> {
        let p = CapPtr::new(proc.pid(), cidx).ok_or(Excpt::Index)?;
        if self.ctable.is_empty(p) {
            return Err(Excpt::Empty);
        }
        self.check_preempt(hartid)?;
        let mut guard = self.ctable.lock();
        let cap = guard.delete(p)?;
        self.delete_hook(p.pid(), cap);
        Ok(Control::Resume)
    }

    /// Removes every descendant of the capability at `cidx` and
    /// reclaims their resources.
    ///
    /// The loop is cooperative: the lock is held for one descendant at
    /// a time, the preemption bit is polled between iterations, and
    /// every observation made without the lock is revalidated by
    /// `delete_if` before anything is touched. Re-issuing the call
    /// after `Preempted` resumes exactly where the table stands.
    pub(super) fn sys_cap_revoke(
        &self,
        hartid: u64,
        proc: &Proc,
        cidx: u64,
    ) -> Result<Control, Excpt> {
        let src = CapPtr::new(proc.pid(), cidx).ok_or(Excpt::Index)?;
        if self.ctable.is_empty(src) {
            return Err(Excpt::Empty);
        }

        loop {
            let src_cap = self.ctable.cap(src);
            if src_cap.is_none() {
                // Someone revoked us while we were revoking.
                return Err(Excpt::Empty);
            }
            let next = self.ctable.next(src);
            let next_cap = self.ctable.cap(next);
            if !cap::is_child(&src_cap, &next_cap) {
                break;
            }
            self.check_preempt(hartid)?;

            let mut guard = self.ctable.lock();
            if guard.delete_if(next, next_cap, src) {
                let _ = self.revoke_fold(&mut guard, src, src_cap, next, next_cap)?;
            }
            // On a stale observation the next round re-reads; nothing
            // was modified.
        }

        self.check_preempt(hartid)?;
        let mut guard = self.ctable.lock();
        let src_cap = self.ctable.cap(src);
        if src_cap.is_none() {
            return Err(Excpt::Empty);
        }
        self.restore(&mut guard, src, src_cap)?;
        Ok(Control::Resume)
    }

    pub(super) fn sys_cap_derive(
        &self,
        hartid: u64,
        proc: &Proc,
        src_cidx: u64,
        dst_cidx: u64,
        new_raw: u64,
    ) -> Result<Control, Excpt> {
        let src = CapPtr::new(proc.pid(), src_cidx).ok_or(Excpt::Index)?;
        let dst = CapPtr::new(proc.pid(), dst_cidx).ok_or(Excpt::Index)?;
        if self.ctable.is_empty(src) {
            return Err(Excpt::Empty);
        }
        if !self.ctable.is_empty(dst) {
            return Err(Excpt::Collision);
        }
        let new = Cap::from_raw(new_raw);
        if !cap::is_derivable_from(&self.ctable.cap(src), &new) {
            return Err(Excpt::Derivation);
        }
        self.check_preempt(hartid)?;

        let mut guard = self.ctable.lock();
        // A concurrent revoke may have rewound or emptied the parent
        // since the unlocked check.
        let src_cap = self.ctable.cap(src);
        if src_cap.is_none() {
            return Err(Excpt::Empty);
        }
        if !cap::is_derivable_from(&src_cap, &new) {
            return Err(Excpt::Derivation);
        }
        guard.insert(dst, new, src)?;
        let folded = self.derive_fold(src.pid(), src_cap, &new);
        guard.update(src, folded)?;
        Ok(Control::Resume)
    }

    pub(super) fn sys_pmp_load(
        &self,
        hartid: u64,
        proc: &Proc,
        cidx: u64,
        pmpidx: u64,
    ) -> Result<Control, Excpt> {
        let p = CapPtr::new(proc.pid(), cidx).ok_or(Excpt::Index)?;
        if pmpidx >= N_PMP as u64 {
            return Err(Excpt::Index);
        }
        let (rwx, used, addr) = match self.ctable.cap(p) {
            Cap::None => return Err(Excpt::Empty),
            Cap::Pmp { rwx, used, addr, .. } => (rwx, used, addr),
            _ => return Err(Excpt::InvalidCap),
        };
        if used || proc.pmp_is_set(pmpidx as usize) {
            return Err(Excpt::Collision);
        }
        self.check_preempt(hartid)?;

        let mut guard = self.ctable.lock();
        if self.ctable.is_empty(p) {
            return Err(Excpt::Empty);
        }
        // Shadow first, then the capability word; the shadow write is
        // undone if the slot update cannot go through, so no PMP slot
        // is ever active without a live capability naming it.
        proc.pmp_set(pmpidx as usize, addr, rwx.bits());
        let shadow = scopeguard::guard((), |()| proc.pmp_clear(pmpidx as usize));
        guard.update(p, Cap::Pmp { rwx, used: true, index: pmpidx, addr })?;
        let () = ScopeGuard::into_inner(shadow);
        Ok(Control::Resume)
    }

    pub(super) fn sys_pmp_unload(
        &self,
        hartid: u64,
        proc: &Proc,
        cidx: u64,
    ) -> Result<Control, Excpt> {
        let p = CapPtr::new(proc.pid(), cidx).ok_or(Excpt::Index)?;
        let (rwx, used, index, addr) = match self.ctable.cap(p) {
            Cap::None => return Err(Excpt::Empty),
            Cap::Pmp { rwx, used, index, addr } => (rwx, used, index, addr),
            _ => return Err(Excpt::InvalidCap),
        };
        if !used {
            return Ok(Control::Resume);
        }
        self.check_preempt(hartid)?;

        let mut guard = self.ctable.lock();
        if self.ctable.is_empty(p) {
            return Err(Excpt::Empty);
        }
        proc.pmp_clear(index as usize);
        guard.update(p, Cap::Pmp { rwx, used: false, index: 0, addr })?;
        Ok(Control::Resume)
    }
}

//! User exception delegation.
//!
//! Ordinary user exceptions do not enter the kernel proper: the trap
//! path banks the faulting `pc`/`sp` into the virtual exception
//! registers and vectors the process to its own handler (`tpc`/`tsp`).
//! Executing any of the return instructions (illegal in user mode) is
//! the matching "return from exception" and restores the banked state.

use crate::kernel::Kernel;
use crate::proc::{Proc, Reg};

const ILLEGAL_INSTRUCTION: u64 = 0x2;

const MRET: u64 = 0x3020_0073;
const SRET: u64 = 0x1020_0073;
const URET: u64 = 0x0020_0073;

impl Kernel {
    /// Handles a user-mode exception described by `mcause`/`mtval`.
    /// The calling hart holds the process; its registers are saved.
    pub fn handle_exception(&self, proc: &Proc, mcause: u64, mtval: u64) {
        if mcause == ILLEGAL_INSTRUCTION && (mtval == MRET || mtval == SRET || mtval == URET) {
            self.handle_exception_return(proc);
        } else {
            // SAFETY: held by the calling hart.
            let regs = &mut unsafe { proc.data() }.regs;
            regs[Reg::Ecause as usize] = mcause;
            regs[Reg::Eval as usize] = mtval;
            regs[Reg::Epc as usize] = regs[Reg::Pc as usize];
            regs[Reg::Esp as usize] = regs[Reg::Sp as usize];
            regs[Reg::Pc as usize] = regs[Reg::Tpc as usize];
            regs[Reg::Sp as usize] = regs[Reg::Tsp as usize];
        }
    }

    fn handle_exception_return(&self, proc: &Proc) {
        // SAFETY: held by the calling hart.
        let regs = &mut unsafe { proc.data() }.regs;
        regs[Reg::Pc as usize] = regs[Reg::Epc as usize];
        regs[Reg::Sp as usize] = regs[Reg::Esp as usize];
        regs[Reg::Ecause as usize] = 0;
        regs[Reg::Eval as usize] = 0;
        regs[Reg::Epc as usize] = 0;
        regs[Reg::Esp as usize] = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests_common::test_kernel;

    #[test]
    fn exceptions_bank_and_vector() {
        let k = test_kernel();
        let p = k.proc(0);
        assert!(p.acquire());
        // SAFETY: acquired above.
        unsafe {
            p.set_reg(Reg::Pc, 0x1000);
            p.set_reg(Reg::Sp, 0x2000);
            p.set_reg(Reg::Tpc, 0x3000);
            p.set_reg(Reg::Tsp, 0x4000);
        }
        k.handle_exception(p, 5, 0xdead);
        // SAFETY: still held.
        unsafe {
            assert_eq!(p.reg(Reg::Pc), 0x3000);
            assert_eq!(p.reg(Reg::Sp), 0x4000);
            assert_eq!(p.reg(Reg::Epc), 0x1000);
            assert_eq!(p.reg(Reg::Esp), 0x2000);
            assert_eq!(p.reg(Reg::Ecause), 5);
            assert_eq!(p.reg(Reg::Eval), 0xdead);
        }

        // `mret` in user mode is the way back.
        k.handle_exception(p, ILLEGAL_INSTRUCTION, MRET);
        // SAFETY: still held.
        unsafe {
            assert_eq!(p.reg(Reg::Pc), 0x1000);
            assert_eq!(p.reg(Reg::Sp), 0x2000);
            assert_eq!(p.reg(Reg::Ecause), 0);
            assert_eq!(p.reg(Reg::Epc), 0);
        }
    }
}
